//! The command line we start Tor with.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::config::LauncherConfig;
use crate::host::StartFailure;

/// A program and its arguments.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TorCommandLine {
    /// The program to run.
    program: PathBuf,
    /// Its arguments.
    args: Vec<OsString>,
}

/// Inputs for [`TorCommandLine::build`] that aren't in the configuration.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct LaunchParams {
    /// Value for `HashedControlPassword`, if we authenticate with a password.
    pub hashed_password: Option<String>,
    /// Our process ID, so that Tor exits when we do.
    pub owner_pid: u32,
    /// Start with the network disabled.
    pub disable_network: bool,
}

impl LaunchParams {
    /// Return a new set of launch parameters.
    pub fn new(hashed_password: Option<String>, owner_pid: u32, disable_network: bool) -> Self {
        LaunchParams {
            hashed_password,
            owner_pid,
            disable_network,
        }
    }
}

impl TorCommandLine {
    /// Build the command line for starting Tor.
    ///
    /// Fails if the configuration names no torrc or no data directory.
    pub fn build(config: &LauncherConfig, params: &LaunchParams) -> Result<Self, StartFailure> {
        let torrc = config
            .torrc()
            .ok_or_else(|| StartFailure::new("torrc_missing"))?;
        let data_dir = config
            .data_directory()
            .ok_or_else(|| StartFailure::new("datadir_missing"))?;

        let mut cmd = TorCommandLine {
            program: config.tor_binary().clone(),
            args: Vec::new(),
        };
        if let Some(defaults) = config.torrc_defaults() {
            cmd.arg("--defaults-torrc").arg(defaults);
        }
        cmd.arg("-f").arg(torrc);
        cmd.arg("DataDirectory").arg(data_dir);
        cmd.arg("GeoIPFile").arg(data_dir.join("geoip"));
        cmd.arg("GeoIPv6File").arg(data_dir.join("geoip6"));
        if let Some(hashed) = &params.hashed_password {
            cmd.arg("HashedControlPassword").arg(hashed);
        }
        cmd.arg("__OwningControllerProcess")
            .arg(params.owner_pid.to_string());
        if params.disable_network {
            cmd.arg("DisableNetwork").arg("1");
        }
        Ok(cmd)
    }

    /// Append an argument.
    fn arg(&mut self, arg: impl AsRef<std::ffi::OsStr>) -> &mut Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    /// Return the program to run.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Return the arguments.
    pub fn args(&self) -> &[OsString] {
        &self.args
    }
}

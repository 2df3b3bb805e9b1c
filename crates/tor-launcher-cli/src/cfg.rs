//! Configuration for the `tor-launcher` command line application.
//
// (This module is called `cfg` to match the other command-line crates.)

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use tor_config::{ConfigBuildError, impl_standard_builder};
use tor_launcher::{LauncherConfig, LauncherConfigBuilder};

use crate::logging::{LoggingConfig, LoggingConfigBuilder};

/// Where we look for a configuration file if none is given.
pub(crate) const DEFAULT_CONFIG_FILE: &str = "tor-launcher.toml";

/// Everything in a `tor-launcher` configuration file.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(error = "ConfigBuildError"))]
#[builder(derive(Debug, Serialize, Deserialize))]
pub(crate) struct CliConfig {
    /// How to start and supervise Tor.
    #[builder(sub_builder)]
    #[builder_field_attr(serde(default))]
    launcher: LauncherConfig,

    /// How to log.
    #[builder(sub_builder)]
    #[builder_field_attr(serde(default))]
    logging: LoggingConfig,

    /// Where to keep preferences between runs.
    ///
    /// If unset, preferences last only as long as the process.
    #[builder(default, setter(strip_option))]
    #[builder_field_attr(serde(default))]
    preferences_file: Option<PathBuf>,
}
impl_standard_builder! { CliConfig }

impl CliConfig {
    /// Return the launcher configuration.
    pub(crate) fn launcher(&self) -> &LauncherConfig {
        &self.launcher
    }

    /// Return the logging configuration.
    pub(crate) fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    /// Return the preferences file, if there is one.
    pub(crate) fn preferences_file(&self) -> Option<&Path> {
        self.preferences_file.as_deref()
    }
}

/// Parse a configuration from TOML text.
pub(crate) fn parse_config(text: &str) -> Result<CliConfig> {
    let builder: CliConfigBuilder = toml::from_str(text).context("Malformed configuration")?;
    Ok(builder.build()?)
}

/// Load the configuration file at `path`.
///
/// If no `path` is given, the default file is read if it exists, and the
/// defaults are used if it doesn't.
pub(crate) fn load_config(path: Option<&Path>) -> Result<CliConfig> {
    let (path, required) = match path {
        Some(p) => (p, true),
        None => (Path::new(DEFAULT_CONFIG_FILE), false),
    };
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("Can't read {}", path.display()));
        }
    };
    parse_config(&text).with_context(|| format!("in {}", path.display()))
}

//! Configuration for the launcher.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use tor_config::{ConfigBuildError, impl_standard_builder};
use tor_ctlproto::{ControlPortConfig, ControlPortConfigBuilder};

/// Configuration for a [`ProcessSupervisor`](crate::ProcessSupervisor).
///
/// This type is immutable once constructed. To make one, use
/// [`LauncherConfigBuilder`], or deserialize it from a string.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(error = "ConfigBuildError"))]
#[builder(derive(Debug, Serialize, Deserialize))]
pub struct LauncherConfig {
    /// How to reach the control port.
    #[builder(sub_builder)]
    #[builder_field_attr(serde(default))]
    control: ControlPortConfig,

    /// The Tor program to run.
    #[builder(default = "PathBuf::from(\"tor\")")]
    #[builder_field_attr(serde(default))]
    tor_binary: PathBuf,

    /// The torrc file to give Tor.
    #[builder(default, setter(strip_option))]
    #[builder_field_attr(serde(default))]
    torrc: Option<PathBuf>,

    /// A torrc with defaults, read before `torrc`.
    #[builder(default, setter(strip_option))]
    #[builder_field_attr(serde(default))]
    torrc_defaults: Option<PathBuf>,

    /// Tor's data directory.
    #[builder(default, setter(strip_option))]
    #[builder_field_attr(serde(default))]
    data_directory: Option<PathBuf>,

    /// How often to ask whether the Tor process is still running.
    #[builder(default = "Duration::from_millis(500)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    status_poll_interval: Duration,

    /// How to wait for the control port to come up.
    #[builder(sub_builder)]
    #[builder_field_attr(serde(default))]
    backoff: BackoffConfig,

    /// Preference values to use when nothing has been stored.
    #[builder(sub_builder)]
    #[builder_field_attr(serde(default))]
    preferences: PreferenceDefaults,
}
impl_standard_builder! { LauncherConfig }

impl LauncherConfig {
    /// Return the control port configuration.
    pub fn control(&self) -> &ControlPortConfig {
        &self.control
    }

    /// Return the Tor program to run.
    pub fn tor_binary(&self) -> &PathBuf {
        &self.tor_binary
    }

    /// Return the torrc file, if one is configured.
    pub fn torrc(&self) -> Option<&PathBuf> {
        self.torrc.as_ref()
    }

    /// Return the defaults torrc file, if one is configured.
    pub fn torrc_defaults(&self) -> Option<&PathBuf> {
        self.torrc_defaults.as_ref()
    }

    /// Return Tor's data directory, if one is configured.
    pub fn data_directory(&self) -> Option<&PathBuf> {
        self.data_directory.as_ref()
    }

    /// Return the process status polling interval.
    pub fn status_poll_interval(&self) -> Duration {
        self.status_poll_interval
    }

    /// Return the control port backoff configuration.
    pub fn backoff(&self) -> &BackoffConfig {
        &self.backoff
    }

    /// Return the preference defaults.
    pub fn preferences(&self) -> &PreferenceDefaults {
        &self.preferences
    }
}

/// Default for [`BackoffConfig::initial_delay`].
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(25);

/// Default for [`BackoffConfig::max_delay`].
const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(500);

/// How we retry while waiting for a new Tor process's control port.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(validate = "Self::validate", error = "ConfigBuildError"))]
#[builder(derive(Debug, Serialize, Deserialize))]
pub struct BackoffConfig {
    /// Delay before the first attempt.
    #[builder(default = "DEFAULT_INITIAL_DELAY")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    initial_delay: Duration,

    /// Longest delay between attempts.
    #[builder(default = "DEFAULT_MAX_DELAY")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    max_delay: Duration,

    /// Give up once this long has passed since Tor was started.
    #[builder(default = "Duration::from_secs(30)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    give_up_after: Duration,
}
impl_standard_builder! { BackoffConfig }

impl BackoffConfigBuilder {
    /// Check that the delays make sense together.
    fn validate(&self) -> Result<(), ConfigBuildError> {
        let initial = self.initial_delay.unwrap_or(DEFAULT_INITIAL_DELAY);
        let max = self.max_delay.unwrap_or(DEFAULT_MAX_DELAY);
        if initial > max {
            return Err(ConfigBuildError::Inconsistent {
                fields: vec!["initial_delay".to_owned(), "max_delay".to_owned()],
                problem: "initial_delay is longer than max_delay".to_owned(),
            });
        }
        if initial.is_zero() {
            return Err(ConfigBuildError::Invalid {
                field: "initial_delay".to_owned(),
                problem: "must not be zero".to_owned(),
            });
        }
        Ok(())
    }
}

impl BackoffConfig {
    /// Return the delay before the first attempt.
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Return the longest delay between attempts.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Return how long to keep trying.
    pub fn give_up_after(&self) -> Duration {
        self.give_up_after
    }
}

/// Preference values used until the user (or the launcher) stores others.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(error = "ConfigBuildError"))]
#[builder(derive(Debug, Serialize, Deserialize))]
pub struct PreferenceDefaults {
    /// Whether we start a Tor process of our own.
    #[builder(default = "true")]
    #[builder_field_attr(serde(default))]
    start_tor: bool,

    /// Whether to show network settings before Tor connects to the network.
    #[builder(default = "true")]
    #[builder_field_attr(serde(default))]
    prompt_at_startup: bool,

    /// Whether we only configure a Tor process that somebody else started.
    #[builder(default = "false")]
    #[builder_field_attr(serde(default))]
    only_configure_tor: bool,

    /// Which default bridges to use, if any.
    #[builder(default, setter(strip_option))]
    #[builder_field_attr(serde(default))]
    default_bridge_type: Option<String>,

    /// The default bridges we know about, by transport type.
    #[builder(default)]
    #[builder_field_attr(serde(default))]
    default_bridges: BTreeMap<String, Vec<String>>,
}
impl_standard_builder! { PreferenceDefaults }

impl PreferenceDefaults {
    /// Return the default for "start Tor".
    pub fn start_tor(&self) -> bool {
        self.start_tor
    }

    /// Return the default for "prompt at startup".
    pub fn prompt_at_startup(&self) -> bool {
        self.prompt_at_startup
    }

    /// Return the default for "only configure Tor".
    pub fn only_configure_tor(&self) -> bool {
        self.only_configure_tor
    }

    /// Return the default bridge type, if any.
    pub fn default_bridge_type(&self) -> Option<&str> {
        self.default_bridge_type.as_deref()
    }

    /// Return the known default bridges.
    pub fn default_bridges(&self) -> &BTreeMap<String, Vec<String>> {
        &self.default_bridges
    }
}

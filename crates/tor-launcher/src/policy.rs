//! Deciding what to do at startup.
//!
//! Each decision can be forced by an environment variable; otherwise it
//! comes from the stored preferences.

use tracing::debug;

use crate::host::Environment;
use crate::prefs::Preferences;

/// If set, `1` means "don't start Tor"; anything else means "start it".
pub const ENV_SKIP_LAUNCH: &str = "TOR_SKIP_LAUNCH";
/// If set, `1` means "show network settings before connecting".
pub const ENV_FORCE_NET_CONFIG: &str = "TOR_FORCE_NET_CONFIG";
/// If set, `1` means "configure the running Tor, don't start one".
pub const ENV_CONFIGURE_ONLY: &str = "TOR_CONFIGURE_ONLY";

/// What to do at startup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(clippy::exhaustive_structs)]
pub struct StartupPolicy {
    /// Start a Tor process and own it.
    pub start_and_own_tor: bool,
    /// Show the network settings before letting Tor use the network.
    pub show_network_settings: bool,
    /// Only configure a Tor process that somebody else started.
    pub only_configure_tor: bool,
}

/// Return `Some(value == "1")` if `name` is set in `env`.
fn env_flag(env: &dyn Environment, name: &str) -> Option<bool> {
    env.var(name).map(|v| v == "1")
}

impl StartupPolicy {
    /// Work out the policy from `env`, falling back to `prefs`.
    pub fn resolve(env: &dyn Environment, prefs: &Preferences) -> Self {
        let policy = StartupPolicy {
            start_and_own_tor: env_flag(env, ENV_SKIP_LAUNCH)
                .map(|skip| !skip)
                .unwrap_or_else(|| prefs.start_tor()),
            show_network_settings: env_flag(env, ENV_FORCE_NET_CONFIG)
                .unwrap_or_else(|| prefs.prompt_at_startup()),
            only_configure_tor: env_flag(env, ENV_CONFIGURE_ONLY)
                .unwrap_or_else(|| prefs.only_configure_tor()),
        };
        debug!("Startup policy: {:?}", policy);
        policy
    }
}

//! Configuration for talking to a control port.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use tor_config::{ConfigBuildError, impl_standard_builder};

/// The address where Tor Browser's tor listens for control connections.
const DEFAULT_CONTROL_PORT: u16 = 9151;

/// Configuration for a [`ProtocolClient`](crate::ProtocolClient).
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(error = "ConfigBuildError"))]
#[builder(derive(Debug, Serialize, Deserialize))]
pub struct ControlPortConfig {
    /// Address of the control port.
    #[builder(default = "default_address()")]
    #[builder_field_attr(serde(default))]
    address: SocketAddr,

    /// How long to wait for the reply to any single command.
    #[builder(default = "Duration::from_secs(15)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    command_timeout: Duration,

    /// How many log messages from Tor to remember.
    #[builder(default = "1000")]
    #[builder_field_attr(serde(default))]
    max_log_entries: usize,
}
impl_standard_builder! { ControlPortConfig }

/// Return the default control port address.
fn default_address() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_CONTROL_PORT))
}

impl ControlPortConfig {
    /// Return the address of the control port.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Return the per-command timeout.
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Return the capacity of the captured-log buffer.
    pub fn max_log_entries(&self) -> usize {
        self.max_log_entries
    }

    /// Return a copy of this configuration, pointing at a different address.
    ///
    /// Used when the address is supplied by the environment rather than by
    /// a configuration file.
    pub fn with_address(&self, address: SocketAddr) -> Self {
        ControlPortConfig {
            address,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->

    use super::*;

    #[test]
    fn defaults() {
        let cfg = ControlPortConfig::default();
        assert_eq!(cfg.address(), "127.0.0.1:9151".parse().unwrap());
        assert_eq!(cfg.command_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.max_log_entries(), 1000);
    }

    #[test]
    fn build() {
        let cfg = ControlPortConfig::builder()
            .address("127.0.0.1:9051".parse().unwrap())
            .command_timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        assert_eq!(cfg.address().port(), 9051);
        assert_eq!(cfg.command_timeout(), Duration::from_secs(2));

        let moved = cfg.with_address("127.0.0.1:1".parse().unwrap());
        assert_eq!(moved.address().port(), 1);
        assert_eq!(moved.command_timeout(), Duration::from_secs(2));
    }
}

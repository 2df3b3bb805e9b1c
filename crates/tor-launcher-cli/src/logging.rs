//! Configure tracing subscribers for `tor-launcher`.

use std::io::IsTerminal as _;
use std::str::FromStr;

use anyhow::{Context as _, Result};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use tor_config::{ConfigBuildError, impl_standard_builder};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Layer, fmt, registry};

/// The console filter used when nothing else is configured.
const DEFAULT_CONSOLE_FILTER: &str = "info";

/// Structure to hold our logging configuration options.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(error = "ConfigBuildError"))]
#[builder(derive(Debug, Serialize, Deserialize))]
pub(crate) struct LoggingConfig {
    /// Filtering directives that determine tracing levels as described at
    /// <https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/targets/struct.Targets.html#impl-FromStr>
    ///
    /// You can override this setting with the -l, --log-level command line parameter.
    ///
    /// Example: "info,tor_ctlproto::pool=trace"
    #[builder(default = "Some(DEFAULT_CONSOLE_FILTER.to_owned())", setter(into, strip_option))]
    #[builder_field_attr(serde(default))]
    console: Option<String>,

    /// Whether to use color, if the console supports it.
    #[builder(default = "true")]
    #[builder_field_attr(serde(default))]
    color: bool,
}
impl_standard_builder! { LoggingConfig }

impl LoggingConfig {
    /// Return the console filter, if one is configured.
    pub(crate) fn console(&self) -> Option<&str> {
        self.console.as_deref()
    }
}

/// As [`Targets::from_str`], but wrapped in an [`anyhow::Result`].
fn filt_from_str_verbose(s: &str, source: &str) -> Result<Targets> {
    Targets::from_str(s).with_context(|| format!("in {}", source))
}

/// Return the filter for console logging.
///
/// The command line takes priority over the configuration.
fn console_filter(config: &LoggingConfig, cli: Option<&str>) -> Result<Targets> {
    match (cli, config.console()) {
        (Some(s), _) => filt_from_str_verbose(s, "--log-level command line parameter"),
        (None, Some(s)) => filt_from_str_verbose(s, "logging.console"),
        (None, None) => filt_from_str_verbose(DEFAULT_CONSOLE_FILTER, "default"),
    }
}

/// Set up logging to stderr.
///
/// Secrets are wrapped in `safelog::Sensitive` wherever we hold them, so
/// nothing here needs to scrub them.
pub(crate) fn setup_logging(config: &LoggingConfig, cli: Option<&str>) -> Result<()> {
    let filter = console_filter(config, cli)?;
    let use_color = config.color && std::io::stderr().is_terminal();
    let layer = fmt::Layer::default()
        .with_ansi(use_color)
        .with_writer(std::io::stderr)
        .with_filter(filter);
    registry()
        .with(layer)
        .try_init()
        .context("Unable to install log subscriber")?;
    Ok(())
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
    use tracing::Level;

    #[test]
    fn filters() {
        let cfg = LoggingConfig::default();
        assert_eq!(cfg.console(), Some("info"));

        let f = console_filter(&cfg, None).unwrap();
        assert!(f.would_enable("tor_launcher", &Level::INFO));
        assert!(!f.would_enable("tor_launcher", &Level::DEBUG));

        let f = console_filter(&cfg, Some("warn,tor_ctlproto=trace")).unwrap();
        assert!(!f.would_enable("tor_launcher", &Level::INFO));
        assert!(f.would_enable("tor_ctlproto::pool", &Level::TRACE));

        let mut bld = LoggingConfig::builder();
        bld.console("debug");
        let f = console_filter(&bld.build().unwrap(), None).unwrap();
        assert!(f.would_enable("tor_launcher", &Level::DEBUG));

        let err = console_filter(&cfg, Some("info,tor_launcher=loud")).unwrap_err();
        assert!(format!("{:#}", err).contains("--log-level"));
    }
}

//! A command-line launcher and supervisor for Tor.
//!
//! `tor-launcher` starts a Tor process, takes ownership of it over the
//! control port, reports its bootstrap progress, and asks for network
//! settings when Tor can't connect on its own.  It can also inspect and
//! reconfigure a Tor process that is already running.
//!
//! # Command-line interface
//!
//! (This is not stable; future versions will break this.)
//!
//! `tor-launcher` uses the [`clap`](https://docs.rs/clap/) crate for
//! command-line argument parsing; run `tor-launcher help` to get it to
//! print its documentation.
//!
//! # Configuration
//!
//! By default, `tor-launcher` reads `tor-launcher.toml` from the current
//! directory, if there is one; `-c` names a different file.  The
//! environment variables that the launcher has always honored (such as
//! `TOR_SKIP_LAUNCH` and `TOR_CONTROL_PASSWD`) still override it.

// @@ begin lint list maintained by maint/add_warning @@
#![cfg_attr(not(ci_arti_stable), allow(renamed_and_removed_lints))]
#![cfg_attr(not(ci_arti_nightly), allow(unknown_lints))]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_in_scrutinee)] // arti/-/merge_requests/588/#note_2812945
#![allow(clippy::result_large_err)] // temporary workaround for arti#587
#![allow(clippy::needless_raw_string_hashes)] // complained-about code is fine, often best
//! <!-- @@ end lint list maintained by maint/add_warning @@ -->

// These are allowed in this crate only.
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

mod cfg;
mod host;
mod logging;
mod process;
mod subcommands;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tor_rtcompat::{PreferredRuntime, ToplevelBlockOn as _};
use tracing::debug;

/// Start Tor, or inspect a Tor that is already running.
#[derive(Debug, Parser)]
#[command(author = "The Tor Project Developers", version)]
struct Cli {
    /// Read the configuration from FILE, rather than tor-launcher.toml.
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the log level (usually one of 'trace', 'debug', 'info',
    /// 'warn', or 'error').
    #[arg(short, long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    /// What to do.
    #[command(subcommand)]
    command: Command,
}

/// The `tor-launcher` subcommands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Start Tor and supervise it until interrupted.
    Run {
        /// Take the network settings from this JSON file, rather than
        /// asking for them.
        #[arg(long, value_name = "FILE")]
        settings: Option<PathBuf>,
    },
    /// Show the bootstrap status of a running Tor.
    Status,
    /// Print the network settings of a running Tor, as JSON.
    ShowSettings,
    /// Give a running Tor the network settings in a JSON file.
    ApplySettings {
        /// The JSON file to read.
        file: PathBuf,
    },
    /// Print the messages a running Tor logs over a while.
    Log {
        /// How long to listen for.
        #[arg(long, value_name = "DURATION", default_value = "10s", value_parser = humantime::parse_duration)]
        duration: Duration,
    },
}

/// Create a runtime for `tor-launcher` to use.
fn create_runtime() -> std::io::Result<PreferredRuntime> {
    #[cfg(not(feature = "tokio"))]
    compile_error!("tor-launcher needs the \"tokio\" feature, to wait for Ctrl-C.");

    PreferredRuntime::create()
}

/// Inner function, to handle a set of CLI arguments and return a single
/// `Result<()>` for convenient handling.
fn main_main<I, T>(cli_args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = Cli::try_parse_from(cli_args)?;
    let config = cfg::load_config(cli.config.as_deref())?;
    logging::setup_logging(config.logging(), cli.log_level.as_deref())?;

    // Read files now: reading them would block the runtime.
    let prefs = Arc::new(host::FilePreferences::load(config.preferences_file())?);
    let new_settings = match &cli.command {
        Command::ApplySettings { file } => Some(subcommands::load_settings_file(file)?),
        _ => None,
    };

    let runtime = create_runtime()?;
    debug!("Using runtime {:?}", runtime);

    runtime.clone().block_on(async {
        let output = match cli.command {
            Command::Run { settings } => {
                subcommands::run(runtime, &config, &prefs, settings).await?;
                return Ok(());
            }
            Command::Status => subcommands::status(runtime, &config).await?,
            Command::ShowSettings => subcommands::show_settings(runtime, &config, &prefs).await?,
            Command::ApplySettings { .. } => match &new_settings {
                Some(new_settings) => {
                    subcommands::apply_settings(runtime, &config, &prefs, new_settings).await?
                }
                None => return Err(tor_error::internal!("settings file not loaded").into()),
            },
            Command::Log { duration } => subcommands::log(runtime, &config, duration).await?,
        };
        println!("{}", output.trim_end());
        Ok::<_, anyhow::Error>(())
    })
}

/// Main program, callable directly from a binary crate's `main`
///
/// This function behaves the same as `main_main()`, except:
///   * It takes command-line arguments from `std::env::args_os` rather
///     than from an argument.
///   * It exits the process with an appropriate error code on error.
fn main() {
    match main_main(std::env::args_os()) {
        Ok(()) => {}
        Err(e) => match e.downcast_ref::<clap::Error>() {
            Some(clap_err) => clap_err.exit(),
            None => safelog::with_safe_logging_suppressed(|| tor_error::report_and_exit(e)),
        },
    }
}

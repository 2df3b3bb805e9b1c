#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
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

pub mod auth;
pub mod backoff;
pub mod cmdline;
pub mod config;
pub mod err;
pub mod host;
pub mod policy;
pub mod prefs;
pub mod settings;
pub mod supervisor;

pub use auth::ControlPortAccess;
pub use cmdline::{LaunchParams, TorCommandLine};
pub use config::{
    BackoffConfig, BackoffConfigBuilder, LauncherConfig, LauncherConfigBuilder,
    PreferenceDefaults, PreferenceDefaultsBuilder,
};
pub use err::{LauncherError, Result};
pub use host::{
    Alert, Environment, HostServices, LauncherEvent, Notifier, PrefScope, PrefValue,
    InMemoryPreferences, PreferenceStore, ProcessEnvironment, ProcessHost, StartFailure, StartOutcome, StartRequest,
    UserSurface,
};
pub use policy::StartupPolicy;
pub use prefs::Preferences;
pub use settings::{NetworkSettings, SettingsBundle, ValidationError};
pub use supervisor::{BootstrapEvents, DefaultBridgesStatus, ProcessState, ProcessSupervisor};

//! What the launcher needs from the application that embeds it.
//!
//! The supervisor never spawns processes, stores preferences, reads the
//! environment or talks to the user directly.  Instead, it goes through
//! the traits here, which are bundled together as [`HostServices`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tor_ctlproto::BootstrapStatus;
use tor_ctlproto::util::lock;

use crate::supervisor::{BootstrapEvents, ProcessState};

/// Arguments for starting a Tor process.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct StartRequest {
    /// Start Tor with `DisableNetwork 1`, so that it does nothing until we
    /// have configured it.
    pub disable_network: bool,
}

impl StartRequest {
    /// Return a new `StartRequest`.
    pub fn new(disable_network: bool) -> Self {
        StartRequest { disable_network }
    }
}

/// A Tor process that was started successfully.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct StartOutcome {
    /// Something worth logging about the launch.
    pub log_message: Option<String>,
}

/// A Tor process that could not be started.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{details}")]
#[non_exhaustive]
pub struct StartFailure {
    /// Why not, for the user.
    pub details: String,
    /// Something worth logging about the failure.
    pub log_message: Option<String>,
}

impl StartFailure {
    /// Return a new `StartFailure`.
    pub fn new(details: impl Into<String>) -> Self {
        StartFailure {
            details: details.into(),
            log_message: None,
        }
    }
}

/// Starting, watching and stopping the Tor process.
#[async_trait]
pub trait ProcessHost: Send + Sync {
    /// Start a Tor process.
    async fn start_tor(&self, request: &StartRequest) -> Result<StartOutcome, StartFailure>;

    /// Return the status of the Tor process we started.
    ///
    /// Should return [`ProcessState::Running`] while it is alive and
    /// [`ProcessState::Exited`] once it has gone.
    async fn process_status(&self) -> ProcessState;

    /// Quit the application, and restart it if `restart` is true.
    async fn terminate(&self, restart: bool);
}

/// How long a stored preference should last.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum PrefScope {
    /// Kept across restarts.
    Persistent,
    /// Forgotten when the application exits.
    Session,
}

/// A stored preference value.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum PrefValue {
    /// A boolean preference.
    Bool(bool),
    /// A string preference.
    String(String),
}

/// Somewhere to store preferences.
pub trait PreferenceStore: Send + Sync {
    /// Return the stored value of `key`, if any.
    fn get(&self, key: &str) -> Option<PrefValue>;

    /// Store `value` for `key`.  A value of `None` removes the key.
    fn set(&self, key: &str, value: Option<PrefValue>, scope: PrefScope);
}

/// A [`PreferenceStore`] that keeps everything in memory.
#[derive(Debug, Default)]
pub struct InMemoryPreferences {
    /// The stored values.
    values: Mutex<HashMap<String, (PrefValue, PrefScope)>>,
}

impl InMemoryPreferences {
    /// Return a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the scope `key` was stored with, if it is stored.
    pub fn scope(&self, key: &str) -> Option<PrefScope> {
        let values = lock(&self.values);
        values.get(key).map(|(_, scope)| *scope)
    }
}

impl PreferenceStore for InMemoryPreferences {
    fn get(&self, key: &str) -> Option<PrefValue> {
        let values = lock(&self.values);
        values.get(key).map(|(value, _)| value.clone())
    }

    fn set(&self, key: &str, value: Option<PrefValue>, scope: PrefScope) {
        let mut values = lock(&self.values);
        match value {
            Some(value) => {
                values.insert(key.to_owned(), (value, scope));
            }
            None => {
                values.remove(key);
            }
        }
    }
}

/// Access to environment variables.
pub trait Environment: Send + Sync {
    /// Return the value of `name`, if it is set.
    fn var(&self, name: &str) -> Option<String>;
}

/// The real environment of this process.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct ProcessEnvironment;

impl Environment for ProcessEnvironment {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var_os(name).map(|v| v.to_string_lossy().into_owned())
    }
}

impl Environment for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Something to tell the user, which they must acknowledge.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Alert {
    /// The configured default bridge type has no bridges.
    BadDefaultBridgeType {
        /// The configured type.
        bridge_type: String,
    },
    /// We couldn't start Tor.
    StartFailed {
        /// Why not.
        details: String,
    },
    /// Tor never accepted a control connection.
    ControlConnectionFailed,
    /// Tor reported a bootstrap error.
    BootstrapFailed {
        /// The bootstrap phase that failed.
        phase: String,
        /// Tor's reason for the failure.
        reason: String,
    },
    /// Tor refused some settings.
    SaveSettingsFailed {
        /// Tor's reply.
        details: String,
    },
}

impl Alert {
    /// Return the key of the localized message for this alert.
    pub fn message_key(&self) -> &'static str {
        match self {
            Alert::BadDefaultBridgeType { .. } => "error_bridge_bad_default_type",
            Alert::StartFailed { .. } => "unable_to_start_tor",
            Alert::ControlConnectionFailed => "tor_controlconn_failed",
            Alert::BootstrapFailed { .. } => "tor_bootstrap_failed",
            Alert::SaveSettingsFailed { .. } => "failed_to_save_settings",
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alert::BadDefaultBridgeType { bridge_type } => write!(
                f,
                "No {} bridges are available. Please adjust your settings.",
                bridge_type
            ),
            Alert::StartFailed { details } => write!(f, "Unable to start Tor. {}", details),
            Alert::ControlConnectionFailed => {
                write!(f, "Tor did not start: unable to connect to its control port.")
            }
            Alert::BootstrapFailed { phase, reason } => write!(
                f,
                "Tor failed to establish a Tor network connection.\n\n{} failed ({}).",
                phase, reason
            ),
            Alert::SaveSettingsFailed { details } => {
                write!(f, "Unable to save Tor settings.\n\n{}", details)
            }
        }
    }
}

/// Talking to the user.
#[async_trait]
pub trait UserSurface: Send + Sync {
    /// Tell the user that Tor exited, and ask whether to restart it.
    async fn confirm_restart(&self) -> bool;

    /// Show an alert, and return once the user has acknowledged it.
    async fn alert(&self, alert: &Alert);

    /// Show the network settings, and return once they are closed.
    ///
    /// `initial_bootstrap` is true when Tor has not yet connected to the
    /// network for the first time.
    async fn open_network_settings(&self, initial_bootstrap: bool);

    /// Show bootstrap progress, and return once the progress surface is
    /// closed.
    ///
    /// The surface should close itself when `events` reports that
    /// bootstrapping is done.
    async fn open_progress(&self, events: BootstrapEvents);
}

/// A notification broadcast to the rest of the application.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum LauncherEvent {
    /// We are connected to the control port and Tor is configured.
    ProcessIsReady,
    /// Tor reported its bootstrap status.
    BootstrapStatus(BootstrapStatus),
    /// Tor reported a new bootstrap error.
    BootstrapError,
    /// The Tor process exited.
    ProcessExited,
    /// We gave up waiting for Tor.
    ProcessDidNotStart {
        /// A description of the problem.
        message: String,
    },
    /// The settings surface should switch to showing progress.
    OpenProgressDialog,
    /// Tor has logged a warning or an error.
    LogHasWarnOrErr,
}

impl LauncherEvent {
    /// Return the name this notification is broadcast under.
    pub fn wire_name(&self) -> &'static str {
        match self {
            LauncherEvent::ProcessIsReady => "TorProcessIsReady",
            LauncherEvent::BootstrapStatus(_) => "TorBootstrapStatus",
            LauncherEvent::BootstrapError => "TorBootstrapError",
            LauncherEvent::ProcessExited => "TorProcessExited",
            LauncherEvent::ProcessDidNotStart { .. } => "TorProcessDidNotStart",
            LauncherEvent::OpenProgressDialog => "TorOpenProgressDialog",
            LauncherEvent::LogHasWarnOrErr => "TorLogHasWarnOrErr",
        }
    }
}

/// Somewhere to broadcast [`LauncherEvent`]s.
pub trait Notifier: Send + Sync {
    /// Broadcast `event`.
    fn notify(&self, event: &LauncherEvent);
}

/// Everything the supervisor needs from its host.
#[derive(Clone)]
#[non_exhaustive]
pub struct HostServices {
    /// Process control.
    pub process: Arc<dyn ProcessHost>,
    /// Preference storage.
    pub prefs: Arc<dyn PreferenceStore>,
    /// Environment variables.
    pub env: Arc<dyn Environment>,
    /// The user.
    pub surface: Arc<dyn UserSurface>,
    /// Broadcast notifications.
    pub notifier: Arc<dyn Notifier>,
}

impl HostServices {
    /// Bundle up a set of host services.
    pub fn new(
        process: Arc<dyn ProcessHost>,
        prefs: Arc<dyn PreferenceStore>,
        env: Arc<dyn Environment>,
        surface: Arc<dyn UserSurface>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        HostServices {
            process,
            prefs,
            env,
            surface,
            notifier,
        }
    }
}

impl fmt::Debug for HostServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostServices").finish_non_exhaustive()
    }
}

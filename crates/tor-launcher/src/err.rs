//! Errors from supervising and configuring a Tor process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::task::SpawnError;
use tor_ctlproto::ControlError;
use tor_error::{ErrorKind, HasKind};

use crate::settings::ValidationError;

/// An error from the launcher.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LauncherError {
    /// A control port operation failed.
    #[error("Control port error")]
    Control(#[from] ControlError),

    /// We gave up waiting for the Tor process to accept control
    /// connections.
    #[error("Couldn't connect to the Tor control port after {}", humantime::format_duration(*waited))]
    DidNotStart {
        /// How long we waited.
        waited: Duration,
    },

    /// The host couldn't start the Tor process.
    #[error("Unable to start Tor: {details}")]
    StartFailed {
        /// A description of what went wrong.
        details: String,
    },

    /// Network settings failed validation, and were not sent.
    #[error("Invalid network settings")]
    Validation(#[from] ValidationError),

    /// Tor refused some network settings.
    #[error("Tor rejected the network settings: {details}")]
    SettingsRejected {
        /// Tor's reply.
        details: String,
    },

    /// A network settings bundle couldn't be decoded.
    #[error("Malformed network settings")]
    SettingsFormat(#[source] Arc<serde_json::Error>),

    /// The control port address from the environment was unusable.
    #[error("Bad control port address {value:?}: {problem}")]
    BadControlAddress {
        /// The offending value.
        value: String,
        /// What was wrong with it.
        problem: String,
    },

    /// We couldn't read the control port's authentication cookie.
    #[error("Couldn't read authentication cookie from {}", path.display())]
    CookieFile {
        /// The file we tried to read.
        path: PathBuf,
        /// What went wrong.
        #[source]
        cause: Arc<std::io::Error>,
    },

    /// We couldn't spawn a background task.
    #[error("Unable to spawn {spawning}")]
    Spawn {
        /// What we were trying to spawn.
        spawning: &'static str,
        /// What happened when we tried to spawn it.
        #[source]
        cause: Arc<SpawnError>,
    },

    /// An internal error occurred.
    #[error("Internal error")]
    Bug(#[from] tor_error::Bug),
}

impl LauncherError {
    /// Construct a new `LauncherError` from a `SpawnError`.
    pub(crate) fn from_spawn(spawning: &'static str, err: SpawnError) -> LauncherError {
        LauncherError::Spawn {
            spawning,
            cause: Arc::new(err),
        }
    }
}

impl From<serde_json::Error> for LauncherError {
    fn from(err: serde_json::Error) -> Self {
        LauncherError::SettingsFormat(Arc::new(err))
    }
}

impl HasKind for LauncherError {
    fn kind(&self) -> ErrorKind {
        use ErrorKind as EK;
        use LauncherError as E;
        match self {
            E::Control(e) => e.kind(),
            E::DidNotStart { .. } | E::StartFailed { .. } => EK::ExternalToolFailed,
            E::Validation(_)
            | E::SettingsRejected { .. }
            | E::BadControlAddress { .. }
            | E::CookieFile { .. } => EK::InvalidConfig,
            E::SettingsFormat(_) => EK::BadApiUsage,
            E::Spawn { cause, .. } => cause.kind(),
            E::Bug(e) => e.kind(),
        }
    }
}

/// Standard-issue `Result` alias, with [`LauncherError`].
pub type Result<T> = std::result::Result<T, LauncherError>;

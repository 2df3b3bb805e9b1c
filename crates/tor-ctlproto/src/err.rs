//! Errors returned while talking to a Tor control port.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::task::SpawnError;
use tor_error::{ErrorKind, HasKind};

use crate::util::define_from_for_arc;

/// An error that occurred while talking to the control port of a Tor process.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ControlError {
    /// We couldn't open a TCP connection to the control port.
    #[error("Unable to connect to control port at {addr}")]
    Connect {
        /// The address we tried.
        addr: SocketAddr,
        /// What went wrong.
        #[source]
        cause: Arc<std::io::Error>,
    },

    /// The control port refused our `AUTHENTICATE` command.
    #[error("Control port authentication failed: {status} {message}")]
    Auth {
        /// Status code from the reply.
        status: u16,
        /// Text of the reply.
        message: String,
    },

    /// The cached primary connection is already running another command.
    #[error("Control connection is busy")]
    Busy,

    /// A command did not get a reply in time.
    #[error("Timed out waiting for a reply to {command}")]
    Timeout {
        /// The command we sent.
        command: String,
    },

    /// We got an error while reading from or writing to the control port.
    #[error("I/O error on control connection")]
    Io(#[source] Arc<std::io::Error>),

    /// The control port closed the connection in the middle of a reply.
    #[error("Control connection closed")]
    Closed,

    /// The control port sent something we couldn't parse.
    #[error("Unparsable reply to {command}: {problem}")]
    Parse {
        /// The command we sent.
        command: String,
        /// A description of the problem.
        problem: String,
    },

    /// The control port answered our command with a failure status.
    #[error("{command} failed: {status} {message}")]
    Rejected {
        /// The command we sent.
        command: String,
        /// Status code from the reply.
        status: u16,
        /// Text of the reply lines.
        message: String,
    },

    /// A command was requested that would have had no arguments.
    #[error("Refusing to send {command} with no arguments")]
    EmptyCommand {
        /// The command we refused to send.
        command: &'static str,
    },

    /// Unable to spawn a background task.
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

define_from_for_arc!( std::io::Error => ControlError [Io] );

impl ControlError {
    /// Construct a new `ControlError` from a `SpawnError`.
    pub(crate) fn from_spawn(spawning: &'static str, err: SpawnError) -> ControlError {
        ControlError::Spawn {
            spawning,
            cause: Arc::new(err),
        }
    }

    /// Return true if this error came from the socket rather than from
    /// the content of a reply.
    ///
    /// After an error like this, the connection that produced it must not be
    /// used again.
    pub fn is_connection_failure(&self) -> bool {
        use ControlError as E;
        match self {
            E::Connect { .. } | E::Auth { .. } | E::Timeout { .. } | E::Io(_) | E::Closed => true,
            E::Parse { .. } => true,
            E::Busy | E::Rejected { .. } | E::EmptyCommand { .. } => false,
            E::Spawn { .. } | E::Bug(_) => false,
        }
    }
}

impl HasKind for ControlError {
    fn kind(&self) -> ErrorKind {
        use ControlError as E;
        use ErrorKind as EK;
        match self {
            E::Connect { .. } | E::Io(_) | E::Closed => EK::LocalNetworkError,
            E::Auth { .. } => EK::InvalidConfig,
            E::Busy | E::EmptyCommand { .. } => EK::BadApiUsage,
            E::Timeout { .. } => EK::TransientFailure,
            E::Parse { .. } => EK::LocalProtocolViolation,
            E::Rejected { .. } => EK::Other,
            E::Spawn { cause, .. } => cause.kind(),
            E::Bug(e) => e.kind(),
        }
    }
}

/// Standard-issue `Result` alias, with [`ControlError`].
pub type Result<T> = std::result::Result<T, ControlError>;

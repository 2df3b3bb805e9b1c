//! Running Tor as a child process.

use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::channel::oneshot;
use tor_ctlproto::util::lock;
use tor_error::ErrorReport as _;
use tor_launcher::{
    ControlPortAccess, LaunchParams, LauncherConfig, ProcessHost, ProcessState, StartFailure,
    StartOutcome, StartRequest, TorCommandLine,
};
use tracing::{debug, warn};

/// A [`ProcessHost`] that starts Tor with [`std::process`].
///
/// The child exits by itself once our control connection closes, since we
/// take ownership of it and name ourselves as its owning process.
pub(crate) struct ChildProcessHost {
    /// How to start Tor.
    config: LauncherConfig,
    /// How Tor should let us authenticate.
    access: ControlPortAccess,
    /// The Tor process, once started.
    child: Mutex<Option<Child>>,
    /// Told when the application should quit: `true` to restart.
    quit: Mutex<Option<oneshot::Sender<bool>>>,
}

impl ChildProcessHost {
    /// Return a new host, and a receiver that fires when the supervisor
    /// asks us to quit.
    pub(crate) fn new(
        config: LauncherConfig,
        access: ControlPortAccess,
    ) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let host = ChildProcessHost {
            config,
            access,
            child: Mutex::new(None),
            quit: Mutex::new(Some(tx)),
        };
        (host, rx)
    }
}

#[async_trait]
impl ProcessHost for ChildProcessHost {
    async fn start_tor(&self, request: &StartRequest) -> Result<StartOutcome, StartFailure> {
        let params = LaunchParams::new(
            self.access.hashed_password(&mut rand::rng()),
            std::process::id(),
            request.disable_network,
        );
        let cmdline = TorCommandLine::build(&self.config, &params)?;
        debug!("Running {}", cmdline.program().display());

        let child = Command::new(cmdline.program())
            .args(cmdline.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                let mut failure = StartFailure::new(e.to_string());
                failure.log_message = Some(format!(
                    "Couldn't run {}: {}",
                    cmdline.program().display(),
                    e.report()
                ));
                failure
            })?;

        let mut outcome = StartOutcome::default();
        outcome.log_message = Some(format!("Tor is running as process {}", child.id()));
        *lock(&self.child) = Some(child);
        Ok(outcome)
    }

    async fn process_status(&self) -> ProcessState {
        let mut child = lock(&self.child);
        let Some(child) = child.as_mut() else {
            return ProcessState::Unknown;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Tor exited: {}", status);
                ProcessState::Exited
            }
            Ok(None) => ProcessState::Running,
            Err(e) => {
                warn!("Couldn't check on Tor: {}", e.report());
                ProcessState::Unknown
            }
        }
    }

    async fn terminate(&self, restart: bool) {
        let quit = lock(&self.quit).take();
        if let Some(quit) = quit {
            let _ignore_closed = quit.send(restart);
        }
    }
}

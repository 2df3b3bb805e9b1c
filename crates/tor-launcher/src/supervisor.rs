//! Supervising a Tor process.
//!
//! A [`ProcessSupervisor`] starts Tor (or finds one that somebody else
//! started), waits for its control port, watches it bootstrap, keeps the
//! user informed, and offers to restart it if it dies.
//!
//! Every background wait the supervisor owns (status polling, waiting for
//! the control port, reading events) is registered in one cancellation
//! group, so that [`ProcessSupervisor::suspend`] can stop them all before
//! closing any connection.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use educe::Educe;
use futures::future::{AbortHandle, abortable};
use futures::task::SpawnExt as _;
use futures::{FutureExt as _, Stream, StreamExt as _};
use postage::watch;
use tor_basic_utils::skip_fmt;
use tor_ctlproto::util::lock;
use tor_ctlproto::{BootstrapStatus, ControlEvent, ControlEvents, Ownership, ProtocolClient, SetConf};
use tor_error::warn_report;
use tor_rtcompat::Runtime;
use tracing::{debug, info, warn};

use crate::auth::ControlPortAccess;
use crate::backoff::ControlPortBackoff;
use crate::config::LauncherConfig;
use crate::err::{LauncherError, Result};
use crate::host::{Alert, HostServices, LauncherEvent, StartRequest};
use crate::policy::StartupPolicy;
use crate::prefs::Preferences;
use crate::settings::{self, NetworkSettings, SettingsBundle};

/// The state of the Tor process, as far as we know.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum ProcessState {
    /// We haven't started it, or don't know.
    #[default]
    Unknown,
    /// We've started it, and are waiting for its control port.
    Starting,
    /// It is running and we're connected to it.
    Running,
    /// It has exited.
    Exited,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Unknown => "unknown",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// Whether the configured default bridges can be used.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum DefaultBridgesStatus {
    /// No default bridge type is selected.
    NotInUse,
    /// A type is selected, and we have bridges of that type.
    InUse,
    /// A type is selected, but we have no bridges of that type.
    BadConfig,
}

/// A [`Stream`] of [`BootstrapStatus`] updates, for a progress display.
///
/// The stream starts with the most recent status, if there is one.  It
/// isn't guaranteed to see every update; if updates arrive faster than it
/// is read, only the latest is kept.  Progress never goes backwards during
/// one run of Tor.
#[derive(Clone, Educe)]
#[educe(Debug)]
pub struct BootstrapEvents {
    /// The receiver that implements this stream.
    #[educe(Debug(method = "skip_fmt"))]
    inner: watch::Receiver<Option<BootstrapStatus>>,
}

impl BootstrapEvents {
    /// Return the most recent status, if there is one.
    pub fn latest(&self) -> Option<BootstrapStatus> {
        self.inner.borrow().clone()
    }
}

impl Stream for BootstrapEvents {
    type Item = BootstrapStatus;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;
        loop {
            match self.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Some(status))) => return Poll::Ready(Some(status)),
                // Nothing reported yet in this run.
                Poll::Ready(Some(None)) => continue,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// A background wait that [`ProcessSupervisor::suspend`] must stop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Waiter {
    /// Polling the Tor process's status.
    StatusPoll,
    /// Waiting for the control port to accept connections.
    Backoff,
    /// Reading events from the protocol client.
    EventPump,
}

/// Handles for every background wait we own.
#[derive(Default)]
struct CancelGroup {
    /// The status poll task.
    status_poll: Option<AbortHandle>,
    /// The control port wait.
    backoff: Option<AbortHandle>,
    /// The event pump task.
    event_pump: Option<AbortHandle>,
}

impl CancelGroup {
    /// Return the slot for `which`.
    fn slot(&mut self, which: Waiter) -> &mut Option<AbortHandle> {
        match which {
            Waiter::StatusPoll => &mut self.status_poll,
            Waiter::Backoff => &mut self.backoff,
            Waiter::EventPump => &mut self.event_pump,
        }
    }

    /// Record `handle` for `which`, stopping whatever was there before.
    fn replace(&mut self, which: Waiter, handle: AbortHandle) {
        if let Some(old) = self.slot(which).replace(handle) {
            old.abort();
        }
    }

    /// Stop `which`, if it is running.
    fn cancel(&mut self, which: Waiter) {
        if let Some(handle) = self.slot(which).take() {
            debug!("Cancelling {:?}", which);
            handle.abort();
        }
    }

    /// Stop everything.
    fn cancel_all(&mut self) {
        for which in [Waiter::StatusPoll, Waiter::Backoff, Waiter::EventPump] {
            self.cancel(which);
        }
    }
}

/// Mutable state of a [`ProcessSupervisor`].
#[derive(Default)]
struct State {
    /// What we know about the Tor process.
    process: ProcessState,
    /// True once Tor has reported 100% bootstrap progress.
    bootstrap_done: bool,
    /// True if Tor's latest bootstrap report described a problem.
    error_occurred: bool,
    /// The tag and reason of the last bootstrap problem we told the user
    /// about.
    last_warning: Option<(String, String)>,
    /// When we started the Tor process.
    started: Option<Instant>,
    /// True once we've begun shutting down.
    quitting: bool,
    /// A quit that is waiting for an open surface to close: `Some(restart)`.
    quit_request: Option<bool>,
    /// How many blocking surfaces are open.
    open_surfaces: usize,
    /// True while the network settings surface is open.
    settings_open: bool,
    /// Our background waits.
    waiters: CancelGroup,
}

/// The supervisor's shared internals.
struct Inner<R: Runtime> {
    /// Runtime for sleeping and spawning.
    runtime: R,
    /// Our configuration.
    config: LauncherConfig,
    /// The control port client.
    client: Arc<ProtocolClient<R>>,
    /// The application we're embedded in.
    host: HostServices,
    /// Typed preferences.
    prefs: Preferences,
    /// Mutable state.
    state: Mutex<State>,
    /// The latest bootstrap status, for [`BootstrapEvents`].
    bootstrap: Mutex<BootstrapWatch>,
}

/// Both ends of the bootstrap status channel.
struct BootstrapWatch {
    /// Where we publish.
    tx: watch::Sender<Option<BootstrapStatus>>,
    /// Kept so that new subscribers can be made, and so that `tx` never
    /// sees the channel close.
    rx: watch::Receiver<Option<BootstrapStatus>>,
}

/// Starts, watches and configures a Tor process.
///
/// Cloning a `ProcessSupervisor` makes another handle to the same
/// supervisor.
#[derive(Clone)]
pub struct ProcessSupervisor<R: Runtime> {
    /// The shared internals.
    inner: Arc<Inner<R>>,
}

impl<R: Runtime> fmt::Debug for ProcessSupervisor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("process", &self.process_state())
            .finish_non_exhaustive()
    }
}

impl<R: Runtime> ProcessSupervisor<R> {
    /// Create a new supervisor.
    ///
    /// `access` says where the control port is and how to authenticate to
    /// it.  Nothing happens until [`run`](Self::run) is called.
    pub fn new(
        runtime: R,
        config: LauncherConfig,
        access: &ControlPortAccess,
        host: HostServices,
    ) -> Self {
        let prefs = Preferences::new(
            Arc::clone(&host.prefs),
            config.preferences().clone(),
        );
        let policy = StartupPolicy::resolve(host.env.as_ref(), &prefs);
        let ownership = if policy.start_and_own_tor && !policy.only_configure_tor {
            Ownership::TakeOwnership
        } else {
            Ownership::Disowned
        };
        let client = ProtocolClient::new(
            runtime.clone(),
            config.control().with_address(access.address()),
            access.control_auth(),
            ownership,
        );
        let (tx, rx) = watch::channel();

        ProcessSupervisor {
            inner: Arc::new(Inner {
                runtime,
                config,
                client: Arc::new(client),
                host,
                prefs,
                state: Mutex::new(State::default()),
                bootstrap: Mutex::new(BootstrapWatch { tx, rx }),
            }),
        }
    }

    /// Lock and return our state.
    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.inner.state)
    }

    /// Return the startup policy, as of now.
    ///
    /// The policy is recomputed each time, since bootstrapping changes the
    /// preferences it depends on.
    pub fn policy(&self) -> StartupPolicy {
        StartupPolicy::resolve(self.inner.host.env.as_ref(), &self.inner.prefs)
    }

    /// Return the control port client.
    pub fn client(&self) -> &Arc<ProtocolClient<R>> {
        &self.inner.client
    }

    /// Return the typed preferences.
    pub fn preferences(&self) -> &Preferences {
        &self.inner.prefs
    }

    /// Return what we know about the Tor process.
    pub fn process_state(&self) -> ProcessState {
        self.state().process
    }

    /// Return true if Tor has finished bootstrapping.
    pub fn bootstrap_done(&self) -> bool {
        self.state().bootstrap_done
    }

    /// Return true if Tor's most recent bootstrap report was a problem.
    pub fn bootstrap_error_occurred(&self) -> bool {
        self.state().error_occurred
    }

    /// Forget which bootstrap problem we last told the user about, so that
    /// it will be reported again if it recurs.
    pub fn clear_bootstrap_error(&self) {
        self.state().last_warning = None;
    }

    /// Return a stream of bootstrap status updates.
    pub fn bootstrap_events(&self) -> BootstrapEvents {
        let w = lock(&self.inner.bootstrap);
        BootstrapEvents {
            inner: w.rx.clone(),
        }
    }

    /// Return whether the configured default bridges can be used.
    pub fn default_bridges_status(&self) -> DefaultBridgesStatus {
        match self.inner.prefs.default_bridges() {
            None => DefaultBridgesStatus::NotInUse,
            Some(bridges) if bridges.is_empty() => DefaultBridgesStatus::BadConfig,
            Some(_) => DefaultBridgesStatus::InUse,
        }
    }

    /// Tell the rest of the application about `event`.
    fn notify(&self, event: LauncherEvent) {
        debug!("Notifying {}", event.wire_name());
        self.inner.host.notifier.notify(&event);
    }

    /// Show `alert` to the user, and wait for them to acknowledge it.
    async fn alert(&self, alert: Alert) {
        warn!("{}", alert);
        self.inner.host.surface.alert(&alert).await;
    }

    /// Do whatever the startup policy says: start Tor and take control of
    /// it, or take control of a Tor that somebody else started.
    pub async fn run(&self) -> Result<()> {
        let policy = self.policy();
        if policy.only_configure_tor {
            info!("Configuring an existing Tor process");
            return self.control_daemon().await;
        }
        if policy.start_and_own_tor {
            self.start().await?;
            return self.control_daemon().await;
        }
        info!("Not starting Tor: somebody else is responsible for it");
        Ok(())
    }

    /// Start a Tor process, and begin polling its status.
    ///
    /// Tor starts with its network disabled if the user must see the
    /// network settings first, or if default bridges are to be configured.
    pub async fn start(&self) -> Result<()> {
        {
            let mut st = self.state();
            st.process = ProcessState::Unknown;
            st.bootstrap_done = false;
            st.error_occurred = false;
        }
        self.reset_bootstrap();

        let bridge_type = self.inner.prefs.default_bridge_type();
        if self.default_bridges_status() == DefaultBridgesStatus::BadConfig {
            self.alert(Alert::BadDefaultBridgeType {
                bridge_type: bridge_type.clone().unwrap_or_default(),
            })
            .await;
        }

        let request = StartRequest {
            disable_network: self.policy().show_network_settings || bridge_type.is_some(),
        };
        match self.inner.host.process.start_tor(&request).await {
            Ok(outcome) => {
                if let Some(msg) = outcome.log_message {
                    info!("{}", msg);
                }
                {
                    let mut st = self.state();
                    st.process = ProcessState::Starting;
                    st.started = Some(self.inner.runtime.now());
                }
                info!(
                    "Started Tor{}",
                    if request.disable_network {
                        " with its network disabled"
                    } else {
                        ""
                    }
                );
                self.arm_status_poll()
            }
            Err(failure) => {
                self.state().process = ProcessState::Exited;
                if let Some(msg) = &failure.log_message {
                    warn!("{}", msg);
                }
                self.alert(Alert::StartFailed {
                    details: failure.details.clone(),
                })
                .await;
                Err(LauncherError::StartFailed {
                    details: failure.details,
                })
            }
        }
    }

    /// Begin polling the Tor process's status.
    fn arm_status_poll(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.inner);
        let runtime = self.inner.runtime.clone();
        let interval = self.inner.config.status_poll_interval();
        let (task, handle) = abortable(async move {
            loop {
                runtime.sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let sup = ProcessSupervisor { inner };
                let status = sup.inner.host.process.process_status().await;
                if status == ProcessState::Exited && sup.process_state() != ProcessState::Exited {
                    // Handled in its own task: restarting Tor re-arms this
                    // poll, which would stop the handler if it ran here.
                    let handler = sup.clone();
                    if let Err(e) = sup
                        .inner
                        .runtime
                        .spawn(async move { handler.on_process_status_poll(status).await })
                    {
                        warn_report!(
                            LauncherError::from_spawn("status handler", e),
                            "Couldn't handle Tor process status"
                        );
                    }
                }
            }
        });
        self.state().waiters.replace(Waiter::StatusPoll, handle);
        self.inner
            .runtime
            .spawn(task.map(|_| ()))
            .map_err(|e| LauncherError::from_spawn("status poll", e))
    }

    /// Handle a new status report for the Tor process.
    ///
    /// Only an exit matters here.  If Tor has exited and we aren't
    /// quitting, we stop waiting for it, close our connections, and ask the
    /// user whether to restart it.
    pub async fn on_process_status_poll(&self, status: ProcessState) {
        if status != ProcessState::Exited {
            return;
        }
        let quitting = {
            let mut st = self.state();
            if st.process == ProcessState::Exited {
                return;
            }
            st.process = ProcessState::Exited;
            // Stop the timers before anything else can happen.
            st.waiters.cancel(Waiter::StatusPoll);
            st.waiters.cancel(Waiter::Backoff);
            st.bootstrap_done = false;
            st.quitting
        };
        self.notify(LauncherEvent::ProcessExited);
        if quitting {
            return;
        }

        warn!("Tor exited unexpectedly");
        self.inner.client.shutdown();
        if !self.inner.host.surface.confirm_restart().await {
            info!("Not restarting Tor");
            return;
        }
        if self.state().quitting {
            return;
        }
        if let Err(e) = self.start().await {
            warn_report!(e, "Couldn't restart Tor");
            return;
        }
        if let Err(e) = self.control_daemon().await {
            warn_report!(e, "Couldn't take control of restarted Tor");
        }
    }

    /// Wait for Tor's control port, set Tor up, and show the user whatever
    /// they need to see.
    ///
    /// Returns `Ok` without doing anything more if the wait is cancelled.
    pub async fn control_daemon(&self) -> Result<()> {
        if !self.wait_for_control_port().await? {
            debug!("Stopped waiting for the control port");
            return Ok(());
        }
        self.on_control_connection().await?;
        self.show_startup_surface().await;
        Ok(())
    }

    /// Poll the control port with backoff until it accepts a connection.
    ///
    /// Returns `Ok(false)` if the wait was cancelled.
    async fn wait_for_control_port(&self) -> Result<bool> {
        let now = self.inner.runtime.now();
        let started = {
            let st = self.state();
            match (st.process, st.started) {
                (ProcessState::Starting, Some(started)) => started,
                _ => now,
            }
        };
        let mut backoff = ControlPortBackoff::new(self.inner.config.backoff(), started);

        let inner = &self.inner;
        let (waiting, handle) = abortable(async {
            loop {
                inner.runtime.sleep(backoff.next_delay()).await;
                if inner.client.have_control_connection().await {
                    return Ok(());
                }
                let now = inner.runtime.now();
                if backoff.is_exhausted(now) {
                    return Err(LauncherError::DidNotStart {
                        waited: backoff.elapsed(now),
                    });
                }
            }
        });
        {
            let mut st = self.state();
            if st.quitting {
                return Ok(false);
            }
            st.waiters.replace(Waiter::Backoff, handle);
        }

        let outcome = waiting.await;
        self.state().waiters.slot(Waiter::Backoff).take();
        match outcome {
            Err(_aborted) => Ok(false),
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => {
                let alert = Alert::ControlConnectionFailed;
                self.notify(LauncherEvent::ProcessDidNotStart {
                    message: alert.to_string(),
                });
                self.alert(alert).await;
                Err(e)
            }
        }
    }

    /// Set up a Tor process whose control port we've just reached.
    async fn on_control_connection(&self) -> Result<()> {
        self.state().process = ProcessState::Running;
        info!("Connected to Tor's control port");

        // Subscribe before anything can publish.
        self.start_event_pump()?;
        let client = &self.inner.client;
        if let Err(e) = client.start_event_monitor().await {
            warn_report!(e, "Couldn't monitor Tor's events");
        }
        if let Err(e) = client.retrieve_bootstrap_status().await {
            warn_report!(e, "Couldn't ask Tor for its bootstrap status");
        }

        // Default bridges are configured on every start, in case the
        // bridge list has changed since last time.
        if self.default_bridges_status() == DefaultBridgesStatus::InUse {
            if let Err(e) = self.configure_default_bridges().await {
                warn_report!(e, "Couldn't configure default bridges");
            }
        }

        self.notify(LauncherEvent::ProcessIsReady);
        Ok(())
    }

    /// Start relaying the client's events to this supervisor.
    fn start_event_pump(&self) -> Result<()> {
        let events = self.inner.client.subscribe();
        let (pump, handle) = abortable(run_event_pump(Arc::downgrade(&self.inner), events));
        self.state().waiters.replace(Waiter::EventPump, handle);
        self.inner
            .runtime
            .spawn(pump.map(|_| ()))
            .map_err(|e| LauncherError::from_spawn("event pump", e))
    }

    /// Open the network settings or the progress display, as the startup
    /// policy says.
    async fn show_startup_surface(&self) {
        let must_show = self.policy().show_network_settings
            || self.default_bridges_status() == DefaultBridgesStatus::BadConfig;
        if must_show {
            self.open_settings_surface(true).await;
            return;
        }
        if self.state().settings_open {
            self.notify(LauncherEvent::OpenProgressDialog);
            return;
        }

        let events = self.bootstrap_events();
        let surface = Arc::clone(&self.inner.host.surface);
        self.with_surface(false, surface.open_progress(events)).await;

        // If the progress display closed before Tor finished, and the user
        // didn't quit, they want to change the settings.
        let open_settings = {
            let st = self.state();
            !st.quitting && st.quit_request.is_none() && !st.bootstrap_done
        };
        if open_settings {
            self.open_settings_surface(true).await;
        }
    }

    /// Open the network settings, and wait for them to close.
    ///
    /// Does nothing if they're open already.
    pub async fn open_network_settings(&self) {
        self.open_settings_surface(false).await;
    }

    /// Open the network settings, and wait for them to close.
    async fn open_settings_surface(&self, initial_bootstrap: bool) {
        if self.state().settings_open {
            debug!("Network settings are open already");
            return;
        }
        let surface = Arc::clone(&self.inner.host.surface);
        self.with_surface(true, surface.open_network_settings(initial_bootstrap))
            .await;
    }

    /// Run `surface` as a blocking surface, then carry out any quit that
    /// was requested while it was open.
    async fn with_surface<F: Future<Output = ()>>(&self, settings: bool, surface: F) {
        {
            let mut st = self.state();
            st.open_surfaces += 1;
            if settings {
                st.settings_open = true;
            }
        }
        surface.await;
        let quit = {
            let mut st = self.state();
            st.open_surfaces = st.open_surfaces.saturating_sub(1);
            if settings {
                st.settings_open = false;
            }
            if st.open_surfaces == 0 {
                st.quit_request.take()
            } else {
                None
            }
        };
        if let Some(restart) = quit {
            info!("Carrying out deferred quit");
            self.quit_now(restart).await;
        }
    }

    /// Handle a bootstrap status report from Tor.
    pub async fn on_bootstrap_status(&self, status: BootstrapStatus) {
        let alert = {
            let mut st = self.state();
            if status.is_done() {
                st.bootstrap_done = true;
                st.error_occurred = false;
                None
            } else {
                st.bootstrap_done = false;
                if status.error_occurred() {
                    st.error_occurred = true;
                    let reason = status.reason().unwrap_or_default().to_owned();
                    let key = (status.tag().to_owned(), reason);
                    if st.last_warning.as_ref() != Some(&key) {
                        st.last_warning = Some(key);
                        Some(Alert::BootstrapFailed {
                            phase: if status.summary().is_empty() {
                                status.tag().to_owned()
                            } else {
                                status.summary().to_owned()
                            },
                            reason: status
                                .warning()
                                .or(status.reason())
                                .unwrap_or("unknown")
                                .to_owned(),
                        })
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
        };

        if status.is_done() {
            self.inner.prefs.set_prompt_at_startup(false);
        } else if status.error_occurred() {
            self.inner.prefs.set_prompt_at_startup(true);
            warn!(
                "Tor bootstrap error: [{}/{}] {}",
                status.tag(),
                status.reason().unwrap_or_default(),
                status
            );
        }

        self.publish_bootstrap(&status);
        self.notify(LauncherEvent::BootstrapStatus(status));

        if let Some(alert) = alert {
            self.notify(LauncherEvent::BootstrapError);
            self.alert(alert).await;
        }
    }

    /// Make `status` the latest for [`BootstrapEvents`], unless it would
    /// take progress backwards.
    fn publish_bootstrap(&self, status: &BootstrapStatus) {
        let mut w = lock(&self.inner.bootstrap);
        let behind = w
            .rx
            .borrow()
            .as_ref()
            .is_some_and(|latest| status.progress() < latest.progress());
        if behind {
            debug!("Not reporting bootstrap regress to {}", status);
            return;
        }
        *w.tx.borrow_mut() = Some(status.clone());
    }

    /// Forget the latest bootstrap status, for a new run of Tor.
    fn reset_bootstrap(&self) {
        let mut w = lock(&self.inner.bootstrap);
        *w.tx.borrow_mut() = None;
    }

    /// Give Tor the default bridges, enable its network, and save its
    /// configuration.
    ///
    /// The configuration is only saved if both changes were accepted;
    /// otherwise the user is told what went wrong.
    pub async fn configure_default_bridges(&self) -> Result<()> {
        let Some(bridges) = self
            .inner
            .prefs
            .default_bridges()
            .filter(|b| !b.is_empty())
        else {
            return Ok(());
        };
        let client = &self.inner.client;

        let mut failures = Vec::new();
        let bridge_changes = SetConf::new().set("UseBridges", true).set("Bridge", bridges);
        if let Err(e) = client.set_conf_with_reply(&bridge_changes).await {
            failures.push(e.details);
        }
        let enable = SetConf::new().set("DisableNetwork", false);
        if let Err(e) = client.set_conf_with_reply(&enable).await {
            failures.push(e.details);
        }

        if failures.is_empty() {
            client.save_conf().await?;
            info!("Configured default bridges");
            return Ok(());
        }
        let details = failures.join("\n");
        self.alert(Alert::SaveSettingsFailed {
            details: details.clone(),
        })
        .await;
        Err(LauncherError::SettingsRejected { details })
    }

    /// Return the current network settings, as a settings form shows them.
    pub async fn read_settings(&self) -> Result<SettingsBundle> {
        Ok(settings::read_settings(&self.inner.client, &self.inner.prefs)
            .await?
            .to_form())
    }

    /// Check and apply a JSON settings bundle.
    pub async fn apply_settings_json(&self, json: &str) -> Result<()> {
        let settings = SettingsBundle::from_json(json)?.validate()?;
        self.apply_settings(&settings).await
    }

    /// Apply network settings.
    ///
    /// If Tor refuses them, the user is told why.  On success, the last
    /// bootstrap problem is forgotten, so that it will be reported again if
    /// the new settings don't help.
    pub async fn apply_settings(&self, settings: &NetworkSettings) -> Result<()> {
        match settings::apply_settings(&self.inner.client, &self.inner.prefs, settings).await {
            Ok(()) => {
                self.clear_bootstrap_error();
                Ok(())
            }
            Err(LauncherError::SettingsRejected { details }) => {
                self.alert(Alert::SaveSettingsFailed {
                    details: details.clone(),
                })
                .await;
                Err(LauncherError::SettingsRejected { details })
            }
            Err(e) => Err(e),
        }
    }

    /// Ask to quit the application, restarting it if `restart` is true.
    ///
    /// If the network settings or progress display are open, nothing
    /// happens until they close.
    pub async fn request_quit(&self, restart: bool) {
        {
            let mut st = self.state();
            if st.open_surfaces > 0 {
                info!("Will quit once the open window closes");
                st.quit_request = Some(restart);
                return;
            }
        }
        self.quit_now(restart).await;
    }

    /// Shut down, and ask the host to quit.
    async fn quit_now(&self, restart: bool) {
        self.suspend();
        self.inner.host.process.terminate(restart).await;
    }

    /// Stop every background wait, then close our control connections.
    ///
    /// A Tor process we own exits once its control connection closes.
    pub fn suspend(&self) {
        let was_live = {
            let mut st = self.state();
            st.quitting = true;
            st.waiters.cancel_all();
            matches!(st.process, ProcessState::Starting | ProcessState::Running)
        };
        info!("Disconnecting from Tor");
        self.inner.client.shutdown();
        if was_live {
            self.state().process = ProcessState::Exited;
        }
    }
}

/// Relay `events` to the supervisor, until it goes away.
async fn run_event_pump<R: Runtime>(supervisor: Weak<Inner<R>>, mut events: ControlEvents) {
    while let Some(event) = events.next().await {
        let Some(inner) = supervisor.upgrade() else {
            return;
        };
        let sup = ProcessSupervisor { inner };
        match event {
            ControlEvent::Bootstrap(status) => sup.on_bootstrap_status(status).await,
            ControlEvent::LogHasWarnOrErr => sup.notify(LauncherEvent::LogHasWarnOrErr),
            other => debug!("Ignoring {:?}", other),
        }
    }
    debug!("Event stream ended");
}

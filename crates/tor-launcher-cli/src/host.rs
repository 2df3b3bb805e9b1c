//! The terminal side of the launcher: preferences on disk, prompts on
//! stdin, and notifications in the log.

use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead as _, IsTerminal as _, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use futures::StreamExt as _;
use futures::channel::oneshot;
use serde_json::Value;
use tor_ctlproto::util::lock;
use tor_error::warn_report;
use tor_launcher::{
    Alert, BootstrapEvents, LauncherEvent, Notifier, PrefScope, PrefValue, PreferenceStore,
    ProcessSupervisor, SettingsBundle, UserSurface,
};
use tor_rtcompat::Runtime;
use tracing::{debug, info, warn};

/// A [`PreferenceStore`] that keeps persistent values in a JSON file.
///
/// Session values are kept in memory only.
pub(crate) struct FilePreferences {
    /// Where persistent values live, if anywhere.
    path: Option<PathBuf>,
    /// Persistent values.
    persistent: Mutex<BTreeMap<String, Value>>,
    /// Session values.
    session: Mutex<HashMap<String, PrefValue>>,
}

impl FilePreferences {
    /// Load preferences from `path`, or start empty if it doesn't exist.
    ///
    /// With no `path`, nothing is ever written to disk.
    pub(crate) fn load(path: Option<&Path>) -> Result<Self> {
        let persistent = match path {
            Some(p) => match std::fs::read_to_string(p) {
                Ok(text) => serde_json::from_str(&text)
                    .with_context(|| format!("Malformed preferences in {}", p.display()))?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
                Err(e) => return Err(e).with_context(|| format!("Can't read {}", p.display())),
            },
            None => BTreeMap::new(),
        };
        Ok(FilePreferences {
            path: path.map(Path::to_path_buf),
            persistent: Mutex::new(persistent),
            session: Mutex::new(HashMap::new()),
        })
    }

    /// Write the persistent values to disk.
    fn save(&self, values: &BTreeMap<String, Value>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = serde_json::to_string_pretty(values)?;
        std::fs::write(path, text).with_context(|| format!("Can't write {}", path.display()))
    }
}

/// Convert a stored JSON value to a preference.
fn from_json(value: &Value) -> Option<PrefValue> {
    match value {
        Value::Bool(b) => Some(PrefValue::Bool(*b)),
        Value::String(s) => Some(PrefValue::String(s.clone())),
        _ => None,
    }
}

/// Convert a preference to JSON for storage.
fn to_json(value: &PrefValue) -> Value {
    match value {
        PrefValue::Bool(b) => Value::Bool(*b),
        PrefValue::String(s) => Value::String(s.clone()),
        other => Value::String(format!("{:?}", other)),
    }
}

impl PreferenceStore for FilePreferences {
    fn get(&self, key: &str) -> Option<PrefValue> {
        let session = lock(&self.session);
        if let Some(v) = session.get(key) {
            return Some(v.clone());
        }
        drop(session);
        let persistent = lock(&self.persistent);
        persistent.get(key).and_then(from_json)
    }

    fn set(&self, key: &str, value: Option<PrefValue>, scope: PrefScope) {
        if scope == PrefScope::Session {
            let mut session = lock(&self.session);
            match value {
                Some(v) => session.insert(key.to_owned(), v),
                None => session.remove(key),
            };
            return;
        }

        let mut persistent = lock(&self.persistent);
        let changed = match &value {
            Some(v) => persistent.insert(key.to_owned(), to_json(v)) != Some(to_json(v)),
            None => persistent.remove(key).is_some(),
        };
        if changed {
            if let Err(e) = self.save(&persistent) {
                warn!("Couldn't save preference {}: {:#}", key, e);
            }
        }
    }
}

/// Read one line from stdin, after printing `question`.
///
/// Returns `None` at end of input.
async fn ask(question: String) -> Option<String> {
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        let mut stderr = std::io::stderr();
        let _ignore = write!(stderr, "{} ", question).and_then(|()| stderr.flush());
        let mut line = String::new();
        let answer = match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_owned()),
        };
        let _ignore = tx.send(answer);
    });
    rx.await.ok().flatten()
}

/// Read the file at `path` on a thread of its own, so as not to block the
/// runtime.
async fn read_file(path: PathBuf) -> Result<String> {
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Can't read {}", path.display()));
        let _ignore = tx.send(text);
    });
    rx.await.context("Reader thread went away")?
}

/// A [`UserSurface`] on the terminal.
///
/// The network settings "surface" reads a settings bundle from a JSON
/// file, either the one given on the command line or one the user names
/// at a prompt.
pub(crate) struct TerminalSurface<R: Runtime> {
    /// Whether we may prompt on stdin.
    interactive: bool,
    /// A settings file to apply when the network settings are opened.
    settings_file: Option<PathBuf>,
    /// The supervisor to apply settings with.
    supervisor: Mutex<Option<ProcessSupervisor<R>>>,
}

impl<R: Runtime> TerminalSurface<R> {
    /// Return a new surface.
    pub(crate) fn new(settings_file: Option<PathBuf>) -> Self {
        TerminalSurface {
            interactive: std::io::stdin().is_terminal(),
            settings_file,
            supervisor: Mutex::new(None),
        }
    }

    /// Use `supervisor` to apply settings.
    pub(crate) fn attach(&self, supervisor: ProcessSupervisor<R>) {
        *lock(&self.supervisor) = Some(supervisor);
    }

    /// Forget the supervisor.
    pub(crate) fn detach(&self) {
        lock(&self.supervisor).take();
    }

    /// Return the settings to apply.
    ///
    /// Without a settings file, that means no proxy, no firewall and no
    /// bridges.
    async fn choose_settings(&self) -> Result<SettingsBundle> {
        let path = match (&self.settings_file, self.interactive) {
            (Some(path), _) => Some(path.clone()),
            (None, true) => ask(
                "Network settings file (press Enter to connect without a proxy or bridges):"
                    .to_owned(),
            )
            .await
            .filter(|s| !s.is_empty())
            .map(PathBuf::from),
            (None, false) => None,
        };
        let Some(path) = path else {
            return Ok(SettingsBundle::default());
        };
        let text = read_file(path.clone()).await?;
        SettingsBundle::from_json(&text).with_context(|| format!("in {}", path.display()))
    }
}

#[async_trait]
impl<R: Runtime> UserSurface for TerminalSurface<R> {
    async fn confirm_restart(&self) -> bool {
        let restart = if self.interactive {
            let answer = ask("Tor exited unexpectedly. Restart it? [y/N]".to_owned()).await;
            matches!(answer.as_deref(), Some("y" | "Y" | "yes"))
        } else {
            info!("Tor exited; not restarting it without a terminal to ask on");
            false
        };
        if !restart {
            // Without Tor there is nothing left to show, so we quit.
            let supervisor = lock(&self.supervisor).clone();
            if let Some(supervisor) = supervisor {
                supervisor.request_quit(false).await;
            }
        }
        restart
    }

    async fn alert(&self, alert: &Alert) {
        let mut stderr = std::io::stderr();
        let _ignore = writeln!(stderr, "\n{}\n", alert);
    }

    async fn open_network_settings(&self, initial_bootstrap: bool) {
        let supervisor = lock(&self.supervisor).clone();
        let Some(supervisor) = supervisor else {
            debug!("No supervisor to apply settings with");
            return;
        };
        // Only a prompt can give a different answer next time.
        let can_retry = self.interactive && self.settings_file.is_none();
        loop {
            let bundle = match self.choose_settings().await {
                Ok(bundle) => bundle,
                Err(e) => {
                    warn!("{:#}", e);
                    if can_retry {
                        continue;
                    }
                    return;
                }
            };
            let result = match bundle.validate() {
                Ok(settings) => supervisor.apply_settings(&settings).await,
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(()) => {
                    info!(
                        "Applied network settings{}",
                        if initial_bootstrap { "; connecting" } else { "" }
                    );
                    return;
                }
                Err(e) => {
                    warn_report!(e, "Couldn't apply network settings");
                    if !can_retry {
                        return;
                    }
                }
            }
        }
    }

    async fn open_progress(&self, mut events: BootstrapEvents) {
        let mut stderr = std::io::stderr();
        while let Some(status) = events.next().await {
            let _ignore = writeln!(
                stderr,
                "Bootstrapped {}%: {}",
                status.progress(),
                status.summary()
            );
            if status.is_done() {
                return;
            }
        }
    }
}

/// A [`Notifier`] that logs every notification.
#[derive(Debug, Default)]
pub(crate) struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &LauncherEvent) {
        match event {
            LauncherEvent::BootstrapStatus(status) => {
                debug!(event = event.wire_name(), "{}", status);
            }
            LauncherEvent::ProcessDidNotStart { message } => {
                warn!(event = event.wire_name(), "{}", message);
            }
            other => info!(event = other.wire_name(), "Tor launcher event"),
        }
    }
}

/// Return every host service the CLI provides, with `host` as the process
/// host.
pub(crate) fn services<R: Runtime>(
    host: Arc<dyn tor_launcher::ProcessHost>,
    prefs: Arc<FilePreferences>,
    surface: Arc<TerminalSurface<R>>,
) -> tor_launcher::HostServices {
    tor_launcher::HostServices::new(
        host,
        prefs,
        Arc::new(tor_launcher::ProcessEnvironment::default()),
        surface,
        Arc::new(LogNotifier),
    )
}

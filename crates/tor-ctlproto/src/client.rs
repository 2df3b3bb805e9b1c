//! The command-level interface to a Tor control port.

use std::sync::Arc;

use futures::FutureExt as _;
use futures::task::SpawnExt as _;
use tor_error::{ErrorReport as _, debug_report};
use tor_rtcompat::Runtime;
use tracing::debug;

use crate::bootstrap::{BootstrapStatus, parse_bootstrap_line};
use crate::codec::{Reply, escape, parse_keyed_reply};
use crate::config::ControlPortConfig;
use crate::err::{ControlError, Result};
use crate::events::{ControlEvent, ControlEvents, EventShared, SUBSCRIBED_EVENTS, run_event_monitor};
use crate::log::LogEntry;
use crate::pool::{ConnectionPool, ControlAuth, EventConnection, Ownership};

/// How many times we try a command before giving up.
///
/// The second attempt absorbs a cached connection that went stale.
const SEND_ATTEMPTS: usize = 2;

/// The value to give a configuration option in a [`SetConf`].
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConfValue {
    /// A single string value.
    String(String),
    /// Several values for the same option.
    List(Vec<String>),
    /// A boolean, sent as `1` or `0`.
    Bool(bool),
    /// Reset the option to its default.
    Clear,
}

impl From<&str> for ConfValue {
    fn from(s: &str) -> Self {
        ConfValue::String(s.to_owned())
    }
}

impl From<String> for ConfValue {
    fn from(s: String) -> Self {
        ConfValue::String(s)
    }
}

impl From<bool> for ConfValue {
    fn from(b: bool) -> Self {
        ConfValue::Bool(b)
    }
}

impl From<Vec<String>> for ConfValue {
    fn from(v: Vec<String>) -> Self {
        ConfValue::List(v)
    }
}

impl From<Option<String>> for ConfValue {
    fn from(v: Option<String>) -> Self {
        v.map_or(ConfValue::Clear, ConfValue::String)
    }
}

/// An ordered set of configuration changes, sent as one `SETCONF`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SetConf {
    /// The options to change, in order.
    entries: Vec<(String, ConfValue)>,
}

impl SetConf {
    /// Return a new empty `SetConf`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an option to change, and return `self`.
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<ConfValue>) -> Self {
        self.push(key, value);
        self
    }

    /// Add an option to change.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<ConfValue>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Return true if there are no changes at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return the arguments for a `SETCONF` command.
    ///
    /// Lists produce one `key=value` pair per element, so an empty list
    /// produces nothing.
    pub fn to_args(&self) -> String {
        let mut args = Vec::new();
        for (key, value) in &self.entries {
            match value {
                ConfValue::String(s) => args.push(format!("{}={}", key, escape(s))),
                ConfValue::List(items) => {
                    args.extend(items.iter().map(|s| format!("{}={}", key, escape(s))));
                }
                ConfValue::Bool(b) => args.push(format!("{}={}", key, if *b { 1 } else { 0 })),
                ConfValue::Clear => args.push(key.clone()),
            }
        }
        args.join(" ")
    }
}

/// A failed `SETCONF`, described for a human.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{details}")]
#[non_exhaustive]
pub struct SetConfFailure {
    /// Tor's reply, or a description of why we didn't get one.
    pub details: String,
}

/// A client for the control port of one Tor process.
pub struct ProtocolClient<R: Runtime> {
    /// Runtime used for spawning the event monitor.
    runtime: R,
    /// The connections.
    pool: ConnectionPool<R>,
    /// State shared with the event monitor.
    shared: Arc<EventShared>,
}

impl<R: Runtime> ProtocolClient<R> {
    /// Create a new client.  No connection is made until one is needed.
    pub fn new(
        runtime: R,
        config: ControlPortConfig,
        auth: ControlAuth,
        ownership: Ownership,
    ) -> Self {
        let shared = Arc::new(EventShared::new(config.max_log_entries()));
        let pool = ConnectionPool::new(runtime.clone(), config, auth, ownership);
        ProtocolClient {
            runtime,
            pool,
            shared,
        }
    }

    /// Return the connection pool this client uses.
    pub fn pool(&self) -> &ConnectionPool<R> {
        &self.pool
    }

    /// Send a command, and return its reply.
    ///
    /// The reply may have any status: only failures to get a reply at all
    /// are errors.  If the first attempt fails, we try once more on a new
    /// connection.
    pub async fn send_command(&self, name: &str, args: &str) -> Result<Reply> {
        let mut attempt = 1;
        loop {
            match self.attempt_command(name, args).await {
                Ok(reply) => return Ok(reply),
                Err(e) if attempt < SEND_ATTEMPTS => {
                    debug_report!(&e, "Attempt {} to send {} failed", attempt, name);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Make one attempt to send a command on the primary connection.
    async fn attempt_command(&self, name: &str, args: &str) -> Result<Reply> {
        let mut conn = self.pool.acquire_primary().await?;
        match self.pool.send_and_await_reply(&mut conn, name, args).await {
            Ok(reply) => {
                self.pool.release(conn);
                Ok(reply)
            }
            Err(e) => {
                self.pool.close_and_drop(conn);
                Err(e)
            }
        }
    }

    /// Send a command, and fail unless the reply reports success.
    async fn send_checked(&self, name: &str, args: &str) -> Result<Reply> {
        let reply = self.send_command(name, args).await?;
        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(ControlError::Rejected {
                command: name.to_owned(),
                status: reply.status(),
                message: reply.message(),
            })
        }
    }

    /// Send a keyed query (`GETCONF` or `GETINFO`), and return the values
    /// for `key`.
    async fn query(&self, command: &str, key: &str) -> Result<Vec<String>> {
        let reply = self.send_checked(command, key).await?;
        parse_keyed_reply(command, key, &reply).map_err(|e| ControlError::Parse {
            command: command.to_owned(),
            problem: e.to_string(),
        })
    }

    /// Return every value of the configuration option `key`.
    pub async fn get_conf(&self, key: &str) -> Result<Vec<String>> {
        self.query("GETCONF", key).await
    }

    /// Return the value of the configuration option `key`, or `default` if
    /// it has no value.
    pub async fn get_conf_string(&self, key: &str, default: &str) -> Result<String> {
        let values = self.get_conf(key).await?;
        Ok(values
            .into_iter()
            .find(|v| !v.is_empty())
            .unwrap_or_else(|| default.to_owned()))
    }

    /// Return the boolean configuration option `key`, or `default` if it
    /// has no value.
    pub async fn get_conf_bool(&self, key: &str, default: bool) -> Result<bool> {
        let values = self.get_conf(key).await?;
        Ok(match values.iter().find(|v| !v.is_empty()) {
            Some(v) => v == "1",
            None => default,
        })
    }

    /// Return every value Tor reports for the information key `key`.
    pub async fn get_info(&self, key: &str) -> Result<Vec<String>> {
        self.query("GETINFO", key).await
    }

    /// Change some configuration options.
    pub async fn set_conf(&self, changes: &SetConf) -> Result<Reply> {
        let args = changes.to_args();
        if args.is_empty() {
            return Err(ControlError::EmptyCommand { command: "SETCONF" });
        }
        self.send_checked("SETCONF", &args).await
    }

    /// Change some configuration options, describing any failure for a
    /// human.
    pub async fn set_conf_with_reply(
        &self,
        changes: &SetConf,
    ) -> std::result::Result<(), SetConfFailure> {
        self.set_conf(changes).await.map(|_| ()).map_err(|e| {
            let details = match e {
                ControlError::Rejected { message, .. } => message,
                other => other.report().to_string(),
            };
            SetConfFailure { details }
        })
    }

    /// Ask Tor to write its configuration to disk.
    pub async fn save_conf(&self) -> Result<()> {
        self.send_checked("SAVECONF", "").await.map(|_| ())
    }

    /// Ask Tor for its bootstrap status, and tell subscribers about it.
    pub async fn retrieve_bootstrap_status(&self) -> Result<Option<BootstrapStatus>> {
        let values = self.get_info("status/bootstrap-phase").await?;
        let status = values.first().and_then(|v| parse_bootstrap_line(v));
        match &status {
            Some(s) => self.shared.publish(ControlEvent::Bootstrap(s.clone())),
            None => debug!("No bootstrap status in {:?}", values),
        }
        Ok(status)
    }

    /// Open the event connection and start reading events from it, unless
    /// that has happened already.
    pub async fn start_event_monitor(&self) -> Result<()> {
        let mut conn = match self.pool.acquire_event_connection().await? {
            EventConnection::AlreadyOpen => return Ok(()),
            EventConnection::New(conn) => conn,
        };
        // If anything fails from here on, dropping `conn` tears the event
        // connection back down.
        let reply = self
            .pool
            .send_and_await_reply(&mut conn, "SETEVENTS", SUBSCRIBED_EVENTS)
            .await?;
        if !reply.is_ok() {
            return Err(ControlError::Rejected {
                command: "SETEVENTS".into(),
                status: reply.status(),
                message: reply.message(),
            });
        }

        let id = conn.id();
        let (monitor, handle) = futures::future::abortable(run_event_monitor(
            self.runtime.clone(),
            conn,
            Arc::clone(&self.shared),
        ));
        self.pool.install_event_monitor(id, handle);
        self.runtime
            .spawn(monitor.map(|_| ()))
            .map_err(|e| ControlError::from_spawn("event monitor", e))?;
        debug!("{}: event monitor started", id);
        Ok(())
    }

    /// Return true if we have, or can open, a control connection.
    ///
    /// This sends no commands beyond those needed to open the connection.
    pub async fn have_control_connection(&self) -> bool {
        match self.pool.acquire_primary().await {
            Ok(conn) => {
                self.pool.release(conn);
                true
            }
            Err(e) => {
                debug_report!(e, "No control connection");
                false
            }
        }
    }

    /// Return a stream of events from this client.
    pub fn subscribe(&self) -> ControlEvents {
        self.shared.subscribe()
    }

    /// Return every captured log message, oldest first.
    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.shared.with_log(|log| log.entries())
    }

    /// Format every captured log message, one per line, ending each line
    /// with `eol`.
    pub fn export_log(&self, eol: &str) -> String {
        self.shared.with_log(|log| log.export(eol))
    }

    /// Return true if Tor has logged a warning or error since
    /// [`clear_log_warnings`](ProtocolClient::clear_log_warnings) was last
    /// called.
    pub fn log_has_warnings(&self) -> bool {
        self.shared.with_log(|log| log.has_warnings())
    }

    /// Forget that Tor has logged warnings.
    pub fn clear_log_warnings(&self) {
        self.shared.with_log(|log| log.clear_warnings());
    }

    /// Close every connection and stop the event monitor.
    pub fn shutdown(&self) {
        self.pool.shutdown();
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
    use crate::testing::{Action, FakeTor, mock_net, standard_reply};
    use futures::StreamExt as _;
    use safelog::Sensitive;
    use tor_rtmock::MockRuntime;

    /// Make a client that talks to `tor`.
    fn client<R: Runtime>(rt: R, tor: &FakeTor) -> ProtocolClient<R> {
        let config = ControlPortConfig::default().with_address(tor.addr());
        let auth = ControlAuth::Password(Sensitive::new("0123ABCD".into()));
        ProtocolClient::new(rt, config, auth, Ownership::Disowned)
    }

    #[test]
    fn set_conf_args() {
        let changes = SetConf::new().set("UseBridges", true).set(
            "Bridge",
            vec!["1.2.3.4:443".to_string(), "5.6.7.8:443".to_string()],
        );
        assert_eq!(
            changes.to_args(),
            "UseBridges=1 Bridge=1.2.3.4:443 Bridge=5.6.7.8:443"
        );

        let changes = SetConf::new()
            .set("Socks4Proxy", ConfValue::Clear)
            .set("HTTPSProxyAuthenticator", "user:pass word")
            .set("DisableNetwork", false)
            .set("Bridge", Vec::<String>::new())
            .set("Socks5Proxy", None);
        assert_eq!(
            changes.to_args(),
            "Socks4Proxy HTTPSProxyAuthenticator=\"user:pass word\" DisableNetwork=0 Socks5Proxy"
        );
    }

    #[test]
    fn get_conf_values() {
        MockRuntime::test_with_various(|rt| async move {
            let (net, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, standard_reply).await;
            let client = client(net, &tor);

            assert_eq!(
                client.get_conf_string("Socks4Proxy", "").await.unwrap(),
                "127.0.0.1:9050"
            );
            // "250 Socks5Proxy" means no value: the default applies.
            assert_eq!(
                client.get_conf_string("Socks5Proxy", "dflt").await.unwrap(),
                "dflt"
            );
            assert_eq!(client.get_conf_bool("UseBridges", true).await.unwrap(), true);
            assert_eq!(client.get_conf("Bridge").await.unwrap(), Vec::<String>::new());

            assert_eq!(tor.commands()[0], "AUTHENTICATE 0123ABCD");
            assert_eq!(tor.n_connections(), 1);
        });
    }

    #[test]
    fn late_reply_not_misattributed() {
        MockRuntime::test_with_various(|rt| async move {
            let (net, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, |_, line: &str| match line {
                "GETCONF Socks4Proxy" => Action::Reply("250 Socks4Proxy=127.0.0.1:9050\r\n".into()),
                "GETCONF Socks5Proxy" => Action::Reply("250 Socks5Proxy=10.0.0.1:1080\r\n".into()),
                _ => standard_reply(0, line),
            })
            .await;
            let client = client(net, &tor);

            assert_eq!(
                client.get_conf_string("Socks4Proxy", "").await.unwrap(),
                "127.0.0.1:9050"
            );
            // A straggling line from the previous reply.
            tor.push(0, "250 OK\r\n");
            rt.progress_until_stalled().await;

            assert_eq!(
                client.get_conf_string("Socks5Proxy", "dflt").await.unwrap(),
                "10.0.0.1:1080"
            );
            assert_eq!(
                client.get_conf_string("Socks4Proxy", "").await.unwrap(),
                "127.0.0.1:9050"
            );
            assert_eq!(tor.n_connections(), 1);
        });
    }

    #[test]
    fn get_conf_failure_is_not_default() {
        MockRuntime::test_with_various(|rt| async move {
            let (net, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, |_, line: &str| {
                if line.starts_with("GETCONF") {
                    Action::Reply("552 Unrecognized configuration key \"Nope\"\r\n".into())
                } else {
                    standard_reply(0, line)
                }
            })
            .await;
            let client = client(net, &tor);

            let err = client.get_conf_string("Nope", "dflt").await.unwrap_err();
            assert!(matches!(err, ControlError::Rejected { status: 552, .. }));
            let err = client.get_conf_bool("Nope", true).await.unwrap_err();
            assert!(matches!(err, ControlError::Rejected { .. }));
        });
    }

    #[test]
    fn bool_values() {
        MockRuntime::test_with_various(|rt| async move {
            let (net, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, |_, line: &str| match line {
                "GETCONF UseBridges" => Action::Reply("250 UseBridges=1\r\n".into()),
                "GETCONF DisableNetwork" => Action::Reply("250 DisableNetwork=0\r\n".into()),
                _ => standard_reply(0, line),
            })
            .await;
            let client = client(net, &tor);
            assert!(client.get_conf_bool("UseBridges", false).await.unwrap());
            assert!(!client.get_conf_bool("DisableNetwork", true).await.unwrap());
        });
    }

    #[test]
    fn set_conf_commands() {
        MockRuntime::test_with_various(|rt| async move {
            let (net, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, |_, line: &str| {
                if line.contains("Bogus") {
                    Action::Reply(
                        "552-Unrecognized option: Unknown option 'Bogus'.\r\n552 Failed to parse/validate config\r\n"
                            .into(),
                    )
                } else {
                    standard_reply(0, line)
                }
            })
            .await;
            let client = client(net, &tor);

            // Nothing to send: fail without touching the network.
            let err = client.set_conf(&SetConf::new()).await.unwrap_err();
            assert!(matches!(err, ControlError::EmptyCommand { .. }));
            let err = client
                .set_conf(&SetConf::new().set("Bridge", Vec::<String>::new()))
                .await
                .unwrap_err();
            assert!(matches!(err, ControlError::EmptyCommand { .. }));
            assert_eq!(tor.n_connections(), 0);

            let changes = SetConf::new().set("UseBridges", true).set(
                "Bridge",
                vec!["1.2.3.4:443".to_string(), "5.6.7.8:443".to_string()],
            );
            client.set_conf(&changes).await.unwrap();
            assert_eq!(
                tor.commands().last().unwrap(),
                "SETCONF UseBridges=1 Bridge=1.2.3.4:443 Bridge=5.6.7.8:443"
            );

            let failure = client
                .set_conf_with_reply(&SetConf::new().set("Bogus", "1"))
                .await
                .unwrap_err();
            assert_eq!(
                failure.details,
                "Unrecognized option: Unknown option 'Bogus'.\nFailed to parse/validate config"
            );

            client.save_conf().await.unwrap();
            assert_eq!(tor.commands().last().unwrap(), "SAVECONF");
        });
    }

    #[test]
    fn retry_once_then_succeed() {
        MockRuntime::test_with_various(|rt| async move {
            let (net, server) = mock_net(rt.clone());
            // The first connection dies as soon as it sees a real command.
            let tor = FakeTor::spawn(&server, |conn, line: &str| {
                if conn == 0 && line.starts_with("GETCONF") {
                    Action::HangUp
                } else {
                    standard_reply(conn, line)
                }
            })
            .await;
            let client = client(net, &tor);

            let reply = client.send_command("GETCONF", "Socks4Proxy").await.unwrap();
            assert_eq!(reply.lines(), &["Socks4Proxy=127.0.0.1:9050"]);
            assert_eq!(tor.n_connections(), 2);
            assert_eq!(tor.count("GETCONF"), 2);
        });
    }

    #[test]
    fn retry_exactly_twice() {
        MockRuntime::test_with_various(|rt| async move {
            let (net, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, |conn, line: &str| {
                if line.starts_with("GETCONF") {
                    Action::HangUp
                } else {
                    standard_reply(conn, line)
                }
            })
            .await;
            let client = client(net, &tor);

            let err = client.send_command("GETCONF", "Socks4Proxy").await.unwrap_err();
            assert!(matches!(err, ControlError::Closed));
            assert_eq!(tor.n_connections(), 2);
            assert_eq!(tor.count("GETCONF"), 2);
        });
    }

    #[test]
    fn socket_error_clears_cache() {
        MockRuntime::test_with_various(|rt| async move {
            let (net, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, |conn, line: &str| {
                if conn == 0 && line == "GETINFO version" {
                    Action::HangUp
                } else if line == "GETINFO version" {
                    Action::Reply("250-version=0.4.8.10\r\n250 OK\r\n".into())
                } else {
                    standard_reply(conn, line)
                }
            })
            .await;
            let client = client(net, &tor);

            // Warm the cache.
            client.save_conf().await.unwrap();
            assert_eq!(tor.n_connections(), 1);

            // The failing command fails once, and the retry uses a new
            // connection rather than the cached one.
            let v = client.get_info("version").await.unwrap();
            assert_eq!(v, vec!["0.4.8.10".to_string()]);
            assert_eq!(tor.n_connections(), 2);
            assert!(client.have_control_connection().await);
            assert_eq!(tor.n_connections(), 2);
        });
    }

    #[test]
    fn no_control_connection() {
        MockRuntime::test_with_various(|rt| async move {
            let (net, _server) = mock_net(rt.clone());
            let config = ControlPortConfig::default();
            let client = ProtocolClient::new(net, config, ControlAuth::None, Ownership::Disowned);
            assert!(!client.have_control_connection().await);
        });
    }

    #[test]
    fn bootstrap_status() {
        MockRuntime::test_with_various(|rt| async move {
            let (net, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, standard_reply).await;
            let client = client(net, &tor);
            let mut events = client.subscribe();

            let status = client.retrieve_bootstrap_status().await.unwrap().unwrap();
            assert_eq!(status.progress(), 100);
            assert_eq!(status.tag(), "done");
            assert!(!status.error_occurred());

            let ev = events.next().await.unwrap();
            assert_eq!(ev, ControlEvent::Bootstrap(status));
        });
    }

    #[test]
    fn event_monitor() {
        MockRuntime::test_with_various(|rt| async move {
            let (net, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, standard_reply).await;
            let client = client(net, &tor);
            let mut events = client.subscribe();

            client.start_event_monitor().await.unwrap();
            client.start_event_monitor().await.unwrap();
            assert_eq!(tor.count("SETEVENTS"), 1);
            assert_eq!(tor.n_connections(), 1);
            assert_eq!(
                tor.commands().last().unwrap(),
                "SETEVENTS STATUS_CLIENT NOTICE WARN ERR"
            );

            tor.push(
                0,
                concat!(
                    "650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=50 TAG=loading_descriptors SUMMARY=\"Loading relay descriptors\"\r\n",
                    "650 NOTICE Bootstrapped 50%\r\n",
                    "650 WARN Guard is unreachable\r\n",
                    "650 WARN Still unreachable\r\n",
                ),
            );
            rt.progress_until_stalled().await;

            let ControlEvent::Bootstrap(s) = events.next().await.unwrap() else {
                panic!()
            };
            assert_eq!(s.progress(), 50);
            assert_eq!(events.next().await.unwrap(), ControlEvent::LogHasWarnOrErr);

            assert!(client.log_has_warnings());
            assert_eq!(client.log_entries().len(), 3);
            let exported = client.export_log("\n");
            assert!(exported.contains("[NOTICE] Bootstrapped 50%\n"));
            assert!(exported.contains("[WARN] Guard is unreachable\n"));
            client.clear_log_warnings();
            assert!(!client.log_has_warnings());

            // Shutting down stops the monitor and closes the connection; a
            // new monitor can then be started.
            client.shutdown();
            rt.progress_until_stalled().await;
            assert!(!client.pool().has_event_connection());
            client.start_event_monitor().await.unwrap();
            assert_eq!(tor.count("SETEVENTS"), 2);
        });
    }

    #[test]
    fn non_event_reply_ignored() {
        MockRuntime::test_with_various(|rt| async move {
            let (net, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, standard_reply).await;
            let client = client(net, &tor);
            client.start_event_monitor().await.unwrap();
            assert!(client.pool().has_event_connection());

            tor.push(0, "250 OK\r\n650 NOTICE Still here\r\n");
            rt.progress_until_stalled().await;
            assert!(client.pool().has_event_connection());
            let entries = client.log_entries();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].message(), "Still here");
        });
    }

    #[test]
    fn setevents_failure_tears_down() {
        MockRuntime::test_with_various(|rt| async move {
            let (net, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, |conn, line: &str| {
                if line.starts_with("SETEVENTS") {
                    Action::Reply("552 Unrecognized event\r\n".into())
                } else {
                    standard_reply(conn, line)
                }
            })
            .await;
            let client = client(net, &tor);
            let err = client.start_event_monitor().await.unwrap_err();
            assert!(matches!(err, ControlError::Rejected { status: 552, .. }));
            assert!(!client.pool().has_event_connection());
        });
    }
}

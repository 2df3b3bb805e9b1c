//! Ownership of the connections to a control port.
//!
//! A [`ConnectionPool`] holds at most one primary connection (for commands)
//! and at most one event connection (for asynchronous events).  They are
//! never the same socket.
//!
//! The primary connection is lent out one command at a time: a caller takes
//! it with [`acquire_primary`](ConnectionPool::acquire_primary), and must
//! hand it back with either [`release`](ConnectionPool::release) (if it is
//! still healthy) or [`close_and_drop`](ConnectionPool::close_and_drop).
//! While it is lent out, any other attempt to acquire it fails with
//! [`ControlError::Busy`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::AbortHandle;
use futures::io::{AsyncRead, AsyncWrite};
use safelog::Sensitive;
use tor_error::{internal, warn_report};
use tor_rtcompat::{NetStreamProvider, Runtime, SleepProviderExt as _};
use tracing::{debug, info, warn};

use crate::codec::{ParsedReply, Reply, escape};
use crate::config::ControlPortConfig;
use crate::conn::{ConnId, ControlStream, Purpose};
use crate::err::{ControlError, Result};
use crate::util::lock;

/// The kind of stream a runtime gives us for TCP connections.
pub type RtStream<R> = <R as NetStreamProvider<SocketAddr>>::Stream;

/// How we prove to the control port that we are allowed to use it.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ControlAuth {
    /// Send `AUTHENTICATE` with no argument.
    None,
    /// Authenticate with a password.
    Password(Sensitive<String>),
    /// Authenticate with the contents of a cookie file.
    Cookie(Sensitive<Vec<u8>>),
}

impl ControlAuth {
    /// Return the argument to send with `AUTHENTICATE`.
    fn authenticate_arg(&self) -> String {
        match self {
            ControlAuth::None => String::new(),
            ControlAuth::Password(pw) => password_arg(pw.as_inner()),
            ControlAuth::Cookie(cookie) => hex::encode(cookie.as_inner()),
        }
    }
}

/// Encode a password for use with `AUTHENTICATE`.
///
/// A hex-encoded password is sent bare; anything else is sent as a quoted
/// string.
fn password_arg(password: &str) -> String {
    let escaped = escape(password);
    let is_hex = password.bytes().all(|b| b.is_ascii_hexdigit());
    if escaped.is_empty() || escaped.starts_with('"') || is_hex {
        escaped.into_owned()
    } else {
        format!("\"{}\"", escaped)
    }
}

/// Whether we take ownership of the Tor process when we connect to it.
///
/// A Tor process that we own exits when our primary connection closes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Ownership {
    /// Send `TAKEOWNERSHIP` on each new primary connection.
    TakeOwnership,
    /// Leave the Tor process alone: someone else is responsible for it.
    Disowned,
}

/// The state of the primary connection.
enum PrimarySlot<S> {
    /// There is no primary connection.
    Empty,
    /// Somebody is opening a primary connection.
    Opening,
    /// There is a primary connection, and nobody is using it.
    Idle(ControlStream<S>),
    /// The primary connection with this identifier is lent out.
    InUse(ConnId),
}

/// The state of the event connection.
enum EventSlot {
    /// There is no event connection.
    Closed,
    /// Somebody is opening an event connection.
    Opening,
    /// An event connection is open, but nobody is reading it yet.
    Open(ConnId),
    /// An event connection is open, and a task is reading it.
    Monitoring {
        /// The connection's identifier.
        id: ConnId,
        /// A handle to stop the task that reads it.
        handle: AbortHandle,
    },
}

impl EventSlot {
    /// Return the identifier of the connection in this slot, if any.
    fn id(&self) -> Option<ConnId> {
        match self {
            EventSlot::Open(id) | EventSlot::Monitoring { id, .. } => Some(*id),
            EventSlot::Closed | EventSlot::Opening => None,
        }
    }
}

/// Mutable state for a [`ConnectionPool`].
struct PoolState<S> {
    /// The primary connection.
    primary: PrimarySlot<S>,
    /// The event connection.
    event: EventSlot,
    /// Incremented every time the pool is shut down.
    ///
    /// A connection opened during one epoch is discarded if it finishes
    /// opening in a later one.
    epoch: u64,
}

/// A connection lent out by a [`ConnectionPool`].
///
/// Dropping this without returning it to the pool closes the socket.
pub struct Connection<S> {
    /// The connection's identifier.
    id: ConnId,
    /// What the connection is for.
    purpose: Purpose,
    /// The connection itself.
    ///
    /// Always `Some` until this is consumed.
    stream: Option<ControlStream<S>>,
    /// The state of the pool this connection belongs to.
    state: Arc<Mutex<PoolState<S>>>,
}

impl<S> Connection<S> {
    /// Return this connection's identifier.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Return the underlying stream.
    pub(crate) fn stream_mut(&mut self) -> Result<&mut ControlStream<S>> {
        self.stream
            .as_mut()
            .ok_or_else(|| internal!("Connection {} used after being returned", self.id).into())
    }

    /// Take the stream out of this connection, so that dropping it won't
    /// touch the pool.
    fn take_stream(&mut self) -> Option<ControlStream<S>> {
        self.stream.take()
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        {
            let mut st = lock(&self.state);
            match self.purpose {
                Purpose::Primary => {
                    if matches!(st.primary, PrimarySlot::InUse(id) if id == self.id) {
                        st.primary = PrimarySlot::Empty;
                    }
                }
                Purpose::Event => {
                    if st.event.id() == Some(self.id) {
                        st.event = EventSlot::Closed;
                    }
                }
            }
        }
        debug!("{}: closing {} connection", self.id, self.purpose);
        drop(stream);
    }
}

/// Clears an `Opening` slot if the open doesn't finish.
struct OpeningGuard<'a, S> {
    /// The state to fix up.
    state: &'a Mutex<PoolState<S>>,
    /// Which slot we are opening.
    purpose: Purpose,
    /// The epoch in which we started opening.
    epoch: u64,
}

impl<S> Drop for OpeningGuard<'_, S> {
    fn drop(&mut self) {
        let mut st = lock(self.state);
        if st.epoch != self.epoch {
            return;
        }
        match self.purpose {
            Purpose::Primary => {
                if matches!(st.primary, PrimarySlot::Opening) {
                    st.primary = PrimarySlot::Empty;
                }
            }
            Purpose::Event => {
                if matches!(st.event, EventSlot::Opening) {
                    st.event = EventSlot::Closed;
                }
            }
        }
    }
}

/// The result of [`ConnectionPool::acquire_event_connection`].
#[non_exhaustive]
pub enum EventConnection<S> {
    /// We opened a new event connection.
    New(Connection<S>),
    /// There was already an event connection.
    AlreadyOpen,
}

/// Owner of the connections to one control port.
pub struct ConnectionPool<R: Runtime> {
    /// Runtime used to connect and to time out commands.
    runtime: R,
    /// Where to connect, and how long to wait.
    config: ControlPortConfig,
    /// How to authenticate.
    auth: ControlAuth,
    /// Whether to take ownership of the process.
    ownership: Ownership,
    /// Source of connection identifiers.
    next_id: AtomicU64,
    /// The connections themselves.
    state: Arc<Mutex<PoolState<RtStream<R>>>>,
}

impl<R: Runtime> ConnectionPool<R> {
    /// Create a new empty pool.
    pub fn new(
        runtime: R,
        config: ControlPortConfig,
        auth: ControlAuth,
        ownership: Ownership,
    ) -> Self {
        ConnectionPool {
            runtime,
            config,
            auth,
            ownership,
            next_id: AtomicU64::new(1),
            state: Arc::new(Mutex::new(PoolState {
                primary: PrimarySlot::Empty,
                event: EventSlot::Closed,
                epoch: 0,
            })),
        }
    }

    /// Return the configuration this pool uses.
    pub fn config(&self) -> &ControlPortConfig {
        &self.config
    }

    /// Borrow the primary connection, opening it if necessary.
    pub async fn acquire_primary(&self) -> Result<Connection<RtStream<R>>> {
        let epoch = {
            let mut st = lock(&self.state);
            match std::mem::replace(&mut st.primary, PrimarySlot::Empty) {
                PrimarySlot::Idle(stream) => {
                    let id = stream.id();
                    st.primary = PrimarySlot::InUse(id);
                    return Ok(self.lend(id, Purpose::Primary, stream));
                }
                busy @ (PrimarySlot::InUse(_) | PrimarySlot::Opening) => {
                    st.primary = busy;
                    return Err(ControlError::Busy);
                }
                PrimarySlot::Empty => {
                    st.primary = PrimarySlot::Opening;
                    st.epoch
                }
            }
        };

        let _guard = OpeningGuard {
            state: &self.state,
            purpose: Purpose::Primary,
            epoch,
        };
        let stream = self.open_authenticated(Purpose::Primary).await?;
        let id = stream.id();
        {
            let mut st = lock(&self.state);
            if st.epoch != epoch {
                return Err(ControlError::Closed);
            }
            st.primary = PrimarySlot::InUse(id);
        }
        Ok(self.lend(id, Purpose::Primary, stream))
    }

    /// Give back a healthy primary connection, for use by later commands.
    pub fn release(&self, mut conn: Connection<RtStream<R>>) {
        let Some(stream) = conn.take_stream() else {
            return;
        };
        let mut st = lock(&self.state);
        if matches!(st.primary, PrimarySlot::InUse(id) if id == conn.id) {
            st.primary = PrimarySlot::Idle(stream);
        } else {
            // The pool was shut down while this was lent out.
            drop(st);
            debug!("{}: not caching connection after shutdown", conn.id);
        }
    }

    /// Close a connection, and forget about it.
    pub fn close_and_drop(&self, conn: Connection<RtStream<R>>) {
        drop(conn);
    }

    /// Open the event connection, unless it's already open.
    pub async fn acquire_event_connection(&self) -> Result<EventConnection<RtStream<R>>> {
        let epoch = {
            let mut st = lock(&self.state);
            if !matches!(st.event, EventSlot::Closed) {
                return Ok(EventConnection::AlreadyOpen);
            }
            st.event = EventSlot::Opening;
            st.epoch
        };

        let _guard = OpeningGuard {
            state: &self.state,
            purpose: Purpose::Event,
            epoch,
        };
        let stream = self.open_authenticated(Purpose::Event).await?;
        let id = stream.id();
        {
            let mut st = lock(&self.state);
            if st.epoch != epoch {
                return Err(ControlError::Closed);
            }
            st.event = EventSlot::Open(id);
        }
        Ok(EventConnection::New(self.lend(id, Purpose::Event, stream)))
    }

    /// Record the task reading the event connection `id`, so that
    /// [`shutdown`](ConnectionPool::shutdown) can stop it.
    ///
    /// If that connection is gone already, the task is stopped at once.
    pub(crate) fn install_event_monitor(&self, id: ConnId, handle: AbortHandle) {
        let mut st = lock(&self.state);
        if matches!(st.event, EventSlot::Open(open) if open == id) {
            st.event = EventSlot::Monitoring { id, handle };
        } else {
            drop(st);
            handle.abort();
        }
    }

    /// Return true if an event connection is open.
    pub fn has_event_connection(&self) -> bool {
        lock(&self.state).event.id().is_some()
    }

    /// Send a command on `conn`, and wait for its reply.
    ///
    /// If this fails, `conn` must not be used again.
    pub async fn send_and_await_reply(
        &self,
        conn: &mut Connection<RtStream<R>>,
        command: &str,
        args: &str,
    ) -> Result<Reply> {
        self.exchange(conn.stream_mut()?, command, args).await
    }

    /// Close every connection and stop the event monitor.
    ///
    /// Connections that are lent out at the time are closed when they are
    /// returned.  The pool can be used again afterwards.
    pub fn shutdown(&self) {
        let (primary, event) = {
            let mut st = lock(&self.state);
            st.epoch += 1;
            (
                std::mem::replace(&mut st.primary, PrimarySlot::Empty),
                std::mem::replace(&mut st.event, EventSlot::Closed),
            )
        };
        if let EventSlot::Monitoring { id, handle } = event {
            debug!("{}: stopping event monitor", id);
            handle.abort();
        }
        if let PrimarySlot::Idle(stream) = primary {
            debug!("{}: closing primary connection", stream.id());
            drop(stream);
        }
    }

    /// Wrap `stream` so it can be lent out.
    fn lend(
        &self,
        id: ConnId,
        purpose: Purpose,
        stream: ControlStream<RtStream<R>>,
    ) -> Connection<RtStream<R>> {
        Connection {
            id,
            purpose,
            stream: Some(stream),
            state: Arc::clone(&self.state),
        }
    }

    /// Send one command and wait for its reply, giving up after the
    /// configured timeout.
    async fn exchange<S>(&self, stream: &mut ControlStream<S>, command: &str, args: &str) -> Result<Reply>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let timeout = self.config.command_timeout();
        let outcome = self
            .runtime
            .timeout(timeout, async {
                stream.write_command(command, args).await?;
                stream.read_reply().await
            })
            .await
            .map_err(|_| ControlError::Timeout {
                command: command.to_owned(),
            })??;
        match outcome {
            ParsedReply::Ok(reply) => Ok(reply),
            ParsedReply::ParseFailure { problem } => Err(ControlError::Parse {
                command: command.to_owned(),
                problem,
            }),
        }
    }

    /// Open a new connection and authenticate on it.
    ///
    /// For a primary connection, we also take ownership of the process
    /// if we're supposed to.
    async fn open_authenticated(&self, purpose: Purpose) -> Result<ControlStream<RtStream<R>>> {
        let addr = self.config.address();
        let id = ConnId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!("{}: opening {} connection to {}", id, purpose, addr);

        let socket = self
            .runtime
            .timeout(self.config.command_timeout(), self.runtime.connect(&addr))
            .await
            .map_err(|_| ControlError::Timeout {
                command: "connect".into(),
            })?
            .map_err(|e| ControlError::Connect {
                addr,
                cause: Arc::new(e),
            })?;
        let mut stream = ControlStream::new(id, socket);

        let reply = self
            .exchange(&mut stream, "AUTHENTICATE", &self.auth.authenticate_arg())
            .await?;
        if !reply.is_ok() {
            return Err(ControlError::Auth {
                status: reply.status(),
                message: reply.message(),
            });
        }

        if purpose == Purpose::Primary && self.ownership == Ownership::TakeOwnership {
            self.take_ownership(&mut stream).await?;
        }
        info!("{}: {} connection ready", id, purpose);
        Ok(stream)
    }

    /// Ask Tor to exit when `stream` closes.
    ///
    /// A refusal is only logged; a broken connection is an error.
    async fn take_ownership<S>(&self, stream: &mut ControlStream<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        for (command, args) in [
            ("TAKEOWNERSHIP", ""),
            ("RESETCONF", "__OwningControllerProcess"),
        ] {
            match self.exchange(stream, command, args).await {
                Ok(reply) if reply.is_ok() => {}
                Ok(reply) => {
                    warn!(
                        "{}: {} failed: {} {}",
                        stream.id(),
                        command,
                        reply.status(),
                        reply.message()
                    );
                    return Ok(());
                }
                Err(e) if e.is_connection_failure() => return Err(e),
                Err(e) => {
                    warn_report!(e, "{}: {} failed", stream.id(), command);
                    return Ok(());
                }
            }
        }
        Ok(())
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
    use std::time::Duration;
    use tor_rtmock::MockRuntime;

    #[test]
    fn password_encoding() {
        assert_eq!(password_arg(""), "");
        assert_eq!(password_arg("0123abcdef"), "0123abcdef");
        assert_eq!(password_arg("hunter2!"), "\"hunter2!\"");
        assert_eq!(password_arg("two words"), "\"two words\"");
        assert_eq!(password_arg("q\"uote"), r#""q\"uote""#);

        let auth = ControlAuth::Cookie(Sensitive::new(vec![0xde, 0xad]));
        assert_eq!(auth.authenticate_arg(), "dead");
        assert_eq!(format!("{:?}", auth), "Cookie([scrubbed])");
    }

    /// Make a pool that talks to `tor`.
    fn pool<R: Runtime>(rt: R, tor: &FakeTor, ownership: Ownership) -> ConnectionPool<R> {
        let config = ControlPortConfig::default().with_address(tor.addr());
        let auth = ControlAuth::Password(Sensitive::new("s3cret".into()));
        ConnectionPool::new(rt, config, auth, ownership)
    }

    #[test]
    fn acquire_and_reuse() {
        MockRuntime::test_with_various(|rt| async move {
            let (client, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, standard_reply).await;
            let pool = pool(client, &tor, Ownership::TakeOwnership);

            let mut conn = pool.acquire_primary().await.unwrap();
            assert!(matches!(pool.acquire_primary().await, Err(ControlError::Busy)));
            let reply = pool
                .send_and_await_reply(&mut conn, "GETCONF", "Socks4Proxy")
                .await
                .unwrap();
            assert_eq!(reply.lines(), &["Socks4Proxy=127.0.0.1:9050"]);
            pool.release(conn);

            let mut conn = pool.acquire_primary().await.unwrap();
            pool.send_and_await_reply(&mut conn, "SAVECONF", "")
                .await
                .unwrap();
            pool.release(conn);

            assert_eq!(tor.n_connections(), 1);
            assert_eq!(
                tor.commands(),
                vec![
                    "AUTHENTICATE \"s3cret\"",
                    "TAKEOWNERSHIP",
                    "RESETCONF __OwningControllerProcess",
                    "GETCONF Socks4Proxy",
                    "SAVECONF",
                ]
            );
        });
    }

    #[test]
    fn disowned_skips_ownership() {
        MockRuntime::test_with_various(|rt| async move {
            let (client, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, standard_reply).await;
            let pool = pool(client, &tor, Ownership::Disowned);

            let conn = pool.acquire_primary().await.unwrap();
            pool.release(conn);
            assert_eq!(tor.commands(), vec!["AUTHENTICATE \"s3cret\""]);
        });
    }

    #[test]
    fn ownership_refusal_is_not_fatal() {
        MockRuntime::test_with_various(|rt| async move {
            let (client, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, |_, line: &str| {
                if line == "TAKEOWNERSHIP" {
                    Action::Reply("510 Unrecognized command\r\n".into())
                } else {
                    standard_reply(0, line)
                }
            })
            .await;
            let pool = pool(client, &tor, Ownership::TakeOwnership);

            let conn = pool.acquire_primary().await.unwrap();
            pool.release(conn);
            assert_eq!(tor.count("RESETCONF"), 0);
        });
    }

    #[test]
    fn auth_failure() {
        MockRuntime::test_with_various(|rt| async move {
            let (client, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, |_, _: &str| {
                Action::Reply("515 Authentication failed\r\n".into())
            })
            .await;
            let pool = pool(client, &tor, Ownership::TakeOwnership);

            let err = pool.acquire_primary().await.err().unwrap();
            assert!(matches!(err, ControlError::Auth { status: 515, .. }));
            // The slot was cleared; we can try again.
            let err = pool.acquire_primary().await.err().unwrap();
            assert!(matches!(err, ControlError::Auth { .. }));
            assert_eq!(tor.n_connections(), 2);
        });
    }

    #[test]
    fn connect_failure() {
        MockRuntime::test_with_various(|rt| async move {
            let (client, _server) = mock_net(rt.clone());
            let config =
                ControlPortConfig::default().with_address("127.0.0.1:9999".parse().unwrap());
            let pool = ConnectionPool::new(client, config, ControlAuth::None, Ownership::Disowned);
            let err = pool.acquire_primary().await.err().unwrap();
            assert!(matches!(err, ControlError::Connect { .. }));
        });
    }

    #[test]
    fn socket_error_drops_connection() {
        MockRuntime::test_with_various(|rt| async move {
            let (client, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, |_, line: &str| {
                if line.starts_with("GETINFO") {
                    Action::HangUp
                } else {
                    standard_reply(0, line)
                }
            })
            .await;
            let pool = pool(client, &tor, Ownership::Disowned);

            let mut conn = pool.acquire_primary().await.unwrap();
            let err = pool
                .send_and_await_reply(&mut conn, "GETINFO", "version")
                .await
                .unwrap_err();
            assert!(matches!(err, ControlError::Closed));
            pool.close_and_drop(conn);

            // The cache is empty, so we reconnect.
            let conn = pool.acquire_primary().await.unwrap();
            pool.release(conn);
            assert_eq!(tor.n_connections(), 2);
        });
    }

    #[test]
    fn timeout() {
        MockRuntime::test_with_various(|rt| async move {
            let (client, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, |_, line: &str| {
                if line.starts_with("GETINFO") {
                    Action::Ignore
                } else {
                    standard_reply(0, line)
                }
            })
            .await;
            let pool = Arc::new(pool(client, &tor, Ownership::Disowned));

            let pool2 = Arc::clone(&pool);
            let task = rt.spawn_join("send", async move {
                let mut conn = pool2.acquire_primary().await.unwrap();
                let r = pool2
                    .send_and_await_reply(&mut conn, "GETINFO", "version")
                    .await;
                pool2.close_and_drop(conn);
                r
            });
            rt.progress_until_stalled().await;
            rt.advance_by(Duration::from_secs(16)).await;
            let err = task.await.unwrap_err();
            assert!(matches!(err, ControlError::Timeout { .. }));
        });
    }

    #[test]
    fn event_connection_idempotent() {
        MockRuntime::test_with_various(|rt| async move {
            let (client, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, standard_reply).await;
            let pool = pool(client, &tor, Ownership::TakeOwnership);

            let EventConnection::New(conn) = pool.acquire_event_connection().await.unwrap() else {
                panic!()
            };
            assert!(pool.has_event_connection());
            assert!(matches!(
                pool.acquire_event_connection().await.unwrap(),
                EventConnection::AlreadyOpen
            ));
            // No ownership negotiation on the event connection.
            assert_eq!(tor.commands(), vec!["AUTHENTICATE \"s3cret\""]);

            drop(conn);
            assert!(!pool.has_event_connection());
        });
    }

    #[test]
    fn shutdown_closes() {
        MockRuntime::test_with_various(|rt| async move {
            let (client, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, standard_reply).await;
            let pool = pool(client, &tor, Ownership::Disowned);

            let conn = pool.acquire_primary().await.unwrap();
            let lent = pool.acquire_event_connection().await.unwrap();
            pool.shutdown();
            assert!(!pool.has_event_connection());
            // Returning a connection after shutdown closes it.
            pool.release(conn);
            drop(lent);

            let conn = pool.acquire_primary().await.unwrap();
            pool.release(conn);
            assert_eq!(tor.n_connections(), 3);
        });
    }
}

//! A fake Tor control port, for tests.
//!
//! Available to other crates with the `testing` feature.

// @@ begin test lint list maintained by maint/add_warning @@
#![allow(clippy::bool_assert_comparison)]
#![allow(clippy::clone_on_copy)]
#![allow(clippy::dbg_macro)]
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
#![allow(clippy::single_char_pattern)]
#![allow(clippy::unwrap_used)]
//! <!-- @@ end test lint list maintained by maint/add_warning @@ -->

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use futures::channel::mpsc;
use futures::io::{AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _, BufReader};
use futures::task::SpawnExt as _;
use futures::{StreamExt as _, select};
use tor_rtcompat::{NetStreamListener as _, NetStreamProvider as _, Runtime};
use tor_rtmock::MockNetRuntime;
use tor_rtmock::io::LocalStream;
use tor_rtmock::net::MockNetwork;

/// Address the fake Tor listens on.
pub const FAKE_TOR_ADDR: &str = "127.0.0.1:9151";

/// Address the client side of a mock network uses.
const CLIENT_IP: &str = "127.0.0.2";

/// What the fake Tor does with a command.
#[derive(Debug)]
#[non_exhaustive]
pub enum Action {
    /// Write this text back.
    Reply(String),
    /// Close the connection.
    HangUp,
    /// Say nothing.
    Ignore,
}

/// Answer commands the way a healthy Tor would.
pub fn standard_reply(_conn: usize, line: &str) -> Action {
    let (cmd, args) = line.split_once(' ').unwrap_or((line, ""));
    let text = match (cmd, args) {
        ("GETCONF", "Socks4Proxy") => "250 Socks4Proxy=127.0.0.1:9050\r\n250 OK\r\n".to_string(),
        ("GETCONF", key) => format!("250 {}\r\n", key),
        ("GETINFO", "status/bootstrap-phase") => concat!(
            "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY=\"Done\"\r\n",
            "250 OK\r\n"
        )
        .to_string(),
        ("GETINFO", key) => format!("552 Unrecognized key \"{}\"\r\n", key),
        _ => "250 OK\r\n".to_string(),
    };
    Action::Reply(text)
}

/// Everything the fake Tor has seen.
#[derive(Default, Debug)]
struct Transcript {
    /// Number of connections accepted.
    connections: usize,
    /// Every command received, with the index of its connection.
    commands: Vec<(usize, String)>,
    /// Channels for pushing unsolicited text to each connection.
    pushers: Vec<mpsc::UnboundedSender<String>>,
}

/// A handle to a running fake Tor control port.
#[derive(Clone, Debug)]
pub struct FakeTor {
    /// The address it listens on.
    addr: SocketAddr,
    /// What it has seen.
    transcript: Arc<Mutex<Transcript>>,
}

/// Make a mock network with a client runtime and a server runtime.
///
/// The server runtime owns 127.0.0.1.
pub fn mock_net<R: Runtime>(rt: R) -> (MockNetRuntime<R>, MockNetRuntime<R>) {
    let network = MockNetwork::new();
    let server_ip: SocketAddr = FAKE_TOR_ADDR.parse().unwrap();
    let client_ip: IpAddr = CLIENT_IP.parse().unwrap();
    let client = network.builder().add_address(client_ip).runtime(rt.clone());
    let server = network.builder().add_address(server_ip.ip()).runtime(rt);
    (client, server)
}

impl FakeTor {
    /// Start listening on [`FAKE_TOR_ADDR`], answering every command with
    /// `respond`.
    pub async fn spawn<R, F>(server: &MockNetRuntime<R>, respond: F) -> FakeTor
    where
        R: Runtime,
        F: Fn(usize, &str) -> Action + Send + Sync + 'static,
    {
        let addr: SocketAddr = FAKE_TOR_ADDR.parse().unwrap();
        let listener = server.mock_net().listen(&addr).await.unwrap();
        let transcript = Arc::new(Mutex::new(Transcript::default()));
        let respond = Arc::new(respond);

        let spawner = server.clone();
        let t = Arc::clone(&transcript);
        server
            .spawn(async move {
                let mut incoming = listener.incoming();
                while let Some(Ok((stream, _))) = incoming.next().await {
                    let (tx, rx) = mpsc::unbounded();
                    let idx = {
                        let mut t = t.lock().unwrap();
                        t.connections += 1;
                        t.pushers.push(tx);
                        t.connections - 1
                    };
                    spawner
                        .spawn(serve(idx, stream, Arc::clone(&respond), Arc::clone(&t), rx))
                        .unwrap();
                }
            })
            .unwrap();

        FakeTor { addr, transcript }
    }

    /// Return the address this fake Tor listens on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Return the number of connections accepted so far.
    pub fn n_connections(&self) -> usize {
        self.transcript.lock().unwrap().connections
    }

    /// Return every command received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.transcript
            .lock()
            .unwrap()
            .commands
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Return the number of commands received that start with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Write `text` to connection number `conn`, unprompted.
    pub fn push(&self, conn: usize, text: &str) {
        let t = self.transcript.lock().unwrap();
        t.pushers[conn].unbounded_send(text.to_owned()).unwrap();
    }
}

/// Handle one connection to the fake Tor.
async fn serve<F>(
    idx: usize,
    stream: LocalStream,
    respond: Arc<F>,
    transcript: Arc<Mutex<Transcript>>,
    mut pushed: mpsc::UnboundedReceiver<String>,
) where
    F: Fn(usize, &str) -> Action + Send + Sync + 'static,
{
    let (r, mut w) = stream.split();
    let mut lines = BufReader::new(r).lines().fuse();
    loop {
        select! {
            line = lines.next() => {
                let Some(Ok(line)) = line else {
                    return;
                };
                transcript.lock().unwrap().commands.push((idx, line.clone()));
                match respond(idx, &line) {
                    Action::Reply(text) => {
                        if w.write_all(text.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                    Action::HangUp => return,
                    Action::Ignore => {}
                }
            }
            text = pushed.next() => {
                let Some(text) = text else {
                    continue;
                };
                if w.write_all(text.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    }
}

//! A single connection to a control port.

use std::fmt;

use futures::FutureExt as _;
use futures::io::{
    AsyncBufReadExt as _, AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _, BufReader,
};
use tracing::{debug, trace};

use crate::codec::{ParsedReply, ReplyAccumulator, encode_command};
use crate::err::{ControlError, Result};

/// The longest line we accept from the control port, terminator included.
///
/// Tor's own replies are far shorter; the limit only bounds what a broken or
/// hostile peer can make us buffer.
pub(crate) const MAX_LINE_LEN: u64 = 64 * 1024;

/// An identifier for a control connection, unique within one pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnId(pub(crate) u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctl#{}", self.0)
    }
}

/// What a connection is used for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Purpose {
    /// Commands and their replies.
    Primary,
    /// Asynchronous events.
    Event,
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Purpose::Primary => f.write_str("primary"),
            Purpose::Event => f.write_str("event"),
        }
    }
}

/// An open connection to the control port, with its read buffer.
pub(crate) struct ControlStream<S> {
    /// Our identifier.
    id: ConnId,
    /// The underlying socket.
    stream: BufReader<S>,
    /// How many commands we've sent on this connection.
    use_count: u64,
    /// The name of the last command we sent, for error messages.
    last_command: String,
}

impl<S> ControlStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a freshly opened socket.
    pub(crate) fn new(id: ConnId, stream: S) -> Self {
        ControlStream {
            id,
            stream: BufReader::new(stream),
            use_count: 0,
            last_command: String::new(),
        }
    }

    /// Return this connection's identifier.
    pub(crate) fn id(&self) -> ConnId {
        self.id
    }

    /// Return the number of commands sent on this connection.
    pub(crate) fn use_count(&self) -> u64 {
        self.use_count
    }

    /// Throw away everything the peer has already sent us.
    ///
    /// Anything that arrives before we send a command can't be a reply to
    /// it: it is the tail of an earlier reply, which must never be read as
    /// the answer to a later command.  We drain whatever is readable without
    /// waiting, not just what happens to be buffered.
    fn discard_stale_input(&mut self) -> Result<()> {
        let mut discarded = 0;
        loop {
            let n = match self.stream.fill_buf().now_or_never() {
                // Nothing more to read right now.
                None => break,
                Some(Ok(buf)) if buf.is_empty() => break,
                Some(Ok(buf)) => buf.len(),
                Some(Err(e)) => return Err(e.into()),
            };
            self.stream.consume_unpin(n);
            discarded += n;
        }
        if discarded > 0 {
            debug!("{}: discarded {} bytes of unread input", self.id, discarded);
        }
        Ok(())
    }

    /// Send a single command.
    ///
    /// Only the command name is logged; arguments can include passwords.
    pub(crate) async fn write_command(&mut self, name: &str, args: &str) -> Result<()> {
        self.discard_stale_input()?;
        self.use_count += 1;
        name.clone_into(&mut self.last_command);
        trace!("{}: sending {} (use {})", self.id, name, self.use_count);
        let line = encode_command(name, args);
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read one line, without its line terminator.
    ///
    /// Returns `None` at end of stream, including when the stream ends in
    /// the middle of a line.  A line longer than [`MAX_LINE_LEN`], or one
    /// that isn't UTF-8, is an error.
    pub(crate) async fn read_line(&mut self) -> Result<Option<String>> {
        let mut buf = Vec::new();
        let n = (&mut self.stream)
            .take(MAX_LINE_LEN)
            .read_until(b'\n', &mut buf)
            .await?;
        if buf.last() != Some(&b'\n') {
            if n as u64 >= MAX_LINE_LEN {
                return Err(self.parse_error(format!("line longer than {} bytes", MAX_LINE_LEN)));
            }
            return Ok(None);
        }
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        String::from_utf8(buf)
            .map(Some)
            .map_err(|e| self.parse_error(format!("line is not UTF-8: {}", e.utf8_error())))
    }

    /// Return a parse error about the reply to the last command we sent.
    fn parse_error(&self, problem: String) -> ControlError {
        let command = if self.last_command.is_empty() {
            "(no command)".to_owned()
        } else {
            self.last_command.clone()
        };
        ControlError::Parse { command, problem }
    }

    /// Read lines until we have a complete reply.
    pub(crate) async fn read_reply(&mut self) -> Result<ParsedReply> {
        let mut acc = ReplyAccumulator::new();
        loop {
            let Some(line) = self.read_line().await? else {
                return Err(ControlError::Closed);
            };
            if acc.push_line(&line) {
                return Ok(acc.finish());
            }
        }
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
    use crate::codec::Reply;
    use futures::io::AsyncReadExt as _;
    use tor_rtmock::MockRuntime;
    use tor_rtmock::io::stream_pair;

    #[test]
    fn command_and_reply() {
        MockRuntime::test_with_various(|_rt| async move {
            let (ours, mut theirs) = stream_pair();
            let mut conn = ControlStream::new(ConnId(7), ours);
            assert_eq!(conn.id().to_string(), "ctl#7");

            conn.write_command("GETINFO", "version").await.unwrap();
            let mut buf = [0_u8; 17];
            theirs.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"GETINFO version\r\n");

            theirs
                .write_all(b"250-version=0.4.8.10\r\n250 OK\r\n")
                .await
                .unwrap();
            let ParsedReply::Ok(reply) = conn.read_reply().await.unwrap() else {
                panic!()
            };
            assert_eq!(reply.lines(), &["version=0.4.8.10"]);
        });
    }

    #[test]
    fn reply_then_stale_discarded() {
        MockRuntime::test_with_various(|_rt| async move {
            let (ours, mut theirs) = stream_pair();
            let mut conn = ControlStream::new(ConnId(1), ours);

            theirs
                .write_all(b"250 Socks4Proxy=127.0.0.1:9050\r\n250 OK\r\n")
                .await
                .unwrap();
            let reply = conn.read_reply().await.unwrap();
            assert_eq!(
                reply,
                ParsedReply::Ok(Reply::new(250, vec!["Socks4Proxy=127.0.0.1:9050".into()]))
            );

            // The trailing "250 OK" is still buffered; sending another command
            // throws it away.
            conn.write_command("SAVECONF", "").await.unwrap();
            assert_eq!(conn.use_count(), 1);
            theirs.write_all(b"551 Unable\r\n").await.unwrap();
            let reply = conn.read_reply().await.unwrap();
            assert_eq!(
                reply,
                ParsedReply::Ok(Reply::new(551, vec!["Unable".into()]))
            );
        });
    }

    #[test]
    fn late_tail_discarded() {
        MockRuntime::test_with_various(|_rt| async move {
            let (ours, mut theirs) = stream_pair();
            let mut conn = ControlStream::new(ConnId(1), ours);

            theirs
                .write_all(b"250 Socks4Proxy=127.0.0.1:9050\r\n")
                .await
                .unwrap();
            conn.read_reply().await.unwrap();

            // The rest of that reply turns up only after we've finished
            // reading it, so none of it is buffered yet.
            theirs.write_all(b"250 OK\r\n").await.unwrap();
            conn.write_command("GETCONF", "Socks5Proxy").await.unwrap();
            theirs
                .write_all(b"250 Socks5Proxy=10.0.0.1:1080\r\n")
                .await
                .unwrap();
            let reply = conn.read_reply().await.unwrap();
            assert_eq!(
                reply,
                ParsedReply::Ok(Reply::new(250, vec!["Socks5Proxy=10.0.0.1:1080".into()]))
            );
        });
    }

    #[test]
    fn bad_lines() {
        MockRuntime::test_with_various(|_rt| async move {
            let (ours, mut theirs) = stream_pair();
            let mut conn = ControlStream::new(ConnId(1), ours);
            conn.write_command("GETINFO", "version").await.unwrap();
            theirs.write_all(b"250 caf\xe9\r\n").await.unwrap();
            let err = conn.read_line().await.unwrap_err();
            assert!(
                matches!(&err, ControlError::Parse { command, problem }
                    if command == "GETINFO" && problem.contains("UTF-8"))
            );

            let (ours, mut theirs) = stream_pair();
            let mut conn = ControlStream::new(ConnId(2), ours);
            let long = vec![b'a'; usize::try_from(MAX_LINE_LEN).unwrap()];
            let (written, read) = futures::join!(theirs.write_all(&long), conn.read_line());
            written.unwrap();
            assert!(matches!(read, Err(ControlError::Parse { .. })));
        });
    }

    #[test]
    fn eof() {
        MockRuntime::test_with_various(|_rt| async move {
            let (ours, mut theirs) = stream_pair();
            let mut conn = ControlStream::new(ConnId(1), ours);
            theirs.write_all(b"250-partial\r\n250 trunc").await.unwrap();
            drop(theirs);
            let err = conn.read_reply().await.unwrap_err();
            assert!(matches!(err, ControlError::Closed));
        });
    }
}

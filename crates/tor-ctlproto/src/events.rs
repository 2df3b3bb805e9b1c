//! Reading asynchronous events from the event connection.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::SystemTime;

use educe::Educe;
use futures::channel::mpsc;
use futures::io::{AsyncRead, AsyncWrite};
use futures::{Stream, StreamExt as _};
use tor_basic_utils::skip_fmt;
use tor_error::debug_report;
use tor_rtcompat::SleepProvider;
use tracing::{debug, info, trace, warn};

use crate::bootstrap::{BootstrapStatus, parse_bootstrap_line};
use crate::codec::{ParsedReply, Reply, ReplyAccumulator, STATUS_ASYNC_EVENT};
use crate::log::{LogEntry, Severity, TorLog};
use crate::pool::Connection;
use crate::util::lock;

/// The events we ask Tor to send us.
pub(crate) const SUBSCRIBED_EVENTS: &str = "STATUS_CLIENT NOTICE WARN ERR";

/// Something that a [`ProtocolClient`](crate::ProtocolClient) has learned.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ControlEvent {
    /// Tor has reported its bootstrap status.
    Bootstrap(BootstrapStatus),
    /// Tor has logged a warning or an error since the last time the
    /// warning flag was cleared.
    LogHasWarnOrErr,
}

/// A [`Stream`] of [`ControlEvent`]s.
#[derive(Educe)]
#[educe(Debug)]
pub struct ControlEvents {
    /// The receiver that implements this stream.
    #[educe(Debug(method = "skip_fmt"))]
    inner: mpsc::UnboundedReceiver<ControlEvent>,
}

impl Stream for ControlEvents {
    type Item = ControlEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// State shared between a client and the task reading its events.
#[derive(Debug)]
pub(crate) struct EventShared {
    /// Log messages Tor has sent us.
    log: Mutex<TorLog>,
    /// Everybody who wants to hear about events.
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ControlEvent>>>,
}

impl EventShared {
    /// Create a new `EventShared` that remembers up to `log_capacity` log
    /// messages.
    pub(crate) fn new(log_capacity: usize) -> Self {
        EventShared {
            log: Mutex::new(TorLog::new(log_capacity)),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Return a new stream of events.
    pub(crate) fn subscribe(&self) -> ControlEvents {
        let (tx, rx) = mpsc::unbounded();
        lock(&self.subscribers).push(tx);
        ControlEvents { inner: rx }
    }

    /// Tell every subscriber about `event`.
    pub(crate) fn publish(&self, event: ControlEvent) {
        lock(&self.subscribers).retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    /// Run `f` on the captured log.
    pub(crate) fn with_log<T>(&self, f: impl FnOnce(&mut TorLog) -> T) -> T {
        f(&mut lock(&self.log))
    }

    /// Add a message to the captured log.
    fn record(&self, entry: LogEntry) {
        let newly_warned = self.with_log(|log| log.push(entry));
        if newly_warned {
            self.publish(ControlEvent::LogHasWarnOrErr);
        }
    }

    /// Handle a complete reply that arrived on the event connection.
    pub(crate) fn dispatch(&self, now: SystemTime, reply: Reply) {
        if reply.status() != STATUS_ASYNC_EVENT {
            warn!(
                "Ignoring unexpected {} reply on event connection",
                reply.status()
            );
            return;
        }
        let lines = reply.into_lines();
        let Some(first) = lines.first() else {
            return;
        };
        let (keyword, rest) = first.split_once(' ').unwrap_or((first.as_str(), ""));

        if keyword == "STATUS_CLIENT" {
            match parse_bootstrap_line(rest) {
                Some(status) => {
                    debug!("Bootstrap status: {}", status);
                    self.publish(ControlEvent::Bootstrap(status));
                }
                None => trace!("Ignoring client status: {}", rest),
            }
            return;
        }

        let Ok(severity) = keyword.parse::<Severity>() else {
            debug!("Unrecognized event {:?}: {:?}", keyword, lines);
            return;
        };
        let mut message = rest.to_owned();
        for extra in &lines[1..] {
            message.push('\n');
            message.push_str(extra);
        }
        if severity.is_warning() {
            info!("Tor {}: {}", severity, message);
        } else {
            debug!("Tor {}: {}", severity, message);
        }
        self.record(LogEntry::new(now, severity, message));
    }
}

/// Read events from `conn` until it closes or fails.
///
/// When this returns, `conn` is dropped, which closes the socket and
/// frees the pool's event slot.
pub(crate) async fn run_event_monitor<R, S>(
    runtime: R,
    mut conn: Connection<S>,
    shared: Arc<EventShared>,
) where
    R: SleepProvider,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = conn.id();
    let stream = match conn.stream_mut() {
        Ok(stream) => stream,
        Err(e) => {
            debug_report!(e, "{}: event monitor has no stream", id);
            return;
        }
    };
    let mut acc = ReplyAccumulator::new();
    loop {
        match stream.read_line().await {
            Ok(Some(line)) => {
                if !acc.push_line(&line) {
                    continue;
                }
                match std::mem::take(&mut acc).finish() {
                    ParsedReply::Ok(reply) => shared.dispatch(runtime.wallclock(), reply),
                    ParsedReply::ParseFailure { problem } => {
                        warn!("{}: unparsable event: {}", id, problem);
                    }
                }
            }
            Ok(None) => {
                debug!("{}: event connection closed", id);
                break;
            }
            Err(e) => {
                debug_report!(e, "{}: error reading events", id);
                break;
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
    use futures::{FutureExt as _, StreamExt as _};

    /// Build a single-line 650 reply.
    fn event(line: &str) -> Reply {
        Reply::new(650, vec![line.to_owned()])
    }

    #[test]
    fn dispatch_bootstrap() {
        let shared = EventShared::new(10);
        let mut events = shared.subscribe();
        shared.dispatch(
            SystemTime::UNIX_EPOCH,
            event(r#"STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY="Done""#),
        );
        let Some(ControlEvent::Bootstrap(s)) = events.next().now_or_never().flatten() else {
            panic!()
        };
        assert_eq!(s.progress(), 100);
        assert_eq!(s.tag(), "done");
        assert!(!s.error_occurred());

        // Not a bootstrap report: nothing published.
        shared.dispatch(
            SystemTime::UNIX_EPOCH,
            event("STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED"),
        );
        assert!(events.next().now_or_never().is_none());
    }

    #[test]
    fn dispatch_logs() {
        let shared = EventShared::new(10);
        let mut events = shared.subscribe();

        shared.dispatch(SystemTime::UNIX_EPOCH, event("NOTICE Bootstrapped 5%"));
        assert!(events.next().now_or_never().is_none());

        shared.dispatch(SystemTime::UNIX_EPOCH, event("WARN Problem bootstrapping"));
        shared.dispatch(SystemTime::UNIX_EPOCH, event("ERR Something broke"));
        assert_eq!(
            events.next().now_or_never().flatten(),
            Some(ControlEvent::LogHasWarnOrErr)
        );
        // Only one notification per transition.
        assert!(events.next().now_or_never().is_none());

        // Non-event replies and unknown events are ignored.
        shared.dispatch(SystemTime::UNIX_EPOCH, Reply::new(250, vec![]));
        shared.dispatch(SystemTime::UNIX_EPOCH, event("CIRC 1 BUILT"));

        let entries = shared.with_log(|log| log.entries());
        let msgs: Vec<_> = entries
            .iter()
            .map(|e| (e.severity(), e.message().to_owned()))
            .collect();
        assert_eq!(
            msgs,
            vec![
                (Severity::Notice, "Bootstrapped 5%".to_owned()),
                (Severity::Warn, "Problem bootstrapping".to_owned()),
                (Severity::Err, "Something broke".to_owned()),
            ]
        );
    }
}

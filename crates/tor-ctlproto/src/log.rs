//! A bounded record of the log messages Tor sends us.
//!
//! These are kept only so that a user can export them for diagnostics;
//! nothing in this crate makes decisions based on them.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use time::OffsetDateTime;
use time::macros::format_description;

/// The severity of a log message from Tor.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, serde::Serialize)]
#[non_exhaustive]
pub enum Severity {
    /// `DEBUG`
    Debug,
    /// `INFO`
    Info,
    /// `NOTICE`
    Notice,
    /// `WARN`
    Warn,
    /// `ERR`
    Err,
}

impl Severity {
    /// Return the keyword Tor uses for this severity.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Notice => "NOTICE",
            Severity::Warn => "WARN",
            Severity::Err => "ERR",
        }
    }

    /// Return true if messages of this severity should be brought to the
    /// user's attention.
    pub fn is_warning(&self) -> bool {
        matches!(self, Severity::Warn | Severity::Err)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unrecognized severity keyword.
#[derive(Clone, Debug, thiserror::Error)]
#[error("Unrecognized log severity {0:?}")]
pub struct UnknownSeverity(String);

impl FromStr for Severity {
    type Err = UnknownSeverity;

    fn from_str(s: &str) -> Result<Self, <Severity as FromStr>::Err> {
        Ok(match s {
            "DEBUG" => Severity::Debug,
            "INFO" => Severity::Info,
            "NOTICE" => Severity::Notice,
            "WARN" => Severity::Warn,
            "ERR" => Severity::Err,
            _ => return Err(UnknownSeverity(s.to_owned())),
        })
    }
}

/// One captured log message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogEntry {
    /// When we received it.
    timestamp: SystemTime,
    /// Its severity.
    severity: Severity,
    /// The text of the message.
    message: String,
}

impl LogEntry {
    /// Construct a new `LogEntry`.
    pub fn new(timestamp: SystemTime, severity: Severity, message: impl Into<String>) -> Self {
        LogEntry {
            timestamp,
            severity,
            message: message.into(),
        }
    }

    /// Return the time at which this message was received.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Return the severity of this message.
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Return the text of this message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Times are written in UTC, marked with a trailing `Z`, as in our own logs.
/// The local time zone can't be looked up reliably once other threads are
/// running.
impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let when = OffsetDateTime::from(self.timestamp)
            .format(format_description!(
                "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
            ))
            .map_err(|_| fmt::Error)?;
        write!(f, "{} [{}] {}", when, self.severity, self.message)
    }
}

/// A ring buffer of [`LogEntry`], holding at most a fixed number of entries.
#[derive(Debug, Clone)]
pub(crate) struct TorLog {
    /// The entries, oldest first.
    entries: VecDeque<LogEntry>,
    /// The most entries we'll keep.
    capacity: usize,
    /// True if we've seen a warning since the flag was last cleared.
    has_warnings: bool,
}

impl TorLog {
    /// Create a new empty log that will hold up to `capacity` entries.
    pub(crate) fn new(capacity: usize) -> Self {
        TorLog {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            has_warnings: false,
        }
    }

    /// Add an entry, evicting the oldest if we're full.
    ///
    /// Returns true if this entry moved us into the "has warnings" state.
    pub(crate) fn push(&mut self, entry: LogEntry) -> bool {
        let newly_warned = entry.severity.is_warning() && !self.has_warnings;
        if newly_warned {
            self.has_warnings = true;
        }
        if self.capacity == 0 {
            return newly_warned;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        newly_warned
    }

    /// Return a copy of every entry, oldest first.
    pub(crate) fn entries(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Return true if we've seen a warning since the flag was last cleared.
    pub(crate) fn has_warnings(&self) -> bool {
        self.has_warnings
    }

    /// Clear the "has warnings" flag.
    pub(crate) fn clear_warnings(&mut self) {
        self.has_warnings = false;
    }

    /// Format every entry, one per line, separated by `eol`.
    pub(crate) fn export(&self, eol: &str) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.to_string());
            out.push_str(eol);
        }
        out
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
    use std::time::Duration;

    /// Return a fixed point in time: 2024-03-05 06:07:08.009 UTC.
    fn when() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_millis(1_709_618_828_009)
    }

    #[test]
    fn severity() {
        assert_eq!("WARN".parse::<Severity>().unwrap(), Severity::Warn);
        assert!("warn".parse::<Severity>().is_err());
        assert_eq!(Severity::Err.to_string(), "ERR");
        assert!(Severity::Err.is_warning());
        assert!(!Severity::Notice.is_warning());
    }

    #[test]
    fn format_entry() {
        let e = LogEntry::new(when(), Severity::Notice, "Bootstrapped 5%");
        assert_eq!(
            e.to_string(),
            "2024-03-05T06:07:08.009Z [NOTICE] Bootstrapped 5%"
        );
    }

    #[test]
    fn ring() {
        let mut log = TorLog::new(3);
        for i in 0..5 {
            assert!(!log.push(LogEntry::new(when(), Severity::Notice, format!("m{}", i))));
        }
        let msgs: Vec<_> = log
            .entries()
            .iter()
            .map(|e| e.message().to_owned())
            .collect();
        assert_eq!(msgs, vec!["m2", "m3", "m4"]);

        assert!(!log.has_warnings());
        assert!(log.push(LogEntry::new(when(), Severity::Warn, "uh oh")));
        assert!(!log.push(LogEntry::new(when(), Severity::Err, "worse")));
        assert!(log.has_warnings());
        log.clear_warnings();
        assert!(log.push(LogEntry::new(when(), Severity::Warn, "again")));

        let exported = log.export("\r\n");
        assert_eq!(exported.matches("\r\n").count(), 3);
        assert!(exported.ends_with("[WARN] again\r\n"));
    }
}

//! Parsing Tor's bootstrap status reports.
//!
//! Tor reports bootstrap progress both in reply to
//! `GETINFO status/bootstrap-phase` and as `STATUS_CLIENT` events.
//! Both look like this:
//!
//! ```text
//! NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY="Done"
//! ```

use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::codec::{split_reply_line, unescape};
use crate::log::Severity;

/// A snapshot of Tor's progress towards connecting to the network.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct BootstrapStatus {
    /// How serious this report is.
    severity: Severity,
    /// How far along we are, from 0 to 100.
    progress: u8,
    /// A short keyword naming the current phase.
    tag: String,
    /// A human-readable description of the current phase.
    summary: String,
    /// If present, a description of a problem we've hit.
    warning: Option<String>,
    /// If present, a keyword describing the reason for a problem.
    reason: Option<String>,
    /// If present, how many times we've hit this problem.
    count: Option<u32>,
    /// If present, what Tor thinks we should do about the problem:
    /// `ignore` or `warn`.
    recommendation: Option<String>,
    /// True if this report describes a problem the user should hear about.
    error_occurred: bool,
}

impl BootstrapStatus {
    /// Return the severity of this report.
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Return the progress percentage.
    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Return the tag of the current phase.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Return a human-readable summary of the current phase.
    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Return the warning text, if any.
    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    /// Return the reason keyword, if any.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Return the problem count, if any.
    pub fn count(&self) -> Option<u32> {
        self.count
    }

    /// Return Tor's recommendation, if any.
    pub fn recommendation(&self) -> Option<&str> {
        self.recommendation.as_deref()
    }

    /// Return true if this report is a problem that should be shown to the
    /// user.
    pub fn error_occurred(&self) -> bool {
        self.error_occurred
    }

    /// Return true if bootstrapping has finished.
    pub fn is_done(&self) -> bool {
        self.progress >= 100
    }
}

impl fmt::Display for BootstrapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%: {}", self.progress, self.summary)?;
        if let Some(w) = &self.warning {
            write!(f, " ({})", w)?;
        }
        Ok(())
    }
}

/// Parse a bootstrap status line.
///
/// The line may start with `STATUS_CLIENT` (as in an event) or not (as in
/// a `GETINFO` answer).  Returns `None` if the line has no `BOOTSTRAP`
/// keyword: it's some other kind of status report.
pub fn parse_bootstrap_line(line: &str) -> Option<BootstrapStatus> {
    let mut saw_bootstrap = false;
    let mut status = BootstrapStatus {
        severity: Severity::Notice,
        progress: 0,
        tag: String::new(),
        summary: String::new(),
        warning: None,
        reason: None,
        count: None,
        recommendation: None,
        error_occurred: false,
    };

    for token in split_reply_line(line) {
        let Some((key, raw)) = token.split_once('=') else {
            match token {
                "BOOTSTRAP" => saw_bootstrap = true,
                "NOTICE" => status.severity = Severity::Notice,
                "WARN" => status.severity = Severity::Warn,
                "ERR" => status.severity = Severity::Err,
                _ => {}
            }
            continue;
        };
        let value = match unescape(raw) {
            Ok(v) => v.into_owned(),
            Err(e) => {
                debug!("Skipping badly escaped bootstrap field {:?}: {}", token, e);
                continue;
            }
        };
        match key {
            "PROGRESS" => status.progress = value.parse::<u8>().unwrap_or(0).min(100),
            "COUNT" => status.count = value.parse().ok(),
            "TAG" => status.tag = value,
            "SUMMARY" => status.summary = value,
            "WARNING" => status.warning = Some(value),
            "REASON" => status.reason = Some(value),
            "RECOMMENDATION" => status.recommendation = Some(value),
            _ => {}
        }
    }

    if !saw_bootstrap {
        return None;
    }
    status.error_occurred = status.severity != Severity::Notice
        && status.recommendation.as_deref() == Some("warn");
    Some(status)
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

    #[test]
    fn done() {
        let s = parse_bootstrap_line(
            r#"STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY="Done""#,
        )
        .unwrap();
        assert_eq!(s.progress(), 100);
        assert_eq!(s.tag(), "done");
        assert_eq!(s.summary(), "Done");
        assert_eq!(s.severity(), Severity::Notice);
        assert!(!s.error_occurred());
        assert!(s.is_done());
        assert_eq!(s.to_string(), "100%: Done");
    }

    #[test]
    fn warning() {
        let s = parse_bootstrap_line(
            r#"WARN BOOTSTRAP PROGRESS=10 TAG=conn_done SUMMARY="Connected to a relay" WARNING="Connection refused" REASON=CONNECTREFUSED COUNT=3 RECOMMENDATION=warn"#,
        )
        .unwrap();
        assert_eq!(s.severity(), Severity::Warn);
        assert_eq!(s.progress(), 10);
        assert_eq!(s.summary(), "Connected to a relay");
        assert_eq!(s.warning(), Some("Connection refused"));
        assert_eq!(s.reason(), Some("CONNECTREFUSED"));
        assert_eq!(s.count(), Some(3));
        assert!(s.error_occurred());
        assert!(!s.is_done());

        let s = parse_bootstrap_line(
            "WARN BOOTSTRAP PROGRESS=10 TAG=conn REASON=DONE RECOMMENDATION=ignore",
        )
        .unwrap();
        assert!(!s.error_occurred());
    }

    #[test]
    fn not_bootstrap() {
        assert!(parse_bootstrap_line("NOTICE CIRCUIT_ESTABLISHED").is_none());
        assert!(parse_bootstrap_line("").is_none());
    }

    #[test]
    fn bad_field_skipped() {
        let s = parse_bootstrap_line(r#"NOTICE BOOTSTRAP PROGRESS=50 SUMMARY="bad\"#).unwrap();
        assert_eq!(s.progress(), 50);
        assert_eq!(s.summary(), "");
    }
}

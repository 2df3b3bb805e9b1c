//! Encoding and decoding for the control-port line protocol.
//!
//! Everything in this module is stateless except for [`ReplyAccumulator`],
//! which collects the lines of a single reply as they arrive.
//!
//! A reply looks like this on the wire:
//!
//! ```text
//! 250-version=0.4.8.10
//! 250+config-text=
//! SocksPort 9150
//! .
//! 250 OK
//! ```
//!
//! Every line starts with a three-digit status code and a separator: `-`
//! means more lines follow, `+` means a data block follows (terminated by
//! a line containing a single `.`), and a space marks the last line.

use std::borrow::Cow;

use tracing::warn;

/// Status code for a successful reply.
pub const STATUS_OK: u16 = 250;

/// Status code for an asynchronous event notification.
pub const STATUS_ASYNC_EVENT: u16 = 650;

/// Return true if `b` can appear in an unquoted argument.
///
/// That is: any printable ASCII character other than space and `"`.
fn is_safe_byte(b: u8) -> bool {
    b == 0x21 || (0x23..=0x7e).contains(&b)
}

/// Escape `s` for use as an argument to a control-port command.
///
/// Strings made only of printable ASCII (excluding space and `"`) are
/// returned unchanged.  Everything else is wrapped in double quotes, with
/// `"`, `\`, newline, carriage return and tab backslash-escaped, and every
/// byte of every other non-printable or non-ASCII character written as
/// `\xHH`.
pub fn escape(s: &str) -> Cow<'_, str> {
    if s.bytes().all(is_safe_byte) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            ' '..='~' => out.push(c),
            _ => {
                let mut buf = [0_u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("\\x{:02x}", b));
                }
            }
        }
    }
    out.push('"');
    Cow::Owned(out)
}

/// An error from [`unescape`].
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum UnescapeError {
    /// A `"` appeared inside a quoted string without a backslash.
    #[error("Unescaped quote inside quoted string")]
    EmbeddedQuote,
    /// The string ended in the middle of an escape sequence.
    #[error("Incomplete escape sequence")]
    IncompleteEscape,
    /// A `\x` or octal escape had invalid digits.
    #[error("Invalid escape sequence")]
    BadEscape,
    /// The unescaped bytes were not UTF-8.
    #[error("Unescaped string was not UTF-8")]
    NotUtf8,
}

/// Return the value of an ASCII hex digit.
fn hex_digit(b: u8) -> Option<u8> {
    char::from(b)
        .to_digit(16)
        .and_then(|d| u8::try_from(d).ok())
}

/// Undo the effect of [`escape`] on a value we got from the control port.
///
/// Values that aren't wrapped in double quotes are returned unchanged.
///
/// Inside the quotes we recognize `\n`, `\r`, `\t`, `\xHH`, three-digit
/// octal escapes, and a backslash before any other character (which stands
/// for that character).
pub fn unescape(s: &str) -> Result<Cow<'_, str>, UnescapeError> {
    let Some(inner) = s.strip_prefix('"').and_then(|s| s.strip_suffix('"')) else {
        return Ok(Cow::Borrowed(s));
    };

    let bytes = inner.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => return Err(UnescapeError::EmbeddedQuote),
            b'\\' => {
                let esc = *bytes.get(i + 1).ok_or(UnescapeError::IncompleteEscape)?;
                match esc {
                    b'n' => out.push(b'\n'),
                    b'r' => out.push(b'\r'),
                    b't' => out.push(b'\t'),
                    b'x' => {
                        let digits = bytes
                            .get(i + 2..i + 4)
                            .ok_or(UnescapeError::IncompleteEscape)?;
                        let (Some(hi), Some(lo)) = (hex_digit(digits[0]), hex_digit(digits[1]))
                        else {
                            return Err(UnescapeError::BadEscape);
                        };
                        out.push((hi << 4) | lo);
                        i += 2;
                    }
                    b'0'..=b'9' => {
                        let digits = bytes
                            .get(i + 1..i + 4)
                            .ok_or(UnescapeError::IncompleteEscape)?;
                        let mut val: u16 = 0;
                        for d in digits {
                            if !(b'0'..=b'7').contains(d) {
                                return Err(UnescapeError::BadEscape);
                            }
                            val = val * 8 + u16::from(d - b'0');
                        }
                        out.push(u8::try_from(val).map_err(|_| UnescapeError::BadEscape)?);
                        i += 2;
                    }
                    other => out.push(other),
                }
                i += 2;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(out)
        .map(Cow::Owned)
        .map_err(|_| UnescapeError::NotUtf8)
}

/// Encode a command line, ready to be written to the control port.
pub fn encode_command(name: &str, args: &str) -> String {
    if args.is_empty() {
        format!("{}\r\n", name)
    } else {
        format!("{} {}\r\n", name, args)
    }
}

/// A complete reply from the control port.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reply {
    /// The status code of the final line.
    status: u16,
    /// The text of every line, except for a final `250 OK`.
    lines: Vec<String>,
}

impl Reply {
    /// Construct a new reply.
    pub fn new(status: u16, lines: Vec<String>) -> Self {
        Reply { status, lines }
    }

    /// Return the status code of this reply.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Return the lines of this reply.
    ///
    /// A bare `250 OK` reply has no lines at all.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Consume this reply and return its lines.
    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }

    /// Return true if this reply indicates success.
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Return the lines of this reply joined by newlines.
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }
}

/// The result of assembling a reply.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParsedReply {
    /// A well-formed reply.
    Ok(Reply),
    /// The reply could not be parsed; none of it can be trusted.
    ParseFailure {
        /// What went wrong.
        problem: String,
    },
}

/// Collects the lines of one reply.
///
/// Feed lines (without their line terminators) to
/// [`push_line`](ReplyAccumulator::push_line) until it returns true, then
/// call [`finish`](ReplyAccumulator::finish).
#[derive(Debug, Default, Clone)]
pub struct ReplyAccumulator {
    /// Status code of the most recent line.
    status: u16,
    /// Lines collected so far.
    lines: Vec<String>,
    /// If set, we are inside a `+` data block.
    in_data_block: bool,
    /// Lines of the current data block.
    data: Vec<String>,
    /// If set, parsing failed.
    failure: Option<String>,
    /// If set, the reply is complete.
    complete: bool,
}

impl ReplyAccumulator {
    /// Create a new empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return true if a reply has been completed.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Add one line to this reply.
    ///
    /// Returns true if the reply is now complete.  A malformed line makes
    /// the reply complete (and failed), so that a caller never waits forever
    /// on input it can't understand.
    pub fn push_line(&mut self, line: &str) -> bool {
        if self.complete {
            return true;
        }

        if self.in_data_block {
            if line == "." {
                self.in_data_block = false;
                let data = std::mem::take(&mut self.data).join("\n");
                if let Some(last) = self.lines.last_mut() {
                    last.push_str(&data);
                }
            } else {
                let line = line.strip_prefix('.').unwrap_or(line);
                self.data.push(line.to_owned());
            }
            return false;
        }

        if line.is_empty() {
            return false;
        }

        let (Some(code), Some(sep), Some(text)) = (line.get(..3), line.get(3..4), line.get(4..))
        else {
            return self.fail(format!("Line too short: {:?}", line));
        };
        let Some(status) = code
            .bytes()
            .all(|b| b.is_ascii_digit())
            .then(|| code.parse::<u16>().ok())
            .flatten()
        else {
            return self.fail(format!("Bad status code: {:?}", line));
        };
        self.status = status;

        match sep {
            "-" => self.lines.push(text.to_owned()),
            "+" => {
                self.lines.push(text.to_owned());
                self.in_data_block = true;
            }
            " " => {
                if !(status == STATUS_OK && text == "OK") {
                    self.lines.push(text.to_owned());
                }
                self.complete = true;
            }
            _ => return self.fail(format!("Unrecognized separator: {:?}", line)),
        }
        self.complete
    }

    /// Mark this reply as failed and complete.
    fn fail(&mut self, problem: String) -> bool {
        self.failure = Some(problem);
        self.complete = true;
        true
    }

    /// Consume this accumulator and return the reply it collected.
    pub fn finish(self) -> ParsedReply {
        match (self.failure, self.complete) {
            (Some(problem), _) => ParsedReply::ParseFailure { problem },
            (None, false) => ParsedReply::ParseFailure {
                problem: "Reply was incomplete".into(),
            },
            (None, true) => ParsedReply::Ok(Reply::new(self.status, self.lines)),
        }
    }
}

/// Extract the values for `key` from a `GETCONF`/`GETINFO`-style reply.
///
/// Lines of the form `key=value` (with `key` matched case-insensitively)
/// contribute their unescaped value.  A line that is just `key` means the
/// option has no value, and contributes nothing.  Any other line is logged
/// and ignored.
///
/// If any value is badly escaped, the whole reply is rejected.
pub fn parse_keyed_reply(
    cmd: &str,
    key: &str,
    reply: &Reply,
) -> Result<Vec<String>, UnescapeError> {
    let mut values = Vec::new();
    for line in reply.lines() {
        let prefix_matches = line
            .get(..key.len())
            .is_some_and(|p| p.eq_ignore_ascii_case(key));
        let rest = if prefix_matches {
            &line[key.len()..]
        } else {
            ""
        };

        if prefix_matches && rest.is_empty() {
            continue;
        }
        match rest.strip_prefix('=') {
            Some(value) if prefix_matches => values.push(unescape(value)?.into_owned()),
            _ => warn!("Unexpected line in reply to {} {}: {:?}", cmd, key, line),
        }
    }
    Ok(values)
}

/// Split `s` at spaces, keeping quoted substrings (and their quotes) intact.
///
/// A backslash inside a quoted substring protects the following character.
/// Empty tokens are dropped.
pub fn split_reply_line(s: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;
    for (idx, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ' ' if !in_quotes => {
                if idx > start {
                    tokens.push(&s[start..idx]);
                }
                start = idx + 1;
            }
            _ => {}
        }
    }
    if s.len() > start {
        tokens.push(&s[start..]);
    }
    tokens
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
    use tracing_test::traced_test;

    /// Feed every line of `text` to a fresh accumulator and return the result.
    fn parse(text: &str) -> ParsedReply {
        let mut acc = ReplyAccumulator::new();
        for line in text.split("\r\n") {
            if acc.push_line(line) {
                break;
            }
        }
        acc.finish()
    }

    #[test]
    fn escape_simple() {
        assert!(matches!(escape("127.0.0.1:9050"), Cow::Borrowed(_)));
        assert_eq!(escape(""), "");
        assert_eq!(escape("hello world"), "\"hello world\"");
        assert_eq!(escape("say \"hi\""), r#""say \"hi\"""#);
        assert_eq!(escape("a\\b"), r#""a\\b""#);
        assert_eq!(escape("x\r\n\t"), r#""x\r\n\t""#);
        assert_eq!(escape("\u{1}"), r#""\x01""#);
        assert_eq!(escape("é"), r#""\xc3\xa9""#);
    }

    #[test]
    fn unescape_simple() {
        assert_eq!(unescape("plain").unwrap(), "plain");
        assert_eq!(unescape("\"").unwrap(), "\"");
        assert_eq!(unescape("\"\"").unwrap(), "");
        assert_eq!(unescape(r#""Done""#).unwrap(), "Done");
        assert_eq!(unescape(r#""a\nb\tc\\d\"e""#).unwrap(), "a\nb\tc\\d\"e");
        assert_eq!(unescape(r#""\x41\102""#).unwrap(), "AB");
        assert_eq!(unescape(r#""\xc3\xa9""#).unwrap(), "é");
        assert_eq!(unescape(r#""\q""#).unwrap(), "q");
    }

    #[test]
    fn unescape_errors() {
        use UnescapeError as E;
        assert_eq!(unescape(r#""a"b""#).unwrap_err(), E::EmbeddedQuote);
        assert_eq!(unescape(r#""abc\""#).unwrap_err(), E::IncompleteEscape);
        assert_eq!(unescape(r#""\x4""#).unwrap_err(), E::IncompleteEscape);
        assert_eq!(unescape(r#""\xzz""#).unwrap_err(), E::BadEscape);
        assert_eq!(unescape(r#""\12""#).unwrap_err(), E::IncompleteEscape);
        assert_eq!(unescape(r#""\18x""#).unwrap_err(), E::BadEscape);
        assert_eq!(unescape(r#""\777""#).unwrap_err(), E::BadEscape);
        assert_eq!(unescape(r#""\xff""#).unwrap_err(), E::NotUtf8);
    }

    #[test]
    fn escape_roundtrip() {
        for s in [
            "",
            "simple",
            "with space",
            "\"quoted\"",
            "back\\slash",
            "ctl\u{0}\u{7}\u{1b}\u{7f}",
            "line\r\nbreak\ttab",
            "ünïcødé ☃ 🦀",
            "\\\"\\\"",
        ] {
            assert_eq!(unescape(&escape(s)).unwrap(), s, "{:?}", s);
        }
    }

    #[test]
    fn commands() {
        assert_eq!(encode_command("SAVECONF", ""), "SAVECONF\r\n");
        assert_eq!(
            encode_command("GETCONF", "Socks4Proxy"),
            "GETCONF Socks4Proxy\r\n"
        );
    }

    #[test]
    fn reply_ok() {
        let r = parse("250 OK\r\n");
        assert_eq!(r, ParsedReply::Ok(Reply::new(250, vec![])));
    }

    #[test]
    fn reply_lines() {
        let ParsedReply::Ok(r) = parse("250-a=1\r\n250-b=2\r\n250 OK\r\n") else {
            panic!()
        };
        assert!(r.is_ok());
        assert_eq!(r.lines(), &["a=1", "b=2"]);

        let ParsedReply::Ok(r) = parse("250 Socks4Proxy=127.0.0.1:9050\r\n") else {
            panic!()
        };
        assert_eq!(r.lines(), &["Socks4Proxy=127.0.0.1:9050"]);

        let ParsedReply::Ok(r) = parse("552 Unrecognized option\r\n") else {
            panic!()
        };
        assert_eq!(r.status(), 552);
        assert!(!r.is_ok());
        assert_eq!(r.message(), "Unrecognized option");

        // A non-final "OK" line is an ordinary entry.
        let ParsedReply::Ok(r) = parse("250-OK\r\n250 OK\r\n") else {
            panic!()
        };
        assert_eq!(r.lines(), &["OK"]);
    }

    #[test]
    fn reply_line_law() {
        // Only lines up to the first space-separated line belong to the reply.
        let mut acc = ReplyAccumulator::new();
        assert!(!acc.push_line("250-first"));
        assert!(!acc.push_line(""));
        assert!(!acc.push_line("250-second"));
        assert!(acc.push_line("250 third"));
        assert!(acc.push_line("250-ignored"));
        let ParsedReply::Ok(r) = acc.finish() else {
            panic!()
        };
        assert_eq!(r.lines(), &["first", "second", "third"]);
    }

    #[test]
    fn reply_data_block() {
        let ParsedReply::Ok(r) = parse(
            "250+config-text=\r\nSocksPort 9150\r\n..dotted\r\n.\r\n250-next=1\r\n250 OK\r\n",
        ) else {
            panic!()
        };
        assert_eq!(r.lines(), &["config-text=SocksPort 9150\n.dotted", "next=1"]);
    }

    #[test]
    fn reply_malformed() {
        for bad in ["25", "abc OK", "25x OK", "250*OK"] {
            let mut acc = ReplyAccumulator::new();
            assert!(acc.push_line(bad), "{:?}", bad);
            assert!(matches!(acc.finish(), ParsedReply::ParseFailure { .. }));
        }

        let mut acc = ReplyAccumulator::new();
        assert!(!acc.push_line("250-partial"));
        assert!(matches!(acc.finish(), ParsedReply::ParseFailure { .. }));
    }

    #[test]
    #[traced_test]
    fn keyed_reply() {
        let r = Reply::new(
            250,
            vec![
                "socks4proxy=127.0.0.1:9050".into(),
                "Socks4Proxy".into(),
                "Socks4ProxyX=1".into(),
                "Bridge=\"a b\"".into(),
            ],
        );
        let vals = parse_keyed_reply("GETCONF", "Socks4Proxy", &r).unwrap();
        assert_eq!(vals, vec!["127.0.0.1:9050".to_string()]);
        assert!(logs_contain("Unexpected line in reply to GETCONF Socks4Proxy"));

        let r = Reply::new(250, vec!["Bridge=\"a b\"".into(), "Bridge=c".into()]);
        let vals = parse_keyed_reply("GETCONF", "Bridge", &r).unwrap();
        assert_eq!(vals, vec!["a b".to_string(), "c".to_string()]);

        let r = Reply::new(250, vec!["Bridge=\"bad\"quote\"".into()]);
        assert!(parse_keyed_reply("GETCONF", "Bridge", &r).is_err());
    }

    #[test]
    fn split() {
        assert_eq!(
            split_reply_line(r#"NOTICE BOOTSTRAP PROGRESS=10 SUMMARY="Finishing handshake" TAG=x"#),
            vec![
                "NOTICE",
                "BOOTSTRAP",
                "PROGRESS=10",
                r#"SUMMARY="Finishing handshake""#,
                "TAG=x"
            ]
        );
        assert_eq!(
            split_reply_line(r#"  A="q \" x"  B "#),
            vec![r#"A="q \" x""#, "B"]
        );
        assert!(split_reply_line("").is_empty());
    }
}

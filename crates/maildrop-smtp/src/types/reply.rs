//! SMTP reply types and wire formatting.

use std::borrow::Cow;
use std::fmt;

/// SMTP reply sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply code (e.g., 250).
    pub code: ReplyCode,
    /// Enhanced status code placement for the last line.
    pub status: EnhancedStatus,
    /// Reply text lines.
    pub lines: Vec<String>,
}

impl Reply {
    /// Creates a single-line reply.
    #[must_use]
    pub fn new(code: ReplyCode, status: impl Into<EnhancedStatus>, text: impl Into<String>) -> Self {
        Self {
            code,
            status: status.into(),
            lines: vec![text.into()],
        }
    }

    /// Creates a multi-line reply.
    #[must_use]
    pub fn multiline(code: ReplyCode, status: impl Into<EnhancedStatus>, lines: Vec<String>) -> Self {
        Self {
            code,
            status: status.into(),
            lines,
        }
    }

    /// Returns the enhanced code that will be written, if any.
    #[must_use]
    pub const fn enhanced_code(&self) -> Option<EnhancedCode> {
        self.status.resolve(self.code)
    }

    /// Serializes the reply to wire format.
    ///
    /// Every line but the last is written as `CODE-text`, the last as
    /// `CODE text`. The enhanced code, when present, prefixes the text of the
    /// last line only. An empty line list still produces one `CODE ` line.
    /// CR and LF inside a line are written as spaces.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let (last, rest) = match self.lines.split_last() {
            Some((last, rest)) => (single_line(last), rest),
            None => (Cow::Borrowed(""), &[][..]),
        };

        for line in rest {
            let line = single_line(line);
            buf.extend_from_slice(format!("{}-{line}\r\n", self.code).as_bytes());
        }

        match self.enhanced_code() {
            Some(enhanced) => {
                buf.extend_from_slice(format!("{} {enhanced} {last}\r\n", self.code).as_bytes());
            }
            None => buf.extend_from_slice(format!("{} {last}\r\n", self.code).as_bytes()),
        }

        buf
    }
}

fn single_line(text: &str) -> Cow<'_, str> {
    if text.contains(['\r', '\n']) {
        Cow::Owned(text.replace(['\r', '\n'], " "))
    } else {
        Cow::Borrowed(text)
    }
}

/// RFC 3463 enhanced status code (`class.subject.detail`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnhancedCode {
    /// Class digit (2, 4 or 5).
    pub class: u8,
    /// Subject.
    pub subject: u16,
    /// Detail.
    pub detail: u16,
}

impl EnhancedCode {
    /// Creates a new enhanced code.
    #[must_use]
    pub const fn new(class: u8, subject: u16, detail: u16) -> Self {
        Self {
            class,
            subject,
            detail,
        }
    }
}

impl fmt::Display for EnhancedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// How the enhanced code of a reply is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnhancedStatus {
    /// Derive `class.0.0` from the reply class (2xx, 4xx, 5xx only).
    #[default]
    Derived,
    /// Write no enhanced code at all.
    Absent,
    /// Write this exact code.
    Code(EnhancedCode),
}

impl EnhancedStatus {
    /// Resolves the status against a reply code.
    #[must_use]
    pub const fn resolve(self, code: ReplyCode) -> Option<EnhancedCode> {
        match self {
            Self::Absent => None,
            Self::Code(enhanced) => Some(enhanced),
            Self::Derived => match code.class() {
                2 => Some(EnhancedCode::new(2, 0, 0)),
                4 => Some(EnhancedCode::new(4, 0, 0)),
                5 => Some(EnhancedCode::new(5, 0, 0)),
                _ => None,
            },
        }
    }
}

impl From<EnhancedCode> for EnhancedStatus {
    fn from(code: EnhancedCode) -> Self {
        Self::Code(code)
    }
}

/// SMTP reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplyCode(u16);

impl ReplyCode {
    /// Creates a new reply code.
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Returns the numeric code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns the first digit of the code.
    #[must_use]
    pub const fn class(self) -> u16 {
        self.0 / 100
    }

    /// Returns true if this is a success code (2xx).
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 >= 200 && self.0 < 300
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient(self) -> bool {
        self.0 >= 400 && self.0 < 500
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        self.0 >= 500 && self.0 < 600
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Reply codes used by the engine
impl ReplyCode {
    /// 220 Service ready
    pub const SERVICE_READY: Self = Self(220);
    /// 221 Service closing transmission channel
    pub const CLOSING: Self = Self(221);
    /// 235 Authentication succeeded
    pub const AUTH_SUCCEEDED: Self = Self(235);
    /// 250 Requested mail action okay, completed
    pub const OK: Self = Self(250);
    /// 252 Cannot verify user, but will accept message
    pub const CANNOT_VERIFY: Self = Self(252);
    /// 334 Continue with authentication
    pub const AUTH_CONTINUE: Self = Self(334);
    /// 354 Start mail input
    pub const START_DATA: Self = Self(354);
    /// 421 Service not available, closing transmission channel
    pub const SERVICE_UNAVAILABLE: Self = Self(421);
    /// 451 Local error in processing
    pub const LOCAL_ERROR: Self = Self(451);
    /// 454 Temporary authentication failure
    pub const AUTH_TEMPORARY_FAILURE: Self = Self(454);
    /// 500 Syntax error, command unrecognized
    pub const SYNTAX_ERROR: Self = Self(500);
    /// 501 Syntax error in parameters or arguments
    pub const PARAMETER_ERROR: Self = Self(501);
    /// 502 Command not implemented
    pub const NOT_IMPLEMENTED: Self = Self(502);
    /// 503 Bad sequence of commands
    pub const BAD_SEQUENCE: Self = Self(503);
    /// 504 Command parameter not implemented
    pub const PARAMETER_NOT_IMPLEMENTED: Self = Self(504);
    /// 535 Authentication credentials invalid
    pub const AUTH_FAILED: Self = Self(535);
    /// 538 Encryption required for requested authentication mechanism
    pub const ENCRYPTION_REQUIRED: Self = Self(538);
    /// 550 Mailbox unavailable (not found, access denied)
    pub const MAILBOX_UNAVAILABLE: Self = Self(550);
    /// 552 Exceeded storage allocation
    pub const EXCEEDED_STORAGE: Self = Self(552);
    /// 554 Transaction failed
    pub const TRANSACTION_FAILED: Self = Self(554);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;

    mod reply_code_tests {
        use super::*;

        #[test]
        fn classes() {
            assert_eq!(ReplyCode::OK.class(), 2);
            assert_eq!(ReplyCode::START_DATA.class(), 3);
            assert_eq!(ReplyCode::SERVICE_UNAVAILABLE.class(), 4);
            assert_eq!(ReplyCode::AUTH_FAILED.class(), 5);
        }

        #[test]
        fn transient_and_permanent() {
            assert!(ReplyCode::LOCAL_ERROR.is_transient());
            assert!(ReplyCode::AUTH_TEMPORARY_FAILURE.is_transient());
            assert!(ReplyCode::TRANSACTION_FAILED.is_permanent());
            assert!(!ReplyCode::OK.is_permanent());
            assert!(ReplyCode::AUTH_SUCCEEDED.is_success());
        }

        #[test]
        fn display() {
            assert_eq!(format!("{}", ReplyCode::OK), "250");
            assert_eq!(format!("{}", ReplyCode::ENCRYPTION_REQUIRED), "538");
        }
    }

    mod enhanced_tests {
        use super::*;

        #[test]
        fn display() {
            assert_eq!(EnhancedCode::new(5, 7, 11).to_string(), "5.7.11");
        }

        #[test]
        fn derived_by_class() {
            let derived = EnhancedStatus::Derived;
            assert_eq!(
                derived.resolve(ReplyCode::OK),
                Some(EnhancedCode::new(2, 0, 0))
            );
            assert_eq!(
                derived.resolve(ReplyCode::SERVICE_UNAVAILABLE),
                Some(EnhancedCode::new(4, 0, 0))
            );
            assert_eq!(
                derived.resolve(ReplyCode::SYNTAX_ERROR),
                Some(EnhancedCode::new(5, 0, 0))
            );
            assert_eq!(derived.resolve(ReplyCode::AUTH_CONTINUE), None);
        }

        #[test]
        fn absent_and_explicit() {
            assert_eq!(EnhancedStatus::Absent.resolve(ReplyCode::OK), None);
            let code = EnhancedCode::new(5, 5, 4);
            assert_eq!(EnhancedStatus::from(code).resolve(ReplyCode::OK), Some(code));
        }
    }

    mod serialize_tests {
        use super::*;

        #[test]
        fn derived_success() {
            let reply = Reply::new(ReplyCode::OK, EnhancedStatus::Derived, "OK");
            assert_eq!(reply.serialize(), b"250 2.0.0 OK\r\n");
        }

        #[test]
        fn derived_transient() {
            let reply = Reply::new(
                ReplyCode::SERVICE_UNAVAILABLE,
                EnhancedStatus::Derived,
                "Service not available",
            );
            assert_eq!(reply.serialize(), b"421 4.0.0 Service not available\r\n");
        }

        #[test]
        fn absent_has_no_segment() {
            let reply = Reply::new(ReplyCode::NOT_IMPLEMENTED, EnhancedStatus::Absent, "Nope");
            assert_eq!(reply.serialize(), b"502 Nope\r\n");
        }

        #[test]
        fn explicit_code() {
            let reply = Reply::new(
                ReplyCode::PARAMETER_ERROR,
                EnhancedCode::new(5, 5, 4),
                "Missing parameter",
            );
            assert_eq!(reply.serialize(), b"501 5.5.4 Missing parameter\r\n");
        }

        #[test]
        fn line_breaks_in_text_are_flattened() {
            let reply = Reply::new(
                ReplyCode::LOCAL_ERROR,
                EnhancedCode::new(4, 0, 0),
                "bad\r\n250 fake",
            );
            assert_eq!(reply.serialize(), b"451 4.0.0 bad  250 fake\r\n");

            let reply = Reply::multiline(
                ReplyCode::OK,
                EnhancedStatus::Absent,
                vec!["one\ntwo".to_string(), "three".to_string()],
            );
            assert_eq!(reply.serialize(), b"250-one two\r\n250 three\r\n");
        }

        #[test]
        fn multiline_prefixes_last_line_only() {
            let reply = Reply::multiline(
                ReplyCode::OK,
                EnhancedCode::new(2, 0, 0),
                vec!["first".to_string(), "second".to_string(), "third".to_string()],
            );
            assert_eq!(
                reply.serialize(),
                b"250-first\r\n250-second\r\n250 2.0.0 third\r\n"
            );
        }

        #[test]
        fn ehlo_style_without_status() {
            let reply = Reply::multiline(
                ReplyCode::OK,
                EnhancedStatus::Absent,
                vec!["Hello client".to_string(), "PIPELINING".to_string()],
            );
            assert_eq!(reply.serialize(), b"250-Hello client\r\n250 PIPELINING\r\n");
        }

        #[test]
        fn empty_challenge() {
            let reply = Reply::new(ReplyCode::AUTH_CONTINUE, EnhancedStatus::Absent, "");
            assert_eq!(reply.serialize(), b"334 \r\n");
        }

        #[test]
        fn no_lines() {
            let reply = Reply::multiline(ReplyCode::OK, EnhancedStatus::Absent, Vec::new());
            assert_eq!(reply.serialize(), b"250 \r\n");
        }

        #[test]
        fn code_without_derived_class() {
            let reply = Reply::new(ReplyCode::START_DATA, EnhancedStatus::Derived, "Go ahead");
            assert_eq!(reply.serialize(), b"354 Go ahead\r\n");
        }
    }
}

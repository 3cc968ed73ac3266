//! SMTP command argument parsers.
//!
//! Everything in this module is pure: the engine hands in the argument text
//! that follows a command verb and gets back typed values or an
//! [`ArgumentError`] that it maps to the appropriate reply.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::Error;

/// ESMTP parameters keyed by upper-cased name. Bare keywords map to `""`.
pub type EsmtpParams = BTreeMap<String, String>;

/// Why an argument could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArgumentError {
    /// A required argument was empty.
    #[error("missing argument")]
    Missing,
    /// The `FROM:`/`TO:` path was malformed.
    #[error("malformed path")]
    Path,
    /// An ESMTP parameter was malformed.
    #[error("malformed ESMTP parameter {0:?}")]
    Param(String),
    /// Invalid xtext encoding.
    #[error("malformed xtext")]
    Xtext,
    /// Invalid base64 encoding.
    #[error("malformed base64")]
    Base64,
}

impl From<ArgumentError> for Error {
    fn from(err: ArgumentError) -> Self {
        Self::Syntax(err.to_string())
    }
}

/// Parsed `MAIL FROM:` or `RCPT TO:` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathArgument {
    /// Address with angle brackets removed. Empty for the null reverse path.
    pub address: String,
    /// Trailing ESMTP parameters.
    pub params: EsmtpParams,
}

/// Parsed `AUTH` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthArgument<'a> {
    /// Mechanism name as sent (compare case-insensitively).
    pub mechanism: &'a str,
    /// Still-encoded initial response, if one was sent.
    pub initial_response: Option<&'a str>,
}

/// Parses a HELO/EHLO/LHLO argument, returning the declared domain.
///
/// # Errors
///
/// Returns [`ArgumentError::Missing`] if no domain was given.
pub fn parse_helo_argument(arg: &str) -> Result<&str, ArgumentError> {
    match arg.split(' ').find(|token| !token.is_empty()) {
        Some(domain) => Ok(domain),
        None => Err(ArgumentError::Missing),
    }
}

/// Parses the argument of `MAIL`, which must look like `FROM:<address> [params]`.
///
/// In strict mode the path must be enclosed in angle brackets. `<>` is the
/// null reverse path in either mode.
///
/// # Errors
///
/// Returns [`ArgumentError::Path`] for a malformed path and
/// [`ArgumentError::Param`] for malformed parameters.
pub fn parse_mail_argument(arg: &str, strict: bool) -> Result<PathArgument, ArgumentError> {
    let rest = strip_prefix_ignore_case(arg, "FROM:")
        .filter(|_| arg.len() >= 6)
        .ok_or(ArgumentError::Path)?;

    let mut tokens = rest.trim_matches(' ').split(' ');
    let path = tokens.next().unwrap_or_default();
    let bracketed = path.len() >= 2 && path.starts_with('<') && path.ends_with('>');
    if strict && !bracketed {
        return Err(ArgumentError::Path);
    }

    let address = trim_path(path);
    if address.is_empty() && !bracketed {
        return Err(ArgumentError::Path);
    }

    Ok(PathArgument {
        address: address.to_string(),
        params: parse_esmtp_params(tokens)?,
    })
}

/// Parses the argument of `RCPT`, which must look like `TO:<address> [params]`.
///
/// # Errors
///
/// Returns [`ArgumentError::Path`] for a malformed or empty path and
/// [`ArgumentError::Param`] for malformed parameters.
pub fn parse_rcpt_argument(arg: &str) -> Result<PathArgument, ArgumentError> {
    let rest = strip_prefix_ignore_case(arg, "TO:")
        .filter(|_| arg.len() >= 4)
        .ok_or(ArgumentError::Path)?;

    let mut tokens = rest.trim_matches(' ').split(' ');
    let address = trim_path(tokens.next().unwrap_or_default());
    if address.is_empty() {
        return Err(ArgumentError::Path);
    }

    Ok(PathArgument {
        address: address.to_string(),
        params: parse_esmtp_params(tokens)?,
    })
}

/// Parses `KEY=VALUE` or bare `KEY` tokens into a parameter map.
///
/// Keys are upper-cased; values are kept as sent. Empty tokens are skipped.
///
/// # Errors
///
/// Returns [`ArgumentError::Param`] for a token with more than one `=` or an
/// empty key.
pub fn parse_esmtp_params<'a>(
    tokens: impl IntoIterator<Item = &'a str>,
) -> Result<EsmtpParams, ArgumentError> {
    let mut params = EsmtpParams::new();
    for token in tokens.into_iter().filter(|token| !token.is_empty()) {
        let mut parts = token.split('=');
        let key = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_default();
        if key.is_empty() || parts.next().is_some() {
            return Err(ArgumentError::Param(token.to_string()));
        }
        params.insert(key.to_ascii_uppercase(), value.to_string());
    }
    Ok(params)
}

/// Splits an `AUTH` argument into mechanism and optional initial response.
///
/// Returns `None` when no mechanism was given.
#[must_use]
pub fn parse_auth_argument(arg: &str) -> Option<AuthArgument<'_>> {
    let mut tokens = arg.split(' ').filter(|token| !token.is_empty());
    let mechanism = tokens.next()?;
    Some(AuthArgument {
        mechanism,
        initial_response: tokens.next(),
    })
}

/// Decodes a base64 SASL response. A lone `=` is the empty response.
///
/// # Errors
///
/// Returns [`ArgumentError::Base64`] if the text is not valid base64.
pub fn decode_sasl_response(encoded: &str) -> Result<Vec<u8>, ArgumentError> {
    let encoded = encoded.trim();
    if encoded == "=" {
        return Ok(Vec::new());
    }
    STANDARD.decode(encoded).map_err(|_| ArgumentError::Base64)
}

/// Decodes RFC 3461 xtext (`+XX` hex escapes).
///
/// # Errors
///
/// Returns [`ArgumentError::Xtext`] on a truncated or non-hex escape, on
/// characters outside the printable ASCII range, or on a raw `=`.
pub fn decode_xtext(text: &str) -> Result<String, ArgumentError> {
    let bytes = text.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                let hex = bytes.get(i + 1..i + 3).ok_or(ArgumentError::Xtext)?;
                let hex = std::str::from_utf8(hex).map_err(|_| ArgumentError::Xtext)?;
                if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Err(ArgumentError::Xtext);
                }
                let byte = u8::from_str_radix(hex, 16).map_err(|_| ArgumentError::Xtext)?;
                decoded.push(byte);
                i += 3;
            }
            b'=' => return Err(ArgumentError::Xtext),
            byte @ b'!'..=b'~' => {
                decoded.push(byte);
                i += 1;
            }
            _ => return Err(ArgumentError::Xtext),
        }
    }
    String::from_utf8(decoded).map_err(|_| ArgumentError::Xtext)
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        s.get(prefix.len()..)
    } else {
        None
    }
}

fn trim_path(path: &str) -> &str {
    path.trim_matches(|c| c == '<' || c == '>' || c == ' ')
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_helo_argument() {
        assert_eq!(parse_helo_argument("mx.example.com").unwrap(), "mx.example.com");
        assert_eq!(parse_helo_argument("  mx.example.com extra").unwrap(), "mx.example.com");
        assert_eq!(parse_helo_argument(""), Err(ArgumentError::Missing));
    }

    #[test]
    fn test_mail_argument() {
        let arg = parse_mail_argument("FROM:<root@nsa.gov>", true).unwrap();
        assert_eq!(arg.address, "root@nsa.gov");
        assert!(arg.params.is_empty());
    }

    #[test]
    fn test_mail_argument_case_insensitive_prefix() {
        let arg = parse_mail_argument("from:<a@b.example>", true).unwrap();
        assert_eq!(arg.address, "a@b.example");
    }

    #[test]
    fn test_mail_argument_with_params() {
        let arg = parse_mail_argument("FROM:<a@b.example> size=1000 BODY=8BITMIME", true).unwrap();
        assert_eq!(arg.params.get("SIZE").unwrap(), "1000");
        assert_eq!(arg.params.get("BODY").unwrap(), "8BITMIME");
    }

    #[test]
    fn test_mail_argument_space_after_colon() {
        let arg = parse_mail_argument("FROM: <a@b.example>", true).unwrap();
        assert_eq!(arg.address, "a@b.example");
    }

    #[test]
    fn test_mail_argument_null_path() {
        assert_eq!(parse_mail_argument("FROM:<>", true).unwrap().address, "");
        assert_eq!(parse_mail_argument("FROM:<>", false).unwrap().address, "");
    }

    #[test]
    fn test_mail_argument_strict_requires_brackets() {
        assert_eq!(
            parse_mail_argument("FROM:a@b.example", true),
            Err(ArgumentError::Path)
        );
        let arg = parse_mail_argument("FROM:a@b.example", false).unwrap();
        assert_eq!(arg.address, "a@b.example");
    }

    #[test]
    fn test_mail_argument_rejects_bad_prefix() {
        assert_eq!(parse_mail_argument("TO:<a@b>", false), Err(ArgumentError::Path));
        assert_eq!(parse_mail_argument("FROM:", false), Err(ArgumentError::Path));
        assert_eq!(parse_mail_argument("", false), Err(ArgumentError::Path));
    }

    #[test]
    fn test_mail_argument_bad_param() {
        assert!(matches!(
            parse_mail_argument("FROM:<a@b> A=B=C", true),
            Err(ArgumentError::Param(_))
        ));
        assert!(matches!(
            parse_mail_argument("FROM:<a@b> =x", true),
            Err(ArgumentError::Param(_))
        ));
    }

    #[test]
    fn test_rcpt_argument() {
        let arg = parse_rcpt_argument("TO:<v@b.example>").unwrap();
        assert_eq!(arg.address, "v@b.example");
        let arg = parse_rcpt_argument("to: v@b.example NOTIFY=NEVER").unwrap();
        assert_eq!(arg.address, "v@b.example");
        assert_eq!(arg.params.get("NOTIFY").unwrap(), "NEVER");
    }

    #[test]
    fn test_rcpt_argument_rejects_empty() {
        assert_eq!(parse_rcpt_argument("TO:<>"), Err(ArgumentError::Path));
        assert_eq!(parse_rcpt_argument("TO:"), Err(ArgumentError::Path));
        assert_eq!(parse_rcpt_argument("FROM:<a@b>"), Err(ArgumentError::Path));
    }

    #[test]
    fn test_esmtp_params() {
        let params = parse_esmtp_params(["smtputf8", "", "Auth=<>"]).unwrap();
        assert_eq!(params.get("SMTPUTF8").unwrap(), "");
        assert_eq!(params.get("AUTH").unwrap(), "<>");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_auth_argument() {
        let arg = parse_auth_argument("PLAIN dGVzdA==").unwrap();
        assert_eq!(arg.mechanism, "PLAIN");
        assert_eq!(arg.initial_response, Some("dGVzdA=="));

        let arg = parse_auth_argument("login").unwrap();
        assert_eq!(arg.mechanism, "login");
        assert_eq!(arg.initial_response, None);

        assert!(parse_auth_argument("").is_none());
        assert!(parse_auth_argument("   ").is_none());
    }

    #[test]
    fn test_decode_sasl_response() {
        assert_eq!(decode_sasl_response("=").unwrap(), Vec::<u8>::new());
        assert_eq!(decode_sasl_response("dGVzdA==").unwrap(), b"test");
        assert_eq!(decode_sasl_response("!!!"), Err(ArgumentError::Base64));
    }

    #[test]
    fn test_decode_xtext() {
        assert_eq!(decode_xtext("<a+2Bb@c.example>").unwrap(), "<a+b@c.example>");
        assert_eq!(decode_xtext("plain").unwrap(), "plain");
        assert_eq!(decode_xtext("bad+2"), Err(ArgumentError::Xtext));
        assert_eq!(decode_xtext("bad+ZZ"), Err(ArgumentError::Xtext));
        assert_eq!(decode_xtext("a=b"), Err(ArgumentError::Xtext));
        assert_eq!(decode_xtext("a b"), Err(ArgumentError::Xtext));
    }

    proptest! {
        #[test]
        fn prop_param_keys_are_upper_case(key in "[a-zA-Z][a-zA-Z0-9-]{0,15}", value in "[!-<>-~]{0,16}") {
            let token = format!("{key}={value}");
            let params = parse_esmtp_params([token.as_str()]).unwrap();
            prop_assert_eq!(params.get(&key.to_ascii_uppercase()), Some(&value));
        }

        #[test]
        fn prop_bracketed_mail_path_round_trips(local in "[a-z0-9.]{1,16}", domain in "[a-z0-9]{1,16}\\.example") {
            let address = format!("{local}@{domain}");
            let arg = parse_mail_argument(&format!("FROM:<{address}>"), true).unwrap();
            prop_assert_eq!(arg.address, address);
        }

        #[test]
        fn prop_parsers_never_panic(arg in "\\PC{0,64}") {
            let _ = parse_mail_argument(&arg, true);
            let _ = parse_mail_argument(&arg, false);
            let _ = parse_rcpt_argument(&arg);
            let _ = decode_xtext(&arg);
            let _ = parse_auth_argument(&arg);
        }
    }
}

//! SMTP command line parsing.

use crate::error::{Error, Result};

/// Verbs recognized but deliberately not implemented.
const NOT_IMPLEMENTED: [&str; 6] = ["SEND", "SOML", "SAML", "EXPN", "HELP", "TURN"];

/// SMTP command received from the peer.
///
/// Arguments are carried as the raw text after the verb, trimmed of spaces.
/// They are parsed by the functions in [`crate::parser`] once the engine
/// knows the command is allowed in the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Empty line
    Empty,
    /// HELO - Simple greeting
    Helo {
        /// Declared domain or address literal
        argument: String,
    },
    /// EHLO - Extended greeting
    Ehlo {
        /// Declared domain or address literal
        argument: String,
    },
    /// LHLO - LMTP greeting
    Lhlo {
        /// Declared domain or address literal
        argument: String,
    },
    /// MAIL - Start mail transaction
    Mail {
        /// `FROM:<address> [params]`
        argument: String,
    },
    /// RCPT - Add recipient
    Rcpt {
        /// `TO:<address> [params]`
        argument: String,
    },
    /// DATA - Begin message data
    Data {
        /// Must be empty
        argument: String,
    },
    /// RSET - Reset transaction
    Rset,
    /// VRFY - Verify address
    Vrfy {
        /// Address to verify
        argument: String,
    },
    /// NOOP - No operation
    Noop,
    /// QUIT - Close connection
    Quit,
    /// AUTH - Begin authentication
    Auth {
        /// `MECHANISM [initial-response]`
        argument: String,
    },
    /// STARTTLS - Upgrade to TLS
    StartTls,
    /// Known verb without an implementation
    NotImplemented {
        /// Upper-cased verb
        verb: String,
    },
    /// Anything else
    Unknown {
        /// Upper-cased verb
        verb: String,
    },
}

impl Command {
    /// Parses one command line (with or without its trailing CRLF).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Syntax`] if the verb contains anything other than
    /// ASCII letters.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Ok(Self::Empty);
        }

        let (verb, argument) = line.split_once(' ').unwrap_or((line, ""));
        if verb.is_empty() || !verb.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(Error::Syntax(format!("invalid command verb {verb:?}")));
        }

        let verb = verb.to_ascii_uppercase();
        let argument = argument.trim_matches(' ').to_string();

        let command = match verb.as_str() {
            "HELO" => Self::Helo { argument },
            "EHLO" => Self::Ehlo { argument },
            "LHLO" => Self::Lhlo { argument },
            "MAIL" => Self::Mail { argument },
            "RCPT" => Self::Rcpt { argument },
            "DATA" => Self::Data { argument },
            "RSET" => Self::Rset,
            "VRFY" => Self::Vrfy { argument },
            "NOOP" => Self::Noop,
            "QUIT" => Self::Quit,
            "AUTH" => Self::Auth { argument },
            "STARTTLS" => Self::StartTls,
            _ if NOT_IMPLEMENTED.contains(&verb.as_str()) => Self::NotImplemented { verb },
            _ => Self::Unknown { verb },
        };
        Ok(command)
    }

    /// Returns the verb for logging.
    #[must_use]
    pub fn verb(&self) -> &str {
        match self {
            Self::Empty => "",
            Self::Helo { .. } => "HELO",
            Self::Ehlo { .. } => "EHLO",
            Self::Lhlo { .. } => "LHLO",
            Self::Mail { .. } => "MAIL",
            Self::Rcpt { .. } => "RCPT",
            Self::Data { .. } => "DATA",
            Self::Rset => "RSET",
            Self::Vrfy { .. } => "VRFY",
            Self::Noop => "NOOP",
            Self::Quit => "QUIT",
            Self::Auth { .. } => "AUTH",
            Self::StartTls => "STARTTLS",
            Self::NotImplemented { verb } | Self::Unknown { verb } => verb,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_line() {
        assert_eq!(Command::parse("").unwrap(), Command::Empty);
        assert_eq!(Command::parse("\r\n").unwrap(), Command::Empty);
    }

    #[test]
    fn test_ehlo_command() {
        assert_eq!(
            Command::parse("EHLO client.example.com\r\n").unwrap(),
            Command::Ehlo {
                argument: "client.example.com".to_string()
            }
        );
    }

    #[test]
    fn test_verb_is_case_insensitive() {
        assert_eq!(
            Command::parse("mail FROM:<a@b>").unwrap(),
            Command::Mail {
                argument: "FROM:<a@b>".to_string()
            }
        );
        assert_eq!(Command::parse("quit").unwrap(), Command::Quit);
    }

    #[test]
    fn test_argument_is_trimmed() {
        assert_eq!(
            Command::parse("RCPT   TO:<v@b.example>  ").unwrap(),
            Command::Rcpt {
                argument: "TO:<v@b.example>".to_string()
            }
        );
    }

    #[test]
    fn test_data_keeps_argument() {
        assert_eq!(
            Command::parse("DATA now").unwrap(),
            Command::Data {
                argument: "now".to_string()
            }
        );
    }

    #[test]
    fn test_starttls_command() {
        assert_eq!(Command::parse("STARTTLS").unwrap(), Command::StartTls);
        assert_eq!(Command::parse("StartTLS").unwrap(), Command::StartTls);
    }

    #[test]
    fn test_not_implemented() {
        for verb in ["SEND", "soml", "SAML", "EXPN", "HELP", "TURN"] {
            let cmd = Command::parse(verb).unwrap();
            assert_eq!(
                cmd,
                Command::NotImplemented {
                    verb: verb.to_ascii_uppercase()
                }
            );
        }
    }

    #[test]
    fn test_unknown_verb() {
        let cmd = Command::parse("XCLIENT ADDR=1.2.3.4").unwrap();
        assert_eq!(
            cmd,
            Command::Unknown {
                verb: "XCLIENT".to_string()
            }
        );
        assert_eq!(cmd.verb(), "XCLIENT");
    }

    #[test]
    fn test_malformed_verb() {
        assert!(matches!(Command::parse("MA1L FROM:<a@b>"), Err(Error::Syntax(_))));
        assert!(matches!(Command::parse(" NOOP"), Err(Error::Syntax(_))));
        assert!(matches!(Command::parse("\u{e9}HLO x"), Err(Error::Syntax(_))));
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(line in "\\PC{0,80}") {
            let _ = Command::parse(&line);
        }

        #[test]
        fn prop_alphabetic_verbs_parse(verb in "[a-zA-Z]{1,12}", arg in "[ -~]{0,32}") {
            let line = format!("{verb} {arg}");
            prop_assert!(Command::parse(&line).is_ok());
        }
    }
}

//! Service extensions advertised in the EHLO/LHLO reply.

use std::fmt;

/// SMTP extension advertised to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Extension {
    /// PIPELINING - Command pipelining (RFC 2920)
    Pipelining,
    /// 8BITMIME - 8-bit MIME transport (RFC 6152)
    EightBitMime,
    /// ENHANCEDSTATUSCODES - RFC 2034
    EnhancedStatusCodes,
    /// STARTTLS - TLS upgrade (RFC 3207)
    StartTls,
    /// AUTH - Authentication mechanisms (RFC 4954)
    Auth(Vec<String>),
    /// SIZE - Maximum message size (RFC 1870)
    Size(usize),
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipelining => f.write_str("PIPELINING"),
            Self::EightBitMime => f.write_str("8BITMIME"),
            Self::EnhancedStatusCodes => f.write_str("ENHANCEDSTATUSCODES"),
            Self::StartTls => f.write_str("STARTTLS"),
            Self::Auth(mechanisms) => {
                f.write_str("AUTH")?;
                for mechanism in mechanisms {
                    write!(f, " {mechanism}")?;
                }
                Ok(())
            }
            Self::Size(max) => write!(f, "SIZE {max}"),
        }
    }
}

/// Value of the MAIL `BODY=` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Body {
    /// 7BIT
    SevenBit,
    /// 8BITMIME
    EightBitMime,
}

impl Body {
    /// Parses a `BODY=` value, case-insensitively.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "7BIT" => Some(Self::SevenBit),
            "8BITMIME" => Some(Self::EightBitMime),
            _ => None,
        }
    }

    /// Returns the parameter value as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SevenBit => "7BIT",
            Self::EightBitMime => "8BITMIME",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;

    mod extension_display_tests {
        use super::*;

        #[test]
        fn keywords() {
            assert_eq!(Extension::Pipelining.to_string(), "PIPELINING");
            assert_eq!(Extension::EightBitMime.to_string(), "8BITMIME");
            assert_eq!(
                Extension::EnhancedStatusCodes.to_string(),
                "ENHANCEDSTATUSCODES"
            );
            assert_eq!(Extension::StartTls.to_string(), "STARTTLS");
        }

        #[test]
        fn auth_lists_mechanisms() {
            let ext = Extension::Auth(vec!["LOGIN".to_string(), "PLAIN".to_string()]);
            assert_eq!(ext.to_string(), "AUTH LOGIN PLAIN");
        }

        #[test]
        fn size() {
            assert_eq!(Extension::Size(52_428_800).to_string(), "SIZE 52428800");
        }
    }

    mod body_tests {
        use super::*;

        #[test]
        fn parse_known() {
            assert_eq!(Body::parse("7BIT"), Some(Body::SevenBit));
            assert_eq!(Body::parse("8bitmime"), Some(Body::EightBitMime));
        }

        #[test]
        fn parse_unknown() {
            assert_eq!(Body::parse("BINARYMIME"), None);
            assert_eq!(Body::parse(""), None);
        }

        #[test]
        fn as_str() {
            assert_eq!(Body::SevenBit.as_str(), "7BIT");
            assert_eq!(Body::EightBitMime.as_str(), "8BITMIME");
        }
    }
}

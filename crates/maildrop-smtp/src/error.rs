//! Error types for the SMTP engine and its collaborators.

use std::io;
use std::time::Duration;

use crate::types::{EnhancedCode, ReplyCode};

/// Result type alias for SMTP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SMTP error types.
///
/// [`Error::Smtp`] is the structured rejection a backend returns when it
/// wants a specific reply on the wire. Every other variant is opaque to the
/// engine and is mapped to a default reply for the command being handled.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Structured rejection, sent to the peer verbatim.
    #[error("SMTP error {code}: {message}")]
    Smtp {
        /// Reply code (e.g., 550).
        code: ReplyCode,
        /// Enhanced status code (e.g., 5.1.1).
        enhanced: EnhancedCode,
        /// Human-readable reply text.
        message: String,
    },

    /// Malformed command line or argument.
    #[error("Syntax error: {0}")]
    Syntax(String),

    /// A read or write did not complete within its deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// A command line exceeded the configured maximum length.
    #[error("Line exceeds {0} bytes")]
    LineTooLong(usize),

    /// Protocol error (unexpected client behaviour).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Any other collaborator failure.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Creates a structured SMTP rejection.
    #[must_use]
    pub fn smtp(code: u16, enhanced: EnhancedCode, message: impl Into<String>) -> Self {
        Self::Smtp {
            code: ReplyCode::new(code),
            enhanced,
            message: message.into(),
        }
    }

    /// Wraps an arbitrary error (or message) as an opaque failure.
    #[must_use]
    pub fn other(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Other(err.into())
    }

    /// Returns true if this is a permanent rejection (5xx).
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Smtp { code, .. } if code.is_permanent())
    }

    /// Returns true if this is a transient rejection (4xx).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Smtp { code, .. } if code.is_transient())
    }
}

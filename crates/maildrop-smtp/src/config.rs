//! Server configuration types.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::Mirror;

/// Default maximum length of a command line, in bytes.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 2000;

/// SMTP/LMTP server configuration.
#[derive(Clone)]
pub struct Config {
    /// Domain announced in the greeting.
    pub domain: String,
    /// Speak LMTP (RFC 2033) instead of SMTP.
    pub lmtp: bool,
    /// Require `MAIL FROM:<address>` with angle brackets.
    pub strict: bool,
    /// Treat AUTH as an unknown command.
    pub auth_disabled: bool,
    /// Allow AUTH over a plaintext transport.
    pub allow_insecure_auth: bool,
    /// Maximum message size in bytes, advertised as `SIZE`.
    pub max_message_bytes: Option<usize>,
    /// Maximum number of recipients per transaction.
    pub max_recipients: Option<usize>,
    /// Maximum command line length in bytes.
    pub max_line_length: usize,
    /// Deadline for each read from the peer.
    pub read_timeout: Option<Duration>,
    /// Deadline for each reply written to the peer.
    pub write_timeout: Option<Duration>,
    /// TLS configuration. Enables STARTTLS when present.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Receives a copy of every byte exchanged with the peer.
    pub mirror: Option<Mirror>,
}

impl Config {
    /// Creates a new SMTP configuration for the given domain.
    #[must_use]
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            lmtp: false,
            strict: false,
            auth_disabled: false,
            allow_insecure_auth: false,
            max_message_bytes: None,
            max_recipients: None,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            read_timeout: None,
            write_timeout: None,
            tls: None,
            mirror: None,
        }
    }

    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(domain: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(domain)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new("localhost")
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("domain", &self.domain)
            .field("lmtp", &self.lmtp)
            .field("strict", &self.strict)
            .field("auth_disabled", &self.auth_disabled)
            .field("allow_insecure_auth", &self.allow_insecure_auth)
            .field("max_message_bytes", &self.max_message_bytes)
            .field("max_recipients", &self.max_recipients)
            .field("max_line_length", &self.max_line_length)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("tls", &self.tls.is_some())
            .field("mirror", &self.mirror.is_some())
            .finish()
    }
}

/// Builder for server configuration.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Creates a new builder with the given domain.
    #[must_use]
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            config: Config::new(domain),
        }
    }

    /// Switches to LMTP.
    #[must_use]
    pub const fn lmtp(mut self, lmtp: bool) -> Self {
        self.config.lmtp = lmtp;
        self
    }

    /// Requires bracketed MAIL paths.
    #[must_use]
    pub const fn strict(mut self, strict: bool) -> Self {
        self.config.strict = strict;
        self
    }

    /// Disables AUTH entirely.
    #[must_use]
    pub const fn auth_disabled(mut self, disabled: bool) -> Self {
        self.config.auth_disabled = disabled;
        self
    }

    /// Allows AUTH without TLS.
    #[must_use]
    pub const fn allow_insecure_auth(mut self, allow: bool) -> Self {
        self.config.allow_insecure_auth = allow;
        self
    }

    /// Sets the maximum message size.
    #[must_use]
    pub const fn max_message_bytes(mut self, max: usize) -> Self {
        self.config.max_message_bytes = Some(max);
        self
    }

    /// Sets the maximum number of recipients.
    #[must_use]
    pub const fn max_recipients(mut self, max: usize) -> Self {
        self.config.max_recipients = Some(max);
        self
    }

    /// Sets the maximum command line length.
    #[must_use]
    pub const fn max_line_length(mut self, max: usize) -> Self {
        self.config.max_line_length = max;
        self
    }

    /// Sets the read deadline.
    #[must_use]
    pub const fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    /// Sets the write deadline.
    #[must_use]
    pub const fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = Some(timeout);
        self
    }

    /// Enables STARTTLS with the given rustls configuration.
    #[must_use]
    pub fn tls(mut self, tls: Arc<rustls::ServerConfig>) -> Self {
        self.config.tls = Some(tls);
        self
    }

    /// Mirrors the conversation into a writer.
    #[must_use]
    pub fn mirror(mut self, mirror: Mirror) -> Self {
        self.config.mirror = Some(mirror);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_config_new() {
        let config = Config::new("mx.example.com");
        assert_eq!(config.domain, "mx.example.com");
        assert!(!config.lmtp);
        assert!(!config.strict);
        assert_eq!(config.max_line_length, DEFAULT_MAX_LINE_LENGTH);
        assert!(config.max_message_bytes.is_none());
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_config_default() {
        assert_eq!(Config::default().domain, "localhost");
    }

    #[test]
    fn test_config_builder() {
        let config = Config::builder("lmtp.example.com")
            .lmtp(true)
            .strict(true)
            .allow_insecure_auth(true)
            .max_message_bytes(1024)
            .max_recipients(50)
            .max_line_length(512)
            .read_timeout(Duration::from_secs(30))
            .write_timeout(Duration::from_secs(10))
            .build();

        assert_eq!(config.domain, "lmtp.example.com");
        assert!(config.lmtp);
        assert!(config.strict);
        assert!(config.allow_insecure_auth);
        assert!(!config.auth_disabled);
        assert_eq!(config.max_message_bytes, Some(1024));
        assert_eq!(config.max_recipients, Some(50));
        assert_eq!(config.max_line_length, 512);
        assert_eq!(config.read_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.write_timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_config_debug_hides_handles() {
        let sink: Mirror = Arc::new(std::sync::Mutex::new(Vec::<u8>::new()));
        let config = Config::builder("mx.example.com").mirror(sink).build();
        let debug = format!("{config:?}");
        assert!(debug.contains("mirror: true"));
        assert!(debug.contains("tls: false"));
    }
}

//! Process-wide server state shared by every connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_rustls::TlsAcceptor;

use crate::backend::Backend;
use crate::config::Config;
use crate::connection::{Conn, Io, Transport};
use crate::error::Result;
use crate::sasl::{AuthContext, Mechanism, Mechanisms};

/// SMTP/LMTP server.
///
/// Holds the configuration, the backend, the SASL mechanism registry and
/// the TLS acceptor. It is immutable once wrapped in an [`Arc`] and shared
/// by all connection tasks.
///
/// ```ignore
/// let server = Arc::new(Server::new(backend, Config::new("mx.example.com")));
/// loop {
///     let (stream, addr) = listener.accept().await?;
///     let server = Arc::clone(&server);
///     tokio::spawn(async move { server.serve_connection(stream, Some(addr)).await });
/// }
/// ```
pub struct Server<B: Backend> {
    config: Config,
    backend: Arc<B>,
    mechanisms: Mechanisms<B>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl<B: Backend> std::fmt::Debug for Server<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("mechanisms", &self.mechanisms)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Server<B> {
    /// Creates a server offering the PLAIN and LOGIN mechanisms.
    #[must_use]
    pub fn new(backend: B, config: Config) -> Self {
        let tls_acceptor = config.tls.clone().map(TlsAcceptor::from);
        Self {
            config,
            backend: Arc::new(backend),
            mechanisms: Mechanisms::with_defaults(),
            tls_acceptor,
        }
    }

    /// Registers (or replaces) a SASL mechanism.
    pub fn register_mechanism<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(AuthContext<B>) -> Box<dyn Mechanism> + Send + Sync + 'static,
    {
        self.mechanisms.register(name, factory);
    }

    /// Removes every SASL mechanism, including the built-in ones.
    pub fn clear_mechanisms(&mut self) {
        self.mechanisms = Mechanisms::new();
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the backend.
    #[must_use]
    pub const fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Returns the mechanism registry.
    #[must_use]
    pub const fn mechanisms(&self) -> &Mechanisms<B> {
        &self.mechanisms
    }

    /// Returns the TLS acceptor, if TLS is configured.
    #[must_use]
    pub const fn tls_acceptor(&self) -> Option<&TlsAcceptor> {
        self.tls_acceptor.as_ref()
    }

    /// Creates the protocol engine for an accepted connection without
    /// running it.
    #[must_use]
    pub fn connection(self: &Arc<Self>, io: impl Io + 'static, remote_addr: Option<SocketAddr>) -> Conn<B> {
        let transport = Transport::new(io, self.config.mirror.clone());
        Conn::new(Arc::clone(self), transport, remote_addr)
    }

    /// Serves one accepted connection until it closes.
    ///
    /// # Errors
    ///
    /// Returns the I/O error that ended the connection, if any. A clean
    /// QUIT or disconnect returns `Ok(())`.
    pub async fn serve_connection(
        self: Arc<Self>,
        io: impl Io + 'static,
        remote_addr: Option<SocketAddr>,
    ) -> Result<()> {
        self.connection(io, remote_addr).serve().await
    }

    /// Turns an accepted connection away with `421` and closes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply cannot be written.
    pub async fn reject_connection(
        self: Arc<Self>,
        io: impl Io + 'static,
        remote_addr: Option<SocketAddr>,
    ) -> Result<()> {
        self.connection(io, remote_addr).reject().await
    }
}

//! Backend and session interfaces consumed by the engine.
//!
//! A [`Backend`] is shared by every connection of a [`crate::Server`] and
//! hands out one [`Session`] per authenticated (or anonymous) peer. The
//! engine drives the session through the envelope: `mail`, then `rcpt` once
//! per recipient, then `data`, with `reset` between transactions and
//! `logout` when the session is replaced or the connection closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::parser::EsmtpParams;
use crate::types::{Body, EnhancedCode};

/// Negotiated TLS parameters of a secured connection.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsInfo {
    /// Negotiated protocol version.
    pub protocol_version: Option<rustls::ProtocolVersion>,
    /// Negotiated cipher suite.
    pub cipher_suite: Option<rustls::CipherSuite>,
    /// Server name indicated by the peer (SNI).
    pub server_name: Option<String>,
}

/// Snapshot of a connection handed to the backend.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectionState {
    /// Identity declared by HELO/EHLO/LHLO. Empty until the peer greets.
    pub hostname: String,
    /// Remote socket address, when known.
    pub remote_addr: Option<SocketAddr>,
    /// TLS parameters once the transport is secured.
    pub tls: Option<TlsInfo>,
}

/// Parsed `MAIL FROM` parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MailOptions {
    /// Declared message size (`SIZE=`).
    pub size: Option<usize>,
    /// Declared body type (`BODY=`).
    pub body: Option<Body>,
    /// Authenticated submitter (`AUTH=`), xtext-decoded.
    /// `Some("")` means the submitter is unknown (`AUTH=<>`).
    pub auth: Option<String>,
    /// All parameters as sent, keys upper-cased.
    pub params: EsmtpParams,
}

/// Authorizes connections and creates sessions.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Session type produced by this backend.
    type Session: Session;

    /// Creates a session for a peer that has not authenticated.
    ///
    /// Called lazily on the first accepted `MAIL` command.
    ///
    /// # Errors
    ///
    /// Return [`Error::Smtp`] to choose the reply, or any other error to
    /// refuse with `502 5.7.0`.
    async fn anonymous_session(&self, state: &ConnectionState) -> Result<Self::Session>;

    /// Verifies a username and password decoded by a SASL mechanism.
    ///
    /// # Errors
    ///
    /// The default implementation refuses every login with
    /// `535 5.7.8 Authentication not supported`.
    async fn login(
        &self,
        state: &ConnectionState,
        username: &str,
        password: &str,
    ) -> Result<Self::Session> {
        let _ = (state, username, password);
        Err(Error::smtp(
            535,
            EnhancedCode::new(5, 7, 8),
            "Authentication not supported",
        ))
    }
}

/// One peer's mail session.
#[async_trait]
pub trait Session: Send + 'static {
    /// Sets the reverse path. Empty for the null sender `<>`.
    ///
    /// # Errors
    ///
    /// Return [`Error::Smtp`] to choose the reply, or any other error to
    /// reject with `451 4.0.0`.
    async fn mail(&mut self, from: &str, options: &MailOptions) -> Result<()>;

    /// Adds a recipient.
    ///
    /// # Errors
    ///
    /// Return [`Error::Smtp`] to choose the reply, or any other error to
    /// reject with `451 4.0.0`.
    async fn rcpt(&mut self, to: &str) -> Result<()>;

    /// Consumes the message content.
    ///
    /// The reader yields the unstuffed message with CRLF line endings and
    /// ends at the terminating dot line. Reading it fully is optional; the
    /// engine drains whatever is left.
    ///
    /// # Errors
    ///
    /// Return [`Error::Smtp`] to choose the reply, or any other error to
    /// reject with `554 5.0.0`.
    async fn data(&mut self, reader: &mut (dyn AsyncRead + Unpin + Send)) -> Result<()>;

    /// Discards the current envelope.
    fn reset(&mut self);

    /// Ends the session.
    fn logout(&mut self);
}

/// Shared slot holding the session of one connection.
///
/// The engine and SASL mechanisms go through this slot for every access so
/// that the active session can be replaced or inspected from another task.
/// The engine never holds the lock across network I/O: envelope calls take
/// the session out of the slot and put it back afterwards.
pub struct SessionSlot<S> {
    inner: Arc<Mutex<Option<S>>>,
    active: Arc<AtomicBool>,
}

impl<S> Clone for SessionSlot<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            active: Arc::clone(&self.active),
        }
    }
}

impl<S> Default for SessionSlot<S> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
            active: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<S> std::fmt::Debug for SessionSlot<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSlot")
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl<S> SessionSlot<S> {
    /// Returns true if a session is installed.
    ///
    /// Reads a flag kept beside the lock, so it never waits on the engine.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl<S: Session> SessionSlot<S> {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the slot.
    pub async fn lock(&self) -> MutexGuard<'_, Option<S>> {
        self.inner.lock().await
    }

    /// Installs a session, logging out the one it replaces.
    pub async fn install(&self, session: S) {
        let mut slot = self.inner.lock().await;
        self.active.store(true, Ordering::Release);
        if let Some(mut previous) = slot.replace(session) {
            previous.logout();
        }
    }

    /// Takes the session out for a call that may wait on the peer.
    ///
    /// The slot stays active while the session is out. Hand it back with
    /// [`Self::checkin`].
    pub(crate) async fn checkout(&self) -> Option<S> {
        self.inner.lock().await.take()
    }

    /// Returns a session taken with [`Self::checkout`].
    ///
    /// If the slot was logged out or refilled meanwhile, the returned session
    /// is logged out instead.
    pub(crate) async fn checkin(&self, mut session: S) {
        let mut slot = self.inner.lock().await;
        if slot.is_none() && self.is_active() {
            *slot = Some(session);
        } else {
            session.logout();
        }
    }

    /// Resets the envelope of the installed session, if any.
    pub async fn reset(&self) {
        if let Some(session) = self.inner.lock().await.as_mut() {
            session.reset();
        }
    }

    /// Removes and logs out the installed session, if any.
    pub async fn logout(&self) {
        let previous = {
            let mut slot = self.inner.lock().await;
            self.active.store(false, Ordering::Release);
            slot.take()
        };
        if let Some(mut session) = previous {
            session.logout();
        }
    }
}

//! Server-side SASL mechanisms.
//!
//! The engine runs the challenge/response loop; a [`Mechanism`] only sees
//! decoded client responses and decides what to send back. Mechanisms that
//! authenticate the peer install the resulting session themselves through
//! the [`SessionSlot`] in their [`AuthContext`].
//!
//! Implements:
//! - PLAIN (RFC 4616)
//! - LOGIN (draft-murchison-sasl-login)

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::{Backend, ConnectionState, SessionSlot};
use crate::error::{Error, Result};
use crate::types::EnhancedCode;

/// Name of the PLAIN mechanism.
pub const PLAIN: &str = "PLAIN";

/// Name of the LOGIN mechanism.
pub const LOGIN: &str = "LOGIN";

/// Outcome of one mechanism step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send this challenge (raw bytes, base64-encoded on the wire) and wait
    /// for another response.
    Challenge(Vec<u8>),
    /// Negotiation finished.
    Done,
}

/// One in-progress SASL negotiation.
#[async_trait]
pub trait Mechanism: Send {
    /// Processes a client response.
    ///
    /// `None` means the client sent no initial response, which is distinct
    /// from an empty one.
    ///
    /// # Errors
    ///
    /// Return [`Error::Smtp`] to choose the reply; any other error is
    /// reported as `454 4.7.0`.
    async fn step(&mut self, response: Option<&[u8]>) -> Result<Step>;
}

/// What a mechanism gets to work with.
pub struct AuthContext<B: Backend> {
    /// Connection snapshot taken when AUTH was issued.
    pub state: ConnectionState,
    /// Shared backend.
    pub backend: Arc<B>,
    /// Session slot of the connection.
    pub session: SessionSlot<B::Session>,
}

impl<B: Backend> fmt::Debug for AuthContext<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Creates a mechanism instance for one AUTH command.
pub type MechanismFactory<B> = Arc<dyn Fn(AuthContext<B>) -> Box<dyn Mechanism> + Send + Sync>;

/// Registry of mechanisms offered by a server, keyed by upper-case name.
pub struct Mechanisms<B: Backend> {
    factories: BTreeMap<String, MechanismFactory<B>>,
}

impl<B: Backend> Mechanisms<B> {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Creates a registry holding PLAIN and LOGIN.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut mechanisms = Self::new();
        mechanisms.register(PLAIN, plain::<B>);
        mechanisms.register(LOGIN, login::<B>);
        mechanisms
    }

    /// Registers (or replaces) a mechanism.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(AuthContext<B>) -> Box<dyn Mechanism> + Send + Sync + 'static,
    {
        self.factories
            .insert(name.to_ascii_uppercase(), Arc::new(factory));
    }

    /// Looks up a mechanism by name, case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MechanismFactory<B>> {
        self.factories.get(&name.to_ascii_uppercase())
    }

    /// Returns the registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Returns true if no mechanism is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl<B: Backend> Default for Mechanisms<B> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl<B: Backend> Clone for Mechanisms<B> {
    fn clone(&self) -> Self {
        Self {
            factories: self.factories.clone(),
        }
    }
}

impl<B: Backend> fmt::Debug for Mechanisms<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

fn plain<B: Backend>(ctx: AuthContext<B>) -> Box<dyn Mechanism> {
    Box::new(Plain::new(ctx))
}

fn login<B: Backend>(ctx: AuthContext<B>) -> Box<dyn Mechanism> {
    Box::new(Login::new(ctx))
}

fn malformed(mechanism: &str) -> Error {
    Error::smtp(
        501,
        EnhancedCode::new(5, 5, 2),
        format!("Malformed {mechanism} response"),
    )
}

fn utf8<'a>(mechanism: &str, bytes: &'a [u8]) -> Result<&'a str> {
    std::str::from_utf8(bytes).map_err(|_| malformed(mechanism))
}

/// Installs the session for verified credentials.
async fn authenticate<B: Backend>(ctx: &AuthContext<B>, username: &str, password: &str) -> Result<()> {
    let session = ctx.backend.login(&ctx.state, username, password).await?;
    ctx.session.install(session).await;
    tracing::info!(username, remote = ?ctx.state.remote_addr, "authenticated");
    Ok(())
}

/// PLAIN mechanism (RFC 4616): `authzid \0 authcid \0 passwd`.
pub struct Plain<B: Backend> {
    ctx: AuthContext<B>,
    done: bool,
}

impl<B: Backend> Plain<B> {
    /// Creates a PLAIN negotiation.
    #[must_use]
    pub const fn new(ctx: AuthContext<B>) -> Self {
        Self { ctx, done: false }
    }
}

#[async_trait]
impl<B: Backend> Mechanism for Plain<B> {
    async fn step(&mut self, response: Option<&[u8]>) -> Result<Step> {
        if self.done {
            return Err(Error::Protocol("unexpected PLAIN response".into()));
        }
        let Some(response) = response else {
            return Ok(Step::Challenge(Vec::new()));
        };
        self.done = true;

        let mut parts = response.split(|&b| b == 0);
        let (Some(identity), Some(username), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed(PLAIN));
        };

        let identity = utf8(PLAIN, identity)?;
        let username = utf8(PLAIN, username)?;
        let password = utf8(PLAIN, password)?;
        if !identity.is_empty() && identity != username {
            return Err(Error::smtp(
                535,
                EnhancedCode::new(5, 7, 8),
                "Identities not supported",
            ));
        }

        authenticate(&self.ctx, username, password).await?;
        Ok(Step::Done)
    }
}

enum LoginState {
    Username,
    Password(String),
    Done,
}

/// LOGIN mechanism: prompts for the username, then the password.
pub struct Login<B: Backend> {
    ctx: AuthContext<B>,
    state: LoginState,
}

impl<B: Backend> Login<B> {
    /// Creates a LOGIN negotiation.
    #[must_use]
    pub const fn new(ctx: AuthContext<B>) -> Self {
        Self {
            ctx,
            state: LoginState::Username,
        }
    }
}

#[async_trait]
impl<B: Backend> Mechanism for Login<B> {
    async fn step(&mut self, response: Option<&[u8]>) -> Result<Step> {
        match (&self.state, response) {
            (LoginState::Username, None) => Ok(Step::Challenge(b"Username:".to_vec())),
            (LoginState::Username, Some(username)) => {
                let username = utf8(LOGIN, username)?.to_string();
                self.state = LoginState::Password(username);
                Ok(Step::Challenge(b"Password:".to_vec()))
            }
            (LoginState::Password(_), None) => Ok(Step::Challenge(b"Password:".to_vec())),
            (LoginState::Password(username), Some(password)) => {
                let username = username.clone();
                let password = utf8(LOGIN, password)?.to_string();
                self.state = LoginState::Done;
                authenticate(&self.ctx, &username, &password).await?;
                Ok(Step::Done)
            }
            (LoginState::Done, _) => Err(Error::Protocol("unexpected LOGIN response".into())),
        }
    }
}

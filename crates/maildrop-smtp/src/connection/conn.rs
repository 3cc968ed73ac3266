//! Per-connection SMTP/LMTP protocol engine.
//!
//! A [`Conn`] owns one peer: it sends the greeting, reads command lines,
//! enforces the envelope order (greeting, `MAIL`, `RCPT`, `DATA`), runs
//! SASL negotiations and STARTTLS in-line, and forwards the envelope to the
//! backend session. Commands are handled one at a time.

use std::any::Any;
use std::backtrace::Backtrace;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::FutureExt;

use super::data::DataReader;
use super::framed::Framed;
use super::stream::Transport;
use crate::backend::{Backend, ConnectionState, MailOptions, Session, SessionSlot};
use crate::command::Command;
use crate::error::{Error, Result};
use crate::parser::{self, ArgumentError, EsmtpParams};
use crate::sasl::{AuthContext, Step};
use crate::server::Server;
use crate::types::{Body, EnhancedCode, EnhancedStatus, Extension, Reply, ReplyCode};

/// Number of bad command lines after which the connection is closed.
const MAX_ERRORS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Greeting {
    Helo,
    Ehlo,
    Lhlo,
}

impl Greeting {
    const fn verb(self) -> &'static str {
        match self {
            Self::Helo => "HELO",
            Self::Ehlo => "EHLO",
            Self::Lhlo => "LHLO",
        }
    }
}

/// Protocol engine for one connection.
pub struct Conn<B: Backend> {
    server: Arc<Server<B>>,
    framed: Framed,
    remote_addr: Option<SocketAddr>,
    helo: String,
    error_count: usize,
    session: SessionSlot<B::Session>,
    authenticated: bool,
    from_received: bool,
    recipients: Vec<String>,
    closed: bool,
}

impl<B: Backend> std::fmt::Debug for Conn<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("remote_addr", &self.remote_addr)
            .field("helo", &self.helo)
            .field("error_count", &self.error_count)
            .field("authenticated", &self.authenticated)
            .field("from_received", &self.from_received)
            .field("recipients", &self.recipients)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Conn<B> {
    pub(crate) fn new(
        server: Arc<Server<B>>,
        transport: Transport,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let framed = Framed::new(transport, server.config());
        Self {
            server,
            framed,
            remote_addr,
            helo: String::new(),
            error_count: 0,
            session: SessionSlot::new(),
            authenticated: false,
            from_received: false,
            recipients: Vec::new(),
            closed: false,
        }
    }

    /// Returns a snapshot of the connection for the backend.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState {
            hostname: self.helo.clone(),
            remote_addr: self.remote_addr,
            tls: self.framed.transport().tls_info(),
        }
    }

    /// Returns a handle on the session slot.
    #[must_use]
    pub fn session(&self) -> SessionSlot<B::Session> {
        self.session.clone()
    }

    /// Returns the identity declared by the peer, empty before the greeting.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.helo
    }

    /// Returns the recipients accepted in the current transaction.
    #[must_use]
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    /// Returns true once the connection has been closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns true once the transport is secured.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.framed.transport().is_tls()
    }

    /// Greets the peer and processes commands until the connection ends.
    ///
    /// # Errors
    ///
    /// Returns the I/O error that ended the connection. Disconnects, QUIT,
    /// idle timeouts and forced closes end it cleanly.
    pub async fn serve(mut self) -> Result<()> {
        tracing::info!(remote = ?self.remote_addr, "connection opened");
        let result = match self.greet().await {
            Ok(()) => self.run().await,
            Err(e) => Err(e),
        };
        self.close().await;
        match &result {
            Ok(()) => tracing::info!(remote = ?self.remote_addr, "connection closed"),
            Err(e) => tracing::warn!(remote = ?self.remote_addr, ?e, "connection failed"),
        }
        result
    }

    /// Tells the peer the server is busy and closes the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply cannot be written.
    pub async fn reject(mut self) -> Result<()> {
        tracing::info!(remote = ?self.remote_addr, "connection rejected");
        let result = self
            .reply(
                ReplyCode::SERVICE_UNAVAILABLE,
                EnhancedCode::new(4, 4, 5),
                "Too busy. Try again later.",
            )
            .await;
        self.close().await;
        result
    }

    async fn greet(&mut self) -> Result<()> {
        let config = self.server.config();
        let protocol = if config.lmtp { "LMTP" } else { "ESMTP" };
        let text = format!("{} {protocol} Service Ready", config.domain);
        self.reply(ReplyCode::SERVICE_READY, EnhancedStatus::Absent, text)
            .await
    }

    async fn run(&mut self) -> Result<()> {
        while !self.closed {
            let line = match self.framed.read_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    tracing::debug!(remote = ?self.remote_addr, "peer disconnected");
                    return Ok(());
                }
                Err(Error::LineTooLong(limit)) => {
                    tracing::debug!(remote = ?self.remote_addr, limit, "command line too long");
                    self.reply(
                        ReplyCode::SYNTAX_ERROR,
                        EnhancedCode::new(5, 4, 0),
                        "Too long line, closing connection",
                    )
                    .await?;
                    return Ok(());
                }
                Err(Error::Timeout(after)) => {
                    tracing::debug!(remote = ?self.remote_addr, ?after, "idle timeout");
                    self.reply(
                        ReplyCode::CLOSING,
                        EnhancedCode::new(2, 4, 2),
                        "Idle timeout, bye bye",
                    )
                    .await?;
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(remote = ?self.remote_addr, ?err, "read failed");
                    if let Err(e) = self
                        .reply(
                            ReplyCode::CLOSING,
                            EnhancedCode::new(2, 4, 0),
                            "Connection error, sorry",
                        )
                        .await
                    {
                        tracing::debug!(?e, "could not report read failure");
                    }
                    return Err(err);
                }
            };
            self.handle_line(&line).await?;
        }
        Ok(())
    }

    /// Parses and dispatches one command line inside the panic guard.
    async fn handle_line(&mut self, line: &str) -> Result<()> {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(err) => {
                tracing::debug!(remote = ?self.remote_addr, %err, "malformed command");
                return self
                    .count_error(
                        ReplyCode::PARAMETER_ERROR,
                        EnhancedCode::new(5, 5, 2),
                        "Bad command",
                    )
                    .await;
            }
        };

        let verb = command.verb().to_string();
        tracing::debug!(remote = ?self.remote_addr, command = %verb, "received command");

        match AssertUnwindSafe(self.handle(command)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                tracing::error!(
                    remote = ?self.remote_addr,
                    command = %verb,
                    panic = panic_message(&*panic),
                    backtrace = %Backtrace::force_capture(),
                    "panic while handling command"
                );
                if let Err(e) = self
                    .reply(
                        ReplyCode::SERVICE_UNAVAILABLE,
                        EnhancedCode::new(4, 0, 0),
                        "Internal server error",
                    )
                    .await
                {
                    tracing::debug!(?e, "could not report panic");
                }
                self.close().await;
                Ok(())
            }
        }
    }

    async fn handle(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Empty => {
                self.reply(
                    ReplyCode::SYNTAX_ERROR,
                    EnhancedCode::new(5, 5, 2),
                    "Speak up",
                )
                .await
            }
            Command::Helo { argument } => self.handle_greet(Greeting::Helo, &argument).await,
            Command::Ehlo { argument } => self.handle_greet(Greeting::Ehlo, &argument).await,
            Command::Lhlo { argument } => self.handle_greet(Greeting::Lhlo, &argument).await,
            Command::Mail { argument } => self.handle_mail(&argument).await,
            Command::Rcpt { argument } => self.handle_rcpt(&argument).await,
            Command::Data { argument } => self.handle_data(&argument).await,
            Command::Rset => {
                self.reset().await;
                self.reply(ReplyCode::OK, EnhancedCode::new(2, 0, 0), "Session reset")
                    .await
            }
            Command::Vrfy { .. } => {
                self.reply(
                    ReplyCode::CANNOT_VERIFY,
                    EnhancedCode::new(2, 5, 0),
                    "Cannot VRFY user, but will accept message",
                )
                .await
            }
            Command::Noop => {
                self.reply(
                    ReplyCode::OK,
                    EnhancedCode::new(2, 0, 0),
                    "I have successfully done nothing",
                )
                .await
            }
            Command::Quit => {
                self.reply(
                    ReplyCode::CLOSING,
                    EnhancedCode::new(2, 0, 0),
                    "Goodnight and good luck",
                )
                .await?;
                self.close().await;
                Ok(())
            }
            Command::Auth { argument } => {
                if self.server.config().auth_disabled {
                    self.unrecognized("AUTH").await
                } else {
                    self.handle_auth(&argument).await
                }
            }
            Command::StartTls => self.handle_starttls().await,
            Command::NotImplemented { verb } => {
                self.count_error(
                    ReplyCode::NOT_IMPLEMENTED,
                    EnhancedCode::new(5, 5, 1),
                    format!("{verb} command not implemented"),
                )
                .await
            }
            Command::Unknown { verb } => self.unrecognized(&verb).await,
        }
    }

    async fn handle_greet(&mut self, greeting: Greeting, argument: &str) -> Result<()> {
        let lmtp = self.server.config().lmtp;
        if lmtp && greeting != Greeting::Lhlo {
            return self
                .reply(
                    ReplyCode::SYNTAX_ERROR,
                    EnhancedCode::new(5, 5, 1),
                    "This is a LMTP server, use LHLO",
                )
                .await;
        }
        if !lmtp && greeting == Greeting::Lhlo {
            return self
                .reply(
                    ReplyCode::SYNTAX_ERROR,
                    EnhancedCode::new(5, 5, 1),
                    "This is not a LMTP server",
                )
                .await;
        }

        let Ok(domain) = parser::parse_helo_argument(argument) else {
            return self
                .reply(
                    ReplyCode::PARAMETER_ERROR,
                    EnhancedCode::new(5, 5, 2),
                    format!("Domain/address argument required for {}", greeting.verb()),
                )
                .await;
        };
        self.helo = domain.to_string();
        tracing::debug!(remote = ?self.remote_addr, helo = %self.helo, "peer greeted");

        let hello = format!("Hello {}", self.helo);
        if greeting == Greeting::Helo {
            return self
                .reply(ReplyCode::OK, EnhancedCode::new(2, 0, 0), hello)
                .await;
        }

        let mut lines = vec![hello];
        lines.extend(self.extensions().iter().map(ToString::to_string));
        self.write(&Reply::multiline(ReplyCode::OK, EnhancedStatus::Absent, lines))
            .await
    }

    /// Extensions advertised in the current state.
    fn extensions(&self) -> Vec<Extension> {
        let mut extensions = vec![
            Extension::Pipelining,
            Extension::EightBitMime,
            Extension::EnhancedStatusCodes,
        ];
        if self.server.tls_acceptor().is_some() && !self.is_tls() {
            extensions.push(Extension::StartTls);
        }
        if self.auth_allowed() {
            let mechanisms = self.server.mechanisms().names().map(str::to_string);
            extensions.push(Extension::Auth(mechanisms.collect()));
        }
        if let Some(max) = self.server.config().max_message_bytes {
            extensions.push(Extension::Size(max));
        }
        extensions
    }

    fn auth_allowed(&self) -> bool {
        let config = self.server.config();
        !config.auth_disabled
            && !self.server.mechanisms().is_empty()
            && (self.is_tls() || config.allow_insecure_auth)
    }

    async fn handle_mail(&mut self, argument: &str) -> Result<()> {
        if self.helo.is_empty() {
            return self
                .reply(
                    ReplyCode::NOT_IMPLEMENTED,
                    EnhancedCode::new(5, 5, 1),
                    "Please introduce yourself first.",
                )
                .await;
        }
        if self.from_received {
            return self
                .reply(
                    ReplyCode::BAD_SEQUENCE,
                    EnhancedCode::new(5, 5, 1),
                    "Nested MAIL command",
                )
                .await;
        }

        let mail = match parser::parse_mail_argument(argument, self.server.config().strict) {
            Ok(mail) => mail,
            Err(ArgumentError::Param(_)) => {
                return self
                    .reply(
                        ReplyCode::PARAMETER_ERROR,
                        EnhancedCode::new(5, 5, 4),
                        "Unable to parse MAIL ESMTP parameters",
                    )
                    .await;
            }
            Err(_) => {
                return self
                    .reply(
                        ReplyCode::PARAMETER_ERROR,
                        EnhancedCode::new(5, 5, 2),
                        "Was expecting MAIL arg syntax of FROM:<address>",
                    )
                    .await;
            }
        };

        let options = match self.mail_options(mail.params) {
            Ok(options) => options,
            Err(reply) => return self.write(&reply).await,
        };

        if let Err(err) = self.ensure_session().await {
            return self
                .reply_error(err, ReplyCode::NOT_IMPLEMENTED, EnhancedCode::new(5, 7, 0))
                .await;
        }

        let result = match self.session.checkout().await {
            Some(mut session) => {
                let result = session.mail(&mail.address, &options).await;
                self.session.checkin(session).await;
                result
            }
            None => Err(no_session()),
        };

        match result {
            Ok(()) => {
                self.from_received = true;
                self.reply(
                    ReplyCode::OK,
                    EnhancedCode::new(2, 0, 0),
                    format!("Roger, accepting mail from <{}>", mail.address),
                )
                .await
            }
            Err(err) => {
                self.reply_error(err, ReplyCode::LOCAL_ERROR, EnhancedCode::new(4, 0, 0))
                    .await
            }
        }
    }

    /// Validates the MAIL parameters the engine understands.
    fn mail_options(&self, params: EsmtpParams) -> std::result::Result<MailOptions, Reply> {
        let bad_param = |text: &str| {
            Reply::new(
                ReplyCode::PARAMETER_ERROR,
                EnhancedCode::new(5, 5, 4),
                text,
            )
        };
        let mut options = MailOptions::default();

        if let Some(size) = params.get("SIZE") {
            let size: usize = size
                .parse()
                .map_err(|_| bad_param("Unable to parse SIZE as an integer"))?;
            if self
                .server
                .config()
                .max_message_bytes
                .is_some_and(|max| size > max)
            {
                return Err(Reply::new(
                    ReplyCode::EXCEEDED_STORAGE,
                    EnhancedCode::new(5, 3, 4),
                    "Max message size exceeded",
                ));
            }
            options.size = Some(size);
        }

        if let Some(body) = params.get("BODY") {
            options.body = Some(Body::parse(body).ok_or_else(|| bad_param("Unknown BODY value"))?);
        }

        if let Some(auth) = params.get("AUTH") {
            let submitter = if auth == "<>" {
                Some(String::new())
            } else {
                parser::decode_xtext(auth).ok().filter(|s| !s.is_empty())
            };
            options.auth =
                Some(submitter.ok_or_else(|| bad_param("Malformed AUTH parameter value"))?);
        }

        options.params = params;
        Ok(options)
    }

    /// Creates the anonymous session unless one is installed.
    async fn ensure_session(&mut self) -> Result<()> {
        if self.session.is_active() {
            return Ok(());
        }
        let state = self.state();
        let session = self.server.backend().anonymous_session(&state).await?;
        self.session.install(session).await;
        Ok(())
    }

    async fn handle_rcpt(&mut self, argument: &str) -> Result<()> {
        if !self.from_received {
            return self
                .reply(
                    ReplyCode::NOT_IMPLEMENTED,
                    EnhancedCode::new(5, 5, 1),
                    "Missing MAIL FROM command.",
                )
                .await;
        }

        let rcpt = match parser::parse_rcpt_argument(argument) {
            Ok(rcpt) => rcpt,
            Err(ArgumentError::Param(_)) => {
                return self
                    .reply(
                        ReplyCode::PARAMETER_ERROR,
                        EnhancedCode::new(5, 5, 4),
                        "Unable to parse RCPT ESMTP parameters",
                    )
                    .await;
            }
            Err(_) => {
                return self
                    .reply(
                        ReplyCode::PARAMETER_ERROR,
                        EnhancedCode::new(5, 5, 2),
                        "Was expecting RCPT arg syntax of TO:<address>",
                    )
                    .await;
            }
        };

        if let Some(max) = self.server.config().max_recipients {
            if self.recipients.len() >= max {
                return self
                    .reply(
                        ReplyCode::EXCEEDED_STORAGE,
                        EnhancedCode::new(5, 5, 3),
                        format!("Maximum limit of {max} recipients reached"),
                    )
                    .await;
            }
        }

        let result = match self.session.checkout().await {
            Some(mut session) => {
                let result = session.rcpt(&rcpt.address).await;
                self.session.checkin(session).await;
                result
            }
            None => Err(no_session()),
        };

        match result {
            Ok(()) => {
                let text = format!("I'll make sure <{}> gets this", rcpt.address);
                self.recipients.push(rcpt.address);
                self.reply(ReplyCode::OK, EnhancedCode::new(2, 0, 0), text)
                    .await
            }
            Err(err) => {
                self.reply_error(err, ReplyCode::LOCAL_ERROR, EnhancedCode::new(4, 0, 0))
                    .await
            }
        }
    }

    async fn handle_data(&mut self, argument: &str) -> Result<()> {
        if !argument.is_empty() {
            return self
                .reply(
                    ReplyCode::PARAMETER_ERROR,
                    EnhancedCode::new(5, 5, 4),
                    "DATA command should not have any arguments",
                )
                .await;
        }
        if !self.from_received || self.recipients.is_empty() {
            return self
                .reply(
                    ReplyCode::NOT_IMPLEMENTED,
                    EnhancedCode::new(5, 5, 1),
                    "Missing RCPT TO command.",
                )
                .await;
        }

        self.reply(
            ReplyCode::START_DATA,
            EnhancedCode::new(2, 0, 0),
            "Go ahead. End your data with <CR><LF>.<CR><LF>",
        )
        .await?;

        let config = self.server.config();
        let (max_bytes, read_timeout, lmtp) =
            (config.max_message_bytes, config.read_timeout, config.lmtp);

        let mut session = self.session.checkout().await;
        let mut reader = DataReader::new(self.framed.reader_mut(), max_bytes, read_timeout);
        let result = match session.as_mut() {
            Some(session) => session.data(&mut reader).await,
            None => Err(no_session()),
        };
        let exceeded = reader.limit_exceeded();
        let drained = reader.drain().await;
        if let Some(session) = session {
            self.session.checkin(session).await;
        }
        drained?;

        let (code, enhanced, message) = match result {
            Ok(()) => (
                ReplyCode::OK,
                EnhancedCode::new(2, 0, 0),
                "OK: queued".to_string(),
            ),
            Err(Error::Smtp {
                code,
                enhanced,
                message,
            }) => (code, enhanced, message),
            Err(_) if exceeded => (
                ReplyCode::EXCEEDED_STORAGE,
                EnhancedCode::new(5, 3, 4),
                "Max message size exceeded".to_string(),
            ),
            Err(err) => {
                tracing::warn!(remote = ?self.remote_addr, ?err, "message rejected");
                (
                    ReplyCode::TRANSACTION_FAILED,
                    EnhancedCode::new(5, 0, 0),
                    format!("Error: transaction failed: {err}"),
                )
            }
        };

        let recipients = std::mem::take(&mut self.recipients);
        self.reset().await;

        if lmtp {
            for rcpt in &recipients {
                self.reply(code, enhanced, format!("<{rcpt}> {message}"))
                    .await?;
            }
            Ok(())
        } else {
            self.reply(code, enhanced, message).await
        }
    }

    async fn handle_auth(&mut self, argument: &str) -> Result<()> {
        if self.helo.is_empty() {
            return self
                .reply(
                    ReplyCode::NOT_IMPLEMENTED,
                    EnhancedCode::new(5, 5, 1),
                    "Please introduce yourself first.",
                )
                .await;
        }
        if self.authenticated {
            return self
                .reply(
                    ReplyCode::BAD_SEQUENCE,
                    EnhancedCode::new(5, 5, 1),
                    "Already authenticated",
                )
                .await;
        }
        if !self.is_tls() && !self.server.config().allow_insecure_auth {
            return self
                .reply(
                    ReplyCode::ENCRYPTION_REQUIRED,
                    EnhancedCode::new(5, 7, 11),
                    "Encryption required for requested authentication mechanism",
                )
                .await;
        }
        if self.from_received {
            return self
                .reply(
                    ReplyCode::BAD_SEQUENCE,
                    EnhancedCode::new(5, 5, 1),
                    "AUTH not permitted during a mail transaction",
                )
                .await;
        }

        let Some(auth) = parser::parse_auth_argument(argument) else {
            return self
                .reply(
                    ReplyCode::NOT_IMPLEMENTED,
                    EnhancedCode::new(5, 5, 4),
                    "Missing parameter",
                )
                .await;
        };
        let Some(factory) = self.server.mechanisms().get(auth.mechanism).cloned() else {
            return self
                .reply(
                    ReplyCode::PARAMETER_NOT_IMPLEMENTED,
                    EnhancedCode::new(5, 7, 4),
                    "Unsupported authentication mechanism",
                )
                .await;
        };
        let Ok(mut response) = auth
            .initial_response
            .map(parser::decode_sasl_response)
            .transpose()
        else {
            return self.invalid_base64().await;
        };

        // Only a session installed by this negotiation counts as success.
        self.session.logout().await;

        let mut mechanism = factory(AuthContext {
            state: self.state(),
            backend: Arc::clone(self.server.backend()),
            session: self.session.clone(),
        });

        loop {
            match mechanism.step(response.as_deref()).await {
                Ok(Step::Done) => break,
                Ok(Step::Challenge(challenge)) => {
                    self.reply(
                        ReplyCode::AUTH_CONTINUE,
                        EnhancedStatus::Absent,
                        STANDARD.encode(&challenge),
                    )
                    .await?;

                    let Some(line) = self.framed.read_line().await? else {
                        self.close().await;
                        return Ok(());
                    };
                    if line.trim() == "*" {
                        return self
                            .reply(
                                ReplyCode::PARAMETER_ERROR,
                                EnhancedCode::new(5, 0, 0),
                                "Negotiation cancelled",
                            )
                            .await;
                    }
                    match parser::decode_sasl_response(&line) {
                        Ok(decoded) => response = Some(decoded),
                        Err(_) => return self.invalid_base64().await,
                    }
                }
                Err(Error::Smtp {
                    code,
                    enhanced,
                    message,
                }) => return self.reply(code, enhanced, message).await,
                Err(err) => {
                    tracing::warn!(remote = ?self.remote_addr, ?err, "authentication failed");
                    return self
                        .reply(
                            ReplyCode::AUTH_TEMPORARY_FAILURE,
                            EnhancedCode::new(4, 7, 0),
                            err.to_string(),
                        )
                        .await;
                }
            }
        }

        if self.session.is_active() {
            self.authenticated = true;
            self.reply(
                ReplyCode::AUTH_SUCCEEDED,
                EnhancedCode::new(2, 0, 0),
                "Authentication succeeded",
            )
            .await
        } else {
            self.reply(
                ReplyCode::AUTH_FAILED,
                EnhancedCode::new(5, 7, 8),
                "Authentication credentials invalid",
            )
            .await
        }
    }

    async fn invalid_base64(&mut self) -> Result<()> {
        self.reply(
            ReplyCode::AUTH_TEMPORARY_FAILURE,
            EnhancedCode::new(4, 7, 0),
            "Invalid base64 data",
        )
        .await
    }

    async fn handle_starttls(&mut self) -> Result<()> {
        if self.is_tls() {
            return self
                .reply(
                    ReplyCode::NOT_IMPLEMENTED,
                    EnhancedCode::new(5, 5, 1),
                    "Already running in TLS",
                )
                .await;
        }
        let Some(acceptor) = self.server.tls_acceptor().cloned() else {
            return self
                .reply(
                    ReplyCode::NOT_IMPLEMENTED,
                    EnhancedCode::new(5, 5, 1),
                    "TLS not supported",
                )
                .await;
        };

        self.reply(
            ReplyCode::SERVICE_READY,
            EnhancedCode::new(2, 0, 0),
            "Ready to start TLS",
        )
        .await?;

        match self.framed.upgrade(&acceptor).await {
            Ok(()) => {
                let tls = self.framed.transport().tls_info();
                tracing::info!(
                    remote = ?self.remote_addr,
                    version = ?tls.as_ref().and_then(|t| t.protocol_version),
                    cipher = ?tls.as_ref().and_then(|t| t.cipher_suite),
                    "TLS established"
                );
                self.helo.clear();
                self.authenticated = false;
                self.session.logout().await;
                self.reset().await;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(remote = ?self.remote_addr, ?err, "TLS handshake failed");
                if let Err(e) = self
                    .reply(
                        ReplyCode::MAILBOX_UNAVAILABLE,
                        EnhancedCode::new(5, 0, 0),
                        "Handshake error",
                    )
                    .await
                {
                    tracing::debug!(?e, "could not report handshake failure");
                }
                self.close().await;
                Ok(())
            }
        }
    }

    /// Clears the envelope.
    async fn reset(&mut self) {
        self.session.reset().await;
        self.from_received = false;
        self.recipients.clear();
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.session.logout().await;
        if let Err(e) = self.framed.shutdown().await {
            tracing::debug!(?e, "shutdown failed");
        }
    }

    async fn unrecognized(&mut self, verb: &str) -> Result<()> {
        self.count_error(
            ReplyCode::SYNTAX_ERROR,
            EnhancedCode::new(5, 5, 2),
            format!("Syntax error, {verb} command unrecognized"),
        )
        .await
    }

    /// Replies to a bad command line and closes after too many of them.
    async fn count_error(
        &mut self,
        code: ReplyCode,
        enhanced: EnhancedCode,
        text: impl Into<String>,
    ) -> Result<()> {
        self.reply(code, enhanced, text).await?;
        self.error_count += 1;
        if self.error_count >= MAX_ERRORS {
            tracing::debug!(remote = ?self.remote_addr, "too many bad commands");
            self.reply(
                ReplyCode::SYNTAX_ERROR,
                EnhancedCode::new(5, 5, 2),
                "Too many unrecognized commands",
            )
            .await?;
            self.close().await;
        }
        Ok(())
    }

    /// Reports a collaborator error, verbatim when structured.
    async fn reply_error(
        &mut self,
        err: Error,
        code: ReplyCode,
        enhanced: EnhancedCode,
    ) -> Result<()> {
        match err {
            Error::Smtp {
                code,
                enhanced,
                message,
            } => self.reply(code, enhanced, message).await,
            other => {
                tracing::warn!(remote = ?self.remote_addr, error = %other, "backend failure");
                self.reply(code, enhanced, other.to_string()).await
            }
        }
    }

    async fn reply(
        &mut self,
        code: ReplyCode,
        status: impl Into<EnhancedStatus>,
        text: impl Into<String>,
    ) -> Result<()> {
        let reply = Reply::new(code, status, text);
        self.write(&reply).await
    }

    async fn write(&mut self, reply: &Reply) -> Result<()> {
        tracing::trace!(remote = ?self.remote_addr, code = %reply.code, "sending reply");
        self.framed.write_reply(reply).await
    }
}

fn no_session() -> Error {
    Error::Protocol("no active session".into())
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
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
    use crate::config::Config;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::task::JoinHandle;

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Default)]
    struct Memory {
        log: Log,
        refuse_anonymous: bool,
    }

    impl Memory {
        fn session(&self) -> MemorySession {
            MemorySession {
                log: Arc::clone(&self.log),
                sender: String::new(),
            }
        }
    }

    struct MemorySession {
        log: Log,
        sender: String,
    }

    impl MemorySession {
        fn record(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    #[async_trait]
    impl Session for MemorySession {
        async fn mail(&mut self, from: &str, options: &MailOptions) -> Result<()> {
            self.sender = from.to_string();
            self.record(format!(
                "mail {from} size={:?} body={:?} auth={:?}",
                options.size, options.body, options.auth
            ));
            Ok(())
        }

        async fn rcpt(&mut self, to: &str) -> Result<()> {
            if to.starts_with("panic@") {
                panic!("backend exploded");
            }
            if to.starts_with("reject@") {
                return Err(Error::smtp(550, EnhancedCode::new(5, 1, 1), "No such user"));
            }
            if to.starts_with("fail@") {
                return Err(Error::other("disk on fire"));
            }
            if to.starts_with("crlf@") {
                return Err(Error::other("bad\r\n250 fake"));
            }
            self.record(format!("rcpt {to}"));
            Ok(())
        }

        async fn data(&mut self, reader: &mut (dyn AsyncRead + Unpin + Send)) -> Result<()> {
            if self.sender.starts_with("skip@") {
                return Ok(());
            }
            let mut body = String::new();
            reader.read_to_string(&mut body).await?;
            if body.contains("REJECT") {
                return Err(Error::smtp(554, EnhancedCode::new(5, 6, 0), "Content rejected"));
            }
            self.record(format!("data {body:?}"));
            Ok(())
        }

        fn reset(&mut self) {
            self.record("reset".to_string());
        }

        fn logout(&mut self) {
            self.record("logout".to_string());
        }
    }

    #[async_trait]
    impl Backend for Memory {
        type Session = MemorySession;

        async fn anonymous_session(&self, _state: &ConnectionState) -> Result<MemorySession> {
            if self.refuse_anonymous {
                return Err(Error::smtp(
                    530,
                    EnhancedCode::new(5, 7, 0),
                    "Authentication required",
                ));
            }
            Ok(self.session())
        }

        async fn login(
            &self,
            _state: &ConnectionState,
            username: &str,
            password: &str,
        ) -> Result<MemorySession> {
            if username == "user" && password == "pass" {
                self.log.lock().unwrap().push(format!("login {username}"));
                Ok(self.session())
            } else {
                Err(Error::smtp(535, EnhancedCode::new(5, 7, 8), "Invalid credentials"))
            }
        }
    }

    struct Client {
        io: BufReader<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, line: &str) {
            self.io
                .write_all(format!("{line}\r\n").as_bytes())
                .await
                .unwrap();
        }

        async fn line(&mut self) -> String {
            let mut line = String::new();
            self.io.read_line(&mut line).await.unwrap();
            line.trim_end_matches("\r\n").to_string()
        }

        /// Reads a complete, possibly multiline, reply.
        async fn reply(&mut self) -> Vec<String> {
            let mut lines = Vec::new();
            loop {
                let line = self.line().await;
                let last = line.as_bytes().get(3) != Some(&b'-');
                lines.push(line);
                if last {
                    return lines;
                }
            }
        }

        async fn cmd(&mut self, line: &str) -> String {
            self.send(line).await;
            self.line().await
        }

        async fn is_closed(&mut self) -> bool {
            let mut line = String::new();
            self.io.read_line(&mut line).await.unwrap_or(0) == 0
        }
    }

    fn start(backend: Memory, config: Config) -> (Client, JoinHandle<Result<()>>) {
        let server = Arc::new(Server::new(backend, config));
        let (client, io) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(server.connection(io, None).serve());
        (
            Client {
                io: BufReader::new(client),
            },
            task,
        )
    }

    async fn greeted(backend: Memory, config: Config) -> (Client, JoinHandle<Result<()>>) {
        let (mut client, task) = start(backend, config);
        client.line().await;
        client.send("EHLO client.example").await;
        client.reply().await;
        (client, task)
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn insecure_auth() -> Config {
        Config::builder("mx.example.com")
            .allow_insecure_auth(true)
            .build()
    }

    #[tokio::test]
    async fn test_greeting() {
        let (mut client, _task) = start(Memory::default(), Config::new("mx.example.com"));
        assert_eq!(client.line().await, "220 mx.example.com ESMTP Service Ready");
    }

    #[tokio::test]
    async fn test_ehlo_capabilities() {
        let config = Config::builder("mx.example.com")
            .allow_insecure_auth(true)
            .max_message_bytes(1024)
            .build();
        let (mut client, _task) = start(Memory::default(), config);
        client.line().await;
        client.send("EHLO client.example").await;
        assert_eq!(
            client.reply().await,
            vec![
                "250-Hello client.example",
                "250-PIPELINING",
                "250-8BITMIME",
                "250-ENHANCEDSTATUSCODES",
                "250-AUTH LOGIN PLAIN",
                "250 SIZE 1024",
            ]
        );
    }

    #[tokio::test]
    async fn test_ehlo_hides_auth_on_plaintext() {
        let (mut client, _task) = start(Memory::default(), Config::new("mx.example.com"));
        client.line().await;
        client.send("EHLO client.example").await;
        assert_eq!(
            client.reply().await,
            vec![
                "250-Hello client.example",
                "250-PIPELINING",
                "250-8BITMIME",
                "250 ENHANCEDSTATUSCODES",
            ]
        );
    }

    #[tokio::test]
    async fn test_helo() {
        let (mut client, _task) = start(Memory::default(), Config::new("mx.example.com"));
        client.line().await;
        assert_eq!(
            client.cmd("HELO").await,
            "501 5.5.2 Domain/address argument required for HELO"
        );
        assert_eq!(client.cmd("HELO client.example").await, "250 2.0.0 Hello client.example");
    }

    #[tokio::test]
    async fn test_full_transaction() {
        let backend = Memory::default();
        let log = Arc::clone(&backend.log);
        let (mut client, task) = greeted(backend, Config::new("mx.example.com")).await;

        assert_eq!(
            client.cmd("MAIL FROM:<alice@example.com>").await,
            "250 2.0.0 Roger, accepting mail from <alice@example.com>"
        );
        assert_eq!(
            client.cmd("RCPT TO:<bob@example.com>").await,
            "250 2.0.0 I'll make sure <bob@example.com> gets this"
        );
        assert_eq!(
            client.cmd("DATA").await,
            "354 2.0.0 Go ahead. End your data with <CR><LF>.<CR><LF>"
        );
        client.send("Subject: hi\r\n\r\n..dot\r\n.").await;
        assert_eq!(client.line().await, "250 2.0.0 OK: queued");
        assert_eq!(client.cmd("QUIT").await, "221 2.0.0 Goodnight and good luck");
        assert!(client.is_closed().await);
        task.await.unwrap().unwrap();

        assert_eq!(
            entries(&log),
            vec![
                "mail alice@example.com size=None body=None auth=None",
                "rcpt bob@example.com",
                "data \"Subject: hi\\r\\n\\r\\n.dot\\r\\n\"",
                "reset",
                "logout",
            ]
        );
    }

    #[tokio::test]
    async fn test_out_of_order_commands() {
        let (mut client, _task) = start(Memory::default(), Config::new("mx.example.com"));
        client.line().await;
        assert_eq!(
            client.cmd("MAIL FROM:<a@example.com>").await,
            "502 5.5.1 Please introduce yourself first."
        );
        client.send("EHLO client.example").await;
        client.reply().await;
        assert_eq!(
            client.cmd("RCPT TO:<b@example.com>").await,
            "502 5.5.1 Missing MAIL FROM command."
        );
        assert_eq!(client.cmd("DATA").await, "502 5.5.1 Missing RCPT TO command.");
        client.cmd("MAIL FROM:<a@example.com>").await;
        assert_eq!(client.cmd("DATA").await, "502 5.5.1 Missing RCPT TO command.");
        assert_eq!(
            client.cmd("MAIL FROM:<a@example.com>").await,
            "503 5.5.1 Nested MAIL command"
        );
    }

    #[tokio::test]
    async fn test_malformed_paths() {
        let (mut client, _task) =
            greeted(Memory::default(), Config::new("mx.example.com")).await;
        assert_eq!(
            client.cmd("MAIL TO:<a@example.com>").await,
            "501 5.5.2 Was expecting MAIL arg syntax of FROM:<address>"
        );
        assert_eq!(
            client.cmd("MAIL FROM:<a@example.com> A=B=C").await,
            "501 5.5.4 Unable to parse MAIL ESMTP parameters"
        );
        client.cmd("MAIL FROM:<a@example.com>").await;
        assert_eq!(
            client.cmd("RCPT TO:<>").await,
            "501 5.5.2 Was expecting RCPT arg syntax of TO:<address>"
        );
        assert_eq!(
            client.cmd("RCPT TO:<b@example.com> X=1=2").await,
            "501 5.5.4 Unable to parse RCPT ESMTP parameters"
        );
    }

    #[tokio::test]
    async fn test_null_sender() {
        let (mut client, _task) =
            greeted(Memory::default(), Config::new("mx.example.com")).await;
        assert_eq!(
            client.cmd("MAIL FROM:<>").await,
            "250 2.0.0 Roger, accepting mail from <>"
        );
    }

    #[tokio::test]
    async fn test_mail_parameters() {
        let backend = Memory::default();
        let log = Arc::clone(&backend.log);
        let config = Config::builder("mx.example.com")
            .max_message_bytes(1024)
            .build();
        let (mut client, _task) = greeted(backend, config).await;

        assert_eq!(
            client.cmd("MAIL FROM:<a@example.com> SIZE=2048").await,
            "552 5.3.4 Max message size exceeded"
        );
        assert_eq!(
            client.cmd("MAIL FROM:<a@example.com> SIZE=big").await,
            "501 5.5.4 Unable to parse SIZE as an integer"
        );
        assert_eq!(
            client.cmd("MAIL FROM:<a@example.com> BODY=9BIT").await,
            "501 5.5.4 Unknown BODY value"
        );
        assert_eq!(
            client.cmd("MAIL FROM:<a@example.com> AUTH=+").await,
            "501 5.5.4 Malformed AUTH parameter value"
        );
        assert_eq!(
            client
                .cmd("MAIL FROM:<a@example.com> SIZE=100 body=8bitmime AUTH=<>")
                .await,
            "250 2.0.0 Roger, accepting mail from <a@example.com>"
        );
        assert_eq!(
            entries(&log),
            vec!["mail a@example.com size=Some(100) body=Some(EightBitMime) auth=Some(\"\")"]
        );
    }

    #[tokio::test]
    async fn test_auth_parameter_is_xtext_decoded() {
        let backend = Memory::default();
        let log = Arc::clone(&backend.log);
        let (mut client, _task) = greeted(backend, Config::new("mx.example.com")).await;
        client
            .cmd("MAIL FROM:<a@example.com> AUTH=joe+2Bsmith@example.com")
            .await;
        assert_eq!(
            entries(&log),
            vec!["mail a@example.com size=None body=None auth=Some(\"joe+smith@example.com\")"]
        );
    }

    #[tokio::test]
    async fn test_max_recipients() {
        let config = Config::builder("mx.example.com").max_recipients(1).build();
        let (mut client, _task) = greeted(Memory::default(), config).await;
        client.cmd("MAIL FROM:<a@example.com>").await;
        client.cmd("RCPT TO:<b@example.com>").await;
        assert_eq!(
            client.cmd("RCPT TO:<c@example.com>").await,
            "552 5.5.3 Maximum limit of 1 recipients reached"
        );
    }

    #[tokio::test]
    async fn test_refused_recipient_gets_no_delivery_reply() {
        let config = Config::builder("mx.example.com")
            .lmtp(true)
            .max_recipients(1)
            .build();
        let (mut client, _task) = start(Memory::default(), config);
        client.line().await;
        client.send("LHLO client.example").await;
        client.reply().await;

        client.cmd("MAIL FROM:<a@example.com>").await;
        client.cmd("RCPT TO:<b@example.com>").await;
        assert_eq!(
            client.cmd("RCPT TO:<c@example.com>").await,
            "552 5.5.3 Maximum limit of 1 recipients reached"
        );
        assert_eq!(
            client.cmd("DATA").await,
            "354 2.0.0 Go ahead. End your data with <CR><LF>.<CR><LF>"
        );
        client.send("Hello\r\n.").await;
        assert_eq!(client.line().await, "250 2.0.0 <b@example.com> OK: queued");
        assert_eq!(
            client.cmd("NOOP").await,
            "250 2.0.0 I have successfully done nothing"
        );
    }

    #[tokio::test]
    async fn test_recipient_rejections() {
        let (mut client, _task) =
            greeted(Memory::default(), Config::new("mx.example.com")).await;
        client.cmd("MAIL FROM:<a@example.com>").await;
        assert_eq!(
            client.cmd("RCPT TO:<reject@example.com>").await,
            "550 5.1.1 No such user"
        );
        assert_eq!(
            client.cmd("RCPT TO:<fail@example.com>").await,
            "451 4.0.0 disk on fire"
        );
        assert_eq!(client.cmd("DATA").await, "502 5.5.1 Missing RCPT TO command.");
    }

    #[tokio::test]
    async fn test_backend_error_text_stays_on_one_line() {
        let (mut client, _task) =
            greeted(Memory::default(), Config::new("mx.example.com")).await;
        client.cmd("MAIL FROM:<a@example.com>").await;
        assert_eq!(
            client.cmd("RCPT TO:<crlf@example.com>").await,
            "451 4.0.0 bad  250 fake"
        );
        assert_eq!(
            client.cmd("NOOP").await,
            "250 2.0.0 I have successfully done nothing"
        );
    }

    #[tokio::test]
    async fn test_too_many_errors_closes() {
        let (mut client, task) = start(Memory::default(), Config::new("mx.example.com"));
        client.line().await;
        assert_eq!(
            client.cmd("FOO").await,
            "500 5.5.2 Syntax error, FOO command unrecognized"
        );
        assert_eq!(client.cmd("EXPN list").await, "502 5.5.1 EXPN command not implemented");
        assert_eq!(client.cmd("B4D").await, "501 5.5.2 Bad command");
        assert_eq!(client.line().await, "500 5.5.2 Too many unrecognized commands");
        assert!(client.is_closed().await);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_error_count_survives_good_commands() {
        let (mut client, task) = start(Memory::default(), Config::new("mx.example.com"));
        client.line().await;
        for _ in 0..2 {
            assert_eq!(
                client.cmd("FOO").await,
                "500 5.5.2 Syntax error, FOO command unrecognized"
            );
            assert_eq!(
                client.cmd("NOOP").await,
                "250 2.0.0 I have successfully done nothing"
            );
        }
        assert_eq!(
            client.cmd("FOO").await,
            "500 5.5.2 Syntax error, FOO command unrecognized"
        );
        assert_eq!(client.line().await, "500 5.5.2 Too many unrecognized commands");
        assert!(client.is_closed().await);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_empty_lines_are_not_counted() {
        let (mut client, _task) = start(Memory::default(), Config::new("mx.example.com"));
        client.line().await;
        for _ in 0..4 {
            assert_eq!(client.cmd("").await, "500 5.5.2 Speak up");
        }
        assert_eq!(client.cmd("NOOP").await, "250 2.0.0 I have successfully done nothing");
    }

    #[tokio::test]
    async fn test_simple_commands() {
        let backend = Memory::default();
        let log = Arc::clone(&backend.log);
        let (mut client, _task) = greeted(backend, Config::new("mx.example.com")).await;
        assert_eq!(
            client.cmd("VRFY bob").await,
            "252 2.5.0 Cannot VRFY user, but will accept message"
        );
        client.cmd("MAIL FROM:<a@example.com>").await;
        assert_eq!(client.cmd("RSET").await, "250 2.0.0 Session reset");
        assert_eq!(
            client.cmd("MAIL FROM:<a@example.com>").await,
            "250 2.0.0 Roger, accepting mail from <a@example.com>"
        );
        assert!(entries(&log).contains(&"reset".to_string()));
    }

    #[tokio::test]
    async fn test_data_with_argument() {
        let (mut client, _task) =
            greeted(Memory::default(), Config::new("mx.example.com")).await;
        assert_eq!(
            client.cmd("DATA now").await,
            "501 5.5.4 DATA command should not have any arguments"
        );
    }

    #[tokio::test]
    async fn test_unread_message_is_drained() {
        let (mut client, _task) =
            greeted(Memory::default(), Config::new("mx.example.com")).await;
        client.cmd("MAIL FROM:<skip@example.com>").await;
        client.cmd("RCPT TO:<b@example.com>").await;
        client.cmd("DATA").await;
        client.send("ignored\r\nNOOP\r\n.").await;
        assert_eq!(client.line().await, "250 2.0.0 OK: queued");
        assert_eq!(client.cmd("NOOP").await, "250 2.0.0 I have successfully done nothing");
    }

    #[tokio::test]
    async fn test_message_too_large() {
        let config = Config::builder("mx.example.com")
            .max_message_bytes(16)
            .build();
        let (mut client, _task) = greeted(Memory::default(), config).await;
        client.cmd("MAIL FROM:<a@example.com>").await;
        client.cmd("RCPT TO:<b@example.com>").await;
        client.cmd("DATA").await;
        client
            .send("0123456789012345678901234567890123456789\r\n.")
            .await;
        assert_eq!(client.line().await, "552 5.3.4 Max message size exceeded");
        assert_eq!(client.cmd("NOOP").await, "250 2.0.0 I have successfully done nothing");
    }

    #[tokio::test]
    async fn test_message_rejected_by_session() {
        let (mut client, _task) =
            greeted(Memory::default(), Config::new("mx.example.com")).await;
        client.cmd("MAIL FROM:<a@example.com>").await;
        client.cmd("RCPT TO:<b@example.com>").await;
        client.cmd("DATA").await;
        client.send("REJECT me\r\n.").await;
        assert_eq!(client.line().await, "554 5.6.0 Content rejected");
        assert_eq!(
            client.cmd("RCPT TO:<b@example.com>").await,
            "502 5.5.1 Missing MAIL FROM command."
        );
    }

    #[tokio::test]
    async fn test_panic_closes_connection() {
        let (mut client, task) =
            greeted(Memory::default(), Config::new("mx.example.com")).await;
        client.cmd("MAIL FROM:<a@example.com>").await;
        assert_eq!(
            client.cmd("RCPT TO:<panic@example.com>").await,
            "421 4.0.0 Internal server error"
        );
        assert!(client.is_closed().await);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_anonymous_session_refused() {
        let backend = Memory {
            refuse_anonymous: true,
            ..Memory::default()
        };
        let (mut client, _task) = greeted(backend, Config::new("mx.example.com")).await;
        assert_eq!(
            client.cmd("MAIL FROM:<a@example.com>").await,
            "530 5.7.0 Authentication required"
        );
    }

    #[tokio::test]
    async fn test_lmtp_transaction() {
        let config = Config::builder("mx.example.com").lmtp(true).build();
        let (mut client, _task) = start(Memory::default(), config);
        assert_eq!(client.line().await, "220 mx.example.com LMTP Service Ready");
        assert_eq!(
            client.cmd("EHLO client.example").await,
            "500 5.5.1 This is a LMTP server, use LHLO"
        );
        client.send("LHLO client.example").await;
        assert_eq!(client.reply().await[0], "250-Hello client.example");

        client.cmd("MAIL FROM:<a@example.com>").await;
        client.cmd("RCPT TO:<bob@example.com>").await;
        client.cmd("RCPT TO:<carol@example.com>").await;
        client.cmd("DATA").await;
        client.send("Hello\r\n.").await;
        assert_eq!(client.line().await, "250 2.0.0 <bob@example.com> OK: queued");
        assert_eq!(client.line().await, "250 2.0.0 <carol@example.com> OK: queued");
    }

    #[tokio::test]
    async fn test_lhlo_on_smtp_server() {
        let (mut client, _task) = start(Memory::default(), Config::new("mx.example.com"));
        client.line().await;
        assert_eq!(
            client.cmd("LHLO client.example").await,
            "500 5.5.1 This is not a LMTP server"
        );
    }

    #[tokio::test]
    async fn test_auth_plain_initial_response() {
        let backend = Memory {
            refuse_anonymous: true,
            ..Memory::default()
        };
        let log = Arc::clone(&backend.log);
        let (mut client, _task) = greeted(backend, insecure_auth()).await;
        assert_eq!(
            client.cmd("AUTH PLAIN AHVzZXIAcGFzcw==").await,
            "235 2.0.0 Authentication succeeded"
        );
        assert_eq!(
            client.cmd("MAIL FROM:<user@example.com>").await,
            "250 2.0.0 Roger, accepting mail from <user@example.com>"
        );
        assert_eq!(entries(&log)[0], "login user");
    }

    #[tokio::test]
    async fn test_second_auth_is_refused() {
        let backend = Memory {
            refuse_anonymous: true,
            ..Memory::default()
        };
        let log = Arc::clone(&backend.log);
        let (mut client, _task) = greeted(backend, insecure_auth()).await;
        assert_eq!(
            client.cmd("AUTH PLAIN AHVzZXIAcGFzcw==").await,
            "235 2.0.0 Authentication succeeded"
        );
        assert_eq!(
            client.cmd("AUTH PLAIN AHVzZXIAd3Jvbmc=").await,
            "503 5.5.1 Already authenticated"
        );
        assert_eq!(
            client.cmd("MAIL FROM:<user@example.com>").await,
            "250 2.0.0 Roger, accepting mail from <user@example.com>"
        );
        assert!(!entries(&log).contains(&"logout".to_string()));
    }

    #[tokio::test]
    async fn test_auth_plain_with_challenge() {
        let (mut client, _task) = greeted(Memory::default(), insecure_auth()).await;
        assert_eq!(client.cmd("AUTH PLAIN").await, "334 ");
        assert_eq!(
            client.cmd("AHVzZXIAcGFzcw==").await,
            "235 2.0.0 Authentication succeeded"
        );
    }

    #[tokio::test]
    async fn test_auth_login_wrong_password() {
        let (mut client, _task) = greeted(Memory::default(), insecure_auth()).await;
        assert_eq!(client.cmd("AUTH LOGIN").await, "334 VXNlcm5hbWU6");
        assert_eq!(client.cmd("dXNlcg==").await, "334 UGFzc3dvcmQ6");
        assert_eq!(client.cmd("d3Jvbmc=").await, "535 5.7.8 Invalid credentials");
    }

    #[tokio::test]
    async fn test_auth_cancelled() {
        let (mut client, _task) = greeted(Memory::default(), insecure_auth()).await;
        client.cmd("AUTH LOGIN").await;
        assert_eq!(client.cmd("*").await, "501 5.0.0 Negotiation cancelled");
    }

    #[tokio::test]
    async fn test_auth_argument_errors() {
        let (mut client, _task) = greeted(Memory::default(), insecure_auth()).await;
        assert_eq!(client.cmd("AUTH").await, "502 5.5.4 Missing parameter");
        assert_eq!(
            client.cmd("AUTH CRAM-MD5").await,
            "504 5.7.4 Unsupported authentication mechanism"
        );
        assert_eq!(client.cmd("AUTH PLAIN !!!").await, "454 4.7.0 Invalid base64 data");
        client.cmd("MAIL FROM:<a@example.com>").await;
        assert_eq!(
            client.cmd("AUTH PLAIN AHVzZXIAcGFzcw==").await,
            "503 5.5.1 AUTH not permitted during a mail transaction"
        );
    }

    #[tokio::test]
    async fn test_auth_requires_greeting() {
        let (mut client, _task) = start(Memory::default(), insecure_auth());
        client.line().await;
        assert_eq!(
            client.cmd("AUTH PLAIN").await,
            "502 5.5.1 Please introduce yourself first."
        );
    }

    #[tokio::test]
    async fn test_auth_requires_encryption() {
        let (mut client, _task) =
            greeted(Memory::default(), Config::new("mx.example.com")).await;
        assert_eq!(
            client.cmd("AUTH PLAIN").await,
            "538 5.7.11 Encryption required for requested authentication mechanism"
        );
    }

    #[tokio::test]
    async fn test_auth_disabled_is_unrecognized() {
        let config = Config::builder("mx.example.com")
            .allow_insecure_auth(true)
            .auth_disabled(true)
            .build();
        let (mut client, _task) = greeted(Memory::default(), config).await;
        assert_eq!(
            client.cmd("AUTH PLAIN").await,
            "500 5.5.2 Syntax error, AUTH command unrecognized"
        );
    }

    #[tokio::test]
    async fn test_custom_mechanism() {
        struct Anonymous<B: Backend> {
            ctx: AuthContext<B>,
        }

        #[async_trait]
        impl<B: Backend> crate::sasl::Mechanism for Anonymous<B> {
            async fn step(&mut self, _response: Option<&[u8]>) -> Result<Step> {
                let session = self.ctx.backend.anonymous_session(&self.ctx.state).await?;
                self.ctx.session.install(session).await;
                Ok(Step::Done)
            }
        }

        let mut server = Server::new(Memory::default(), insecure_auth());
        server.clear_mechanisms();
        server.register_mechanism("anonymous", |ctx| Box::new(Anonymous { ctx }));
        let server = Arc::new(server);

        let (client, io) = tokio::io::duplex(64 * 1024);
        let _task = tokio::spawn(server.connection(io, None).serve());
        let mut client = Client {
            io: BufReader::new(client),
        };
        client.line().await;
        client.send("EHLO client.example").await;
        assert!(client.reply().await.contains(&"250 AUTH ANONYMOUS".to_string()));
        assert_eq!(
            client.cmd("AUTH ANONYMOUS").await,
            "235 2.0.0 Authentication succeeded"
        );
        assert_eq!(
            client.cmd("AUTH PLAIN").await,
            "504 5.7.4 Unsupported authentication mechanism"
        );
    }

    #[tokio::test]
    async fn test_starttls_not_configured() {
        let (mut client, _task) =
            greeted(Memory::default(), Config::new("mx.example.com")).await;
        assert_eq!(client.cmd("STARTTLS").await, "502 5.5.1 TLS not supported");
    }

    #[tokio::test]
    async fn test_line_too_long_closes() {
        let config = Config::builder("mx.example.com")
            .max_line_length(16)
            .build();
        let (mut client, task) = start(Memory::default(), config);
        client.line().await;
        assert_eq!(
            client.cmd(&format!("NOOP {}", "x".repeat(40))).await,
            "500 5.4.0 Too long line, closing connection"
        );
        assert!(client.is_closed().await);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let config = Config::builder("mx.example.com")
            .read_timeout(Duration::from_secs(30))
            .build();
        let (mut client, task) = start(Memory::default(), config);
        client.line().await;
        assert_eq!(client.line().await, "221 2.4.2 Idle timeout, bye bye");
        assert!(client.is_closed().await);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_mid_line_is_an_error() {
        let (mut client, task) = start(Memory::default(), Config::new("mx.example.com"));
        client.line().await;
        client.io.write_all(b"NOO").await.unwrap();
        client.io.shutdown().await.unwrap();
        assert_eq!(client.line().await, "221 2.4.0 Connection error, sorry");
        assert!(matches!(task.await.unwrap(), Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_reject() {
        let server = Arc::new(Server::new(Memory::default(), Config::new("mx.example.com")));
        let (client, io) = tokio::io::duplex(1024);
        let task = tokio::spawn(server.connection(io, None).reject());
        let mut client = Client {
            io: BufReader::new(client),
        };
        assert_eq!(client.line().await, "421 4.4.5 Too busy. Try again later.");
        assert!(client.is_closed().await);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_session_slot_is_free_during_data() {
        let server = Arc::new(Server::new(Memory::default(), Config::new("mx.example.com")));
        let (client, io) = tokio::io::duplex(64 * 1024);
        let conn = server.connection(io, None);
        let slot = conn.session();
        let _task = tokio::spawn(conn.serve());
        let mut client = Client {
            io: BufReader::new(client),
        };
        client.line().await;
        client.send("EHLO client.example").await;
        client.reply().await;
        client.cmd("MAIL FROM:<a@example.com>").await;
        client.cmd("RCPT TO:<b@example.com>").await;
        assert_eq!(
            client.cmd("DATA").await,
            "354 2.0.0 Go ahead. End your data with <CR><LF>.<CR><LF>"
        );
        client.send("Subject: still uploading").await;

        assert!(slot.is_active());
        let guard = tokio::time::timeout(Duration::from_secs(2), slot.lock()).await;
        assert!(guard.is_ok());
        drop(guard);

        client.send(".").await;
        assert_eq!(client.line().await, "250 2.0.0 OK: queued");
        assert!(slot.is_active());
        assert!(slot.lock().await.is_some());
    }

    #[tokio::test]
    async fn test_connection_accessors() {
        let server = Arc::new(Server::new(Memory::default(), Config::new("mx.example.com")));
        let (_client, io) = tokio::io::duplex(1024);
        let addr: SocketAddr = "192.0.2.1:2525".parse().unwrap();
        let conn = server.connection(io, Some(addr));

        assert_eq!(conn.hostname(), "");
        assert!(conn.recipients().is_empty());
        assert!(!conn.is_closed());
        assert!(!conn.is_tls());
        assert!(!conn.session().is_active());

        let state = conn.state();
        assert_eq!(state.remote_addr, Some(addr));
        assert!(state.tls.is_none());
    }
}

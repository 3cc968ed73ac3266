//! # maildrop-smtp
//!
//! Server-side SMTP (RFC 5321) and LMTP (RFC 2033) connection engine.
//!
//! The crate speaks the protocol on accepted connections and hands the mail
//! envelope to an application-supplied [`Backend`]. Listening sockets and
//! message storage are left to the application.
//!
//! ## Features
//!
//! - **Envelope state machine**: greeting, `MAIL`, `RCPT`, `DATA` ordering with
//!   RFC 3463 enhanced status codes on every reply
//! - **LMTP**: `LHLO` greeting and one reply per recipient after `DATA`
//! - **TLS**: in-place STARTTLS upgrade through `tokio-rustls`
//! - **Authentication**: SASL PLAIN and LOGIN, plus custom mechanisms
//! - **Extensions**: PIPELINING, 8BITMIME, ENHANCEDSTATUSCODES, SIZE, AUTH
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use maildrop_smtp::{Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> maildrop_smtp::Result<()> {
//!     let config = Config::builder("mx.example.com")
//!         .max_message_bytes(10 * 1024 * 1024)
//!         .max_recipients(50)
//!         .build();
//!     let server = Arc::new(Server::new(MyBackend::default(), config));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:2525").await?;
//!     loop {
//!         let (stream, addr) = listener.accept().await?;
//!         let server = Arc::clone(&server);
//!         tokio::spawn(async move {
//!             if let Err(e) = server.serve_connection(stream, Some(addr)).await {
//!                 tracing::warn!(?e, "connection ended with an error");
//!             }
//!         });
//!     }
//! }
//! ```
//!
//! ## Modules
//!
//! - [`backend`]: Traits implemented by the application
//! - [`command`]: Command line parsing
//! - [`config`]: Server configuration
//! - [`connection`]: Transport, framing and the per-connection engine
//! - [`parser`]: Command argument parsers
//! - [`sasl`]: SASL mechanisms
//! - [`types`]: Replies, status codes and extensions

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod backend;
pub mod command;
pub mod config;
pub mod connection;
mod error;
pub mod parser;
pub mod sasl;
pub mod server;
pub mod types;

pub use backend::{Backend, ConnectionState, MailOptions, Session, SessionSlot, TlsInfo};
pub use command::Command;
pub use config::{Config, ConfigBuilder};
pub use connection::{Conn, DataReader, Io, Mirror};
pub use error::{Error, Result};
pub use sasl::{AuthContext, Mechanism, Mechanisms, Step};
pub use server::Server;
pub use types::{Body, EnhancedCode, EnhancedStatus, Extension, Reply, ReplyCode};

//! Shared helpers for the integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use maildrop_smtp::{Backend, ConnectionState, EnhancedCode, Error, MailOptions, Result, Session};

/// A delivered message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub from: String,
    pub to: Vec<String>,
    pub body: Vec<u8>,
    pub user: Option<String>,
    pub server_name: Option<String>,
}

/// Backend that keeps delivered messages in memory.
#[derive(Debug, Default, Clone)]
pub struct Mailbox {
    pub deliveries: Arc<Mutex<Vec<Delivery>>>,
}

impl Mailbox {
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    fn session(&self, state: &ConnectionState, user: Option<&str>) -> Inbox {
        Inbox {
            deliveries: Arc::clone(&self.deliveries),
            current: Delivery {
                user: user.map(str::to_string),
                server_name: state.tls.as_ref().and_then(|tls| tls.server_name.clone()),
                ..Delivery::default()
            },
        }
    }
}

pub struct Inbox {
    deliveries: Arc<Mutex<Vec<Delivery>>>,
    current: Delivery,
}

#[async_trait]
impl Session for Inbox {
    async fn mail(&mut self, from: &str, _options: &MailOptions) -> Result<()> {
        self.current.from = from.to_string();
        Ok(())
    }

    async fn rcpt(&mut self, to: &str) -> Result<()> {
        self.current.to.push(to.to_string());
        Ok(())
    }

    async fn data(&mut self, reader: &mut (dyn AsyncRead + Unpin + Send)) -> Result<()> {
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await?;
        let mut delivery = self.current.clone();
        delivery.body = body;
        self.deliveries.lock().unwrap().push(delivery);
        Ok(())
    }

    fn reset(&mut self) {
        self.current.from.clear();
        self.current.to.clear();
    }

    fn logout(&mut self) {}
}

#[async_trait]
impl Backend for Mailbox {
    type Session = Inbox;

    async fn anonymous_session(&self, state: &ConnectionState) -> Result<Inbox> {
        Ok(self.session(state, None))
    }

    async fn login(&self, state: &ConnectionState, username: &str, password: &str) -> Result<Inbox> {
        if username == "user" && password == "pass" {
            Ok(self.session(state, Some(username)))
        } else {
            Err(Error::smtp(535, EnhancedCode::new(5, 7, 8), "Invalid credentials"))
        }
    }
}

/// Line-oriented test client.
pub struct Peer<S> {
    pub io: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Peer<S> {
    pub fn new(io: S) -> Self {
        Self {
            io: BufReader::new(io),
        }
    }

    pub async fn send(&mut self, text: &str) {
        self.io
            .write_all(format!("{text}\r\n").as_bytes())
            .await
            .unwrap();
        self.io.flush().await.unwrap();
    }

    pub async fn line(&mut self) -> String {
        let mut line = String::new();
        self.io.read_line(&mut line).await.unwrap();
        line.trim_end_matches("\r\n").to_string()
    }

    pub async fn reply(&mut self) -> Vec<String> {
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

    pub async fn cmd(&mut self, text: &str) -> String {
        self.send(text).await;
        self.line().await
    }

    pub async fn is_closed(&mut self) -> bool {
        let mut rest = Vec::new();
        self.io.read_to_end(&mut rest).await.map_or(true, |_| rest.is_empty())
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

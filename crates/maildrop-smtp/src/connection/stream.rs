//! Server-side transport that can be upgraded to TLS in place.

use std::io::{self, Write};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

use crate::backend::TlsInfo;

/// Byte stream accepted by the engine.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Shared writer receiving a copy of the conversation.
pub type Mirror = Arc<Mutex<dyn Write + Send>>;

enum Stream {
    Plain(Box<dyn Io>),
    Tls(Box<TlsStream<Box<dyn Io>>>),
    /// Placeholder while the plain stream is handed to the TLS acceptor.
    Detached,
}

/// Connection transport (plain or TLS).
pub struct Transport {
    stream: Stream,
    mirror: Option<Mirror>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.stream {
            Stream::Plain(_) => "plain",
            Stream::Tls(_) => "tls",
            Stream::Detached => "detached",
        };
        f.debug_struct("Transport")
            .field("stream", &kind)
            .field("mirror", &self.mirror.is_some())
            .finish()
    }
}

impl Transport {
    /// Wraps a plaintext stream.
    #[must_use]
    pub fn new(io: impl Io + 'static, mirror: Option<Mirror>) -> Self {
        Self {
            stream: Stream::Plain(Box::new(io)),
            mirror,
        }
    }

    pub(crate) const fn detached() -> Self {
        Self {
            stream: Stream::Detached,
            mirror: None,
        }
    }

    /// Returns true once the transport is secured.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.stream, Stream::Tls(_))
    }

    /// Returns the negotiated TLS parameters, if secured.
    #[must_use]
    pub fn tls_info(&self) -> Option<TlsInfo> {
        let Stream::Tls(tls) = &self.stream else {
            return None;
        };
        let (_, conn) = tls.get_ref();
        Some(TlsInfo {
            protocol_version: conn.protocol_version(),
            cipher_suite: conn.negotiated_cipher_suite().map(|suite| suite.suite()),
            server_name: conn.server_name().map(str::to_string),
        })
    }

    /// Runs a server-side TLS handshake over the plaintext stream.
    ///
    /// On failure the plaintext transport is handed back alongside the error
    /// so a last reply can still be written.
    ///
    /// # Errors
    ///
    /// Returns the handshake error, or an error if the transport is not
    /// plaintext.
    pub async fn upgrade(self, acceptor: &TlsAcceptor) -> Result<Self, (io::Error, Self)> {
        let Self { stream, mirror } = self;
        match stream {
            Stream::Plain(io) => match acceptor.accept(io).into_fallible().await {
                Ok(tls) => Ok(Self {
                    stream: Stream::Tls(Box::new(tls)),
                    mirror,
                }),
                Err((err, io)) => Err((
                    err,
                    Self {
                        stream: Stream::Plain(io),
                        mirror,
                    },
                )),
            },
            other => Err((
                io::Error::new(io::ErrorKind::InvalidInput, "transport is not plaintext"),
                Self {
                    stream: other,
                    mirror,
                },
            )),
        }
    }

    fn record(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if let Some(mirror) = &self.mirror {
            if let Ok(mut writer) = mirror.lock() {
                if let Err(e) = writer.write_all(bytes) {
                    tracing::debug!(?e, "mirror write failed");
                }
            }
        }
    }
}

fn detached_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport detached")
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = match &mut this.stream {
            Stream::Plain(io) => Pin::new(io).poll_read(cx, buf),
            Stream::Tls(tls) => Pin::new(tls).poll_read(cx, buf),
            Stream::Detached => Poll::Ready(Err(detached_error())),
        };
        if let Poll::Ready(Ok(())) = result {
            this.record(&buf.filled()[before..]);
        }
        result
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = match &mut this.stream {
            Stream::Plain(io) => Pin::new(io).poll_write(cx, buf),
            Stream::Tls(tls) => Pin::new(tls).poll_write(cx, buf),
            Stream::Detached => Poll::Ready(Err(detached_error())),
        };
        if let Poll::Ready(Ok(written)) = result {
            this.record(&buf[..written]);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            Stream::Plain(io) => Pin::new(io).poll_flush(cx),
            Stream::Tls(tls) => Pin::new(tls).poll_flush(cx),
            Stream::Detached => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            Stream::Plain(io) => Pin::new(io).poll_shutdown(cx),
            Stream::Tls(tls) => Pin::new(tls).poll_shutdown(cx),
            Stream::Detached => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_plain_passthrough() {
        let mock = Builder::new().read(b"EHLO x\r\n").write(b"250 ok\r\n").build();
        let mut transport = Transport::new(mock, None);
        assert!(!transport.is_tls());
        assert!(transport.tls_info().is_none());

        let mut buf = [0u8; 8];
        transport.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"EHLO x\r\n");
        transport.write_all(b"250 ok\r\n").await.unwrap();
    }

    #[tokio::test]
    async fn test_mirror_records_both_directions() {
        let sink = Arc::new(Mutex::new(Vec::<u8>::new()));
        let mirror: Mirror = sink.clone();
        let mock = Builder::new().read(b"NOOP\r\n").write(b"250 ok\r\n").build();
        let mut transport = Transport::new(mock, Some(mirror));

        let mut buf = [0u8; 6];
        transport.read_exact(&mut buf).await.unwrap();
        transport.write_all(b"250 ok\r\n").await.unwrap();

        assert_eq!(&*sink.lock().unwrap(), b"NOOP\r\n250 ok\r\n");
    }

    #[tokio::test]
    async fn test_detached_refuses_io() {
        let mut transport = Transport::detached();
        let mut buf = [0u8; 1];
        let err = transport.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}

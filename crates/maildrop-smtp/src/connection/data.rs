//! Message content reader for the DATA command.
//!
//! [`DataReader`] turns the dot-stuffed byte stream that follows `354` into
//! the message as sent. One leading `.` is removed from every line that
//! starts with one, CRLF line endings are kept, and the stream ends at the
//! `.` line. The reader never consumes past that line, so the next command
//! can be read from the same buffer.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncRead, ReadBuf};
use tokio::time::Sleep;

/// Position of the reader within the current line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// At the start of a line.
    BeginLine,
    /// After a leading dot.
    Dot,
    /// After a leading dot and CR.
    DotCr,
    /// After a CR.
    Cr,
    /// Inside a line.
    Data,
    /// Terminator seen.
    Eof,
}

/// What one input byte does.
struct Transition {
    next: State,
    emit: Option<u8>,
    consume: bool,
}

impl State {
    const fn step(self, byte: u8) -> Transition {
        let (next, emit, consume) = match (self, byte) {
            (Self::BeginLine, b'.') => (Self::Dot, None, true),
            (Self::BeginLine | Self::Data, b'\r') => (Self::Cr, Some(b'\r'), true),
            (Self::Dot, b'\r') => (Self::DotCr, None, true),
            (Self::Dot | Self::DotCr, b'\n') => (Self::Eof, None, true),
            // The CR after the dot was data after all; emit it and re-read
            // the current byte as the start of the line body.
            (Self::DotCr, _) => (Self::Data, Some(b'\r'), false),
            (Self::Cr | Self::Data, b'\n') => (Self::BeginLine, Some(b'\n'), true),
            (Self::Eof, _) => (Self::Eof, None, false),
            (_, byte) => (Self::Data, Some(byte), true),
        };
        Transition {
            next,
            emit,
            consume,
        }
    }
}

/// Reads one dot-terminated message from a buffered stream.
pub struct DataReader<'a, R> {
    inner: &'a mut R,
    state: State,
    remaining: Option<usize>,
    limit_exceeded: bool,
    timeout: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl<R> std::fmt::Debug for DataReader<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataReader")
            .field("state", &self.state)
            .field("remaining", &self.remaining)
            .field("limit_exceeded", &self.limit_exceeded)
            .finish_non_exhaustive()
    }
}

impl<'a, R: AsyncBufRead + Unpin> DataReader<'a, R> {
    /// Creates a reader producing at most `max_bytes` bytes, waiting at most
    /// `timeout` for each chunk from the peer.
    pub const fn new(inner: &'a mut R, max_bytes: Option<usize>, timeout: Option<Duration>) -> Self {
        Self {
            inner,
            state: State::BeginLine,
            remaining: max_bytes,
            limit_exceeded: false,
            timeout,
            deadline: None,
        }
    }

    /// Returns true once the size limit has been hit.
    #[must_use]
    pub const fn limit_exceeded(&self) -> bool {
        self.limit_exceeded
    }

    /// Returns true once the terminator line has been consumed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == State::Eof
    }

    /// Removes the size limit so the rest of the message can be drained.
    pub const fn lift_limit(&mut self) {
        self.remaining = None;
    }

    /// Discards the rest of the message, up to and including the terminator.
    ///
    /// Returns the number of bytes discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer disconnects or the read deadline expires
    /// before the terminator.
    pub async fn drain(&mut self) -> io::Result<u64> {
        self.lift_limit();
        tokio::io::copy(self, &mut tokio::io::sink()).await
    }
}

fn poll_deadline(
    deadline: &mut Option<Pin<Box<Sleep>>>,
    timeout: Option<Duration>,
    cx: &mut Context<'_>,
) -> Poll<io::Result<()>> {
    let Some(limit) = timeout else {
        return Poll::Pending;
    };
    let sleep = deadline.get_or_insert_with(|| Box::pin(tokio::time::sleep(limit)));
    match sleep.as_mut().poll(cx) {
        Poll::Ready(()) => Poll::Ready(Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "timed out reading message data",
        ))),
        Poll::Pending => Poll::Pending,
    }
}

impl<R: AsyncBufRead + Unpin> AsyncRead for DataReader<'_, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.state == State::Eof || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            let available = match Pin::new(&mut *this.inner).poll_fill_buf(cx) {
                Poll::Ready(Ok(available)) => available,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return poll_deadline(&mut this.deadline, this.timeout, cx),
            };
            if available.is_empty() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before end of message data",
                )));
            }
            this.deadline = None;

            let mut consumed = 0;
            let mut produced = false;
            let mut overflow = false;
            while consumed < available.len() && buf.remaining() > 0 && this.state != State::Eof {
                let transition = this.state.step(available[consumed]);
                if let Some(byte) = transition.emit {
                    match this.remaining {
                        Some(0) => {
                            overflow = true;
                            break;
                        }
                        Some(n) => this.remaining = Some(n - 1),
                        None => {}
                    }
                    buf.put_slice(&[byte]);
                    produced = true;
                }
                this.state = transition.next;
                if transition.consume {
                    consumed += 1;
                }
            }
            Pin::new(&mut *this.inner).consume(consumed);

            if overflow {
                this.limit_exceeded = true;
                if !produced {
                    return Poll::Ready(Err(io::Error::other("maximum message size exceeded")));
                }
                return Poll::Ready(Ok(()));
            }
            if produced || this.state == State::Eof {
                return Poll::Ready(Ok(()));
            }
        }
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
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
    use tokio_test::io::Builder;

    async fn read_message(input: &[u8], max: Option<usize>) -> (io::Result<Vec<u8>>, String) {
        let mock = Builder::new().read(input).build();
        let mut reader = BufReader::new(mock);
        let mut message = Vec::new();
        let result = {
            let mut data = DataReader::new(&mut reader, max, None);
            let result = data.read_to_end(&mut message).await;
            data.drain().await.unwrap();
            result
        };
        let mut rest = String::new();
        reader.read_line(&mut rest).await.unwrap();
        (result.map(|_| message), rest)
    }

    #[tokio::test]
    async fn test_plain_message() {
        let (message, rest) = read_message(b"Hi\r\n.\r\nQUIT\r\n", None).await;
        assert_eq!(message.unwrap(), b"Hi\r\n");
        assert_eq!(rest, "QUIT\r\n");
    }

    #[tokio::test]
    async fn test_dot_unstuffing() {
        let (message, _) = read_message(b"..x\r\n...\r\n.\r\n", None).await;
        assert_eq!(message.unwrap(), b".x\r\n..\r\n");
    }

    #[tokio::test]
    async fn test_empty_message() {
        let (message, rest) = read_message(b".\r\nNOOP\r\n", None).await;
        assert_eq!(message.unwrap(), b"");
        assert_eq!(rest, "NOOP\r\n");
    }

    #[tokio::test]
    async fn test_dot_cr_without_lf_is_data() {
        let (message, _) = read_message(b".\rx\r\n.\r\n", None).await;
        assert_eq!(message.unwrap(), b"\rx\r\n");
    }

    #[tokio::test]
    async fn test_dot_inside_line_is_kept() {
        let (message, _) = read_message(b"a.b\r\n. \r\n.\r\n", None).await;
        assert_eq!(message.unwrap(), b"a.b\r\n \r\n");
    }

    #[tokio::test]
    async fn test_split_reads() {
        let mock = Builder::new()
            .read(b"line one\r")
            .read(b"\n.")
            .read(b".two\r\n.")
            .read(b"\r\nNOOP\r\n")
            .build();
        let mut reader = BufReader::new(mock);
        let mut message = Vec::new();
        DataReader::new(&mut reader, None, None)
            .read_to_end(&mut message)
            .await
            .unwrap();
        assert_eq!(message, b"line one\r\n.two\r\n");

        let mut rest = String::new();
        reader.read_line(&mut rest).await.unwrap();
        assert_eq!(rest, "NOOP\r\n");
    }

    #[tokio::test]
    async fn test_exact_limit_passes() {
        let (message, _) = read_message(b"1234\r\n.\r\n", Some(6)).await;
        assert_eq!(message.unwrap(), b"1234\r\n");
    }

    #[tokio::test]
    async fn test_limit_exceeded() {
        let mock = Builder::new().read(b"12345\r\n.\r\nRSET\r\n").build();
        let mut reader = BufReader::new(mock);
        let mut message = Vec::new();
        {
            let mut data = DataReader::new(&mut reader, Some(6), None);
            let err = data.read_to_end(&mut message).await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::Other);
            assert!(data.limit_exceeded());
            assert!(!data.is_done());
            data.drain().await.unwrap();
            assert!(data.is_done());
        }
        assert_eq!(message, b"12345\r");

        let mut rest = String::new();
        reader.read_line(&mut rest).await.unwrap();
        assert_eq!(rest, "RSET\r\n");
    }

    #[tokio::test]
    async fn test_disconnect_before_terminator() {
        let mock = Builder::new().read(b"partial\r\n").build();
        let mut reader = BufReader::new(mock);
        let mut message = Vec::new();
        let err = DataReader::new(&mut reader, None, None)
            .read_to_end(&mut message)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(message, b"partial\r\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline() {
        let mock = Builder::new()
            .read(b"slow\r\n")
            .wait(Duration::from_secs(120))
            .build();
        let mut reader = BufReader::new(mock);
        let mut message = Vec::new();
        let err = DataReader::new(&mut reader, None, Some(Duration::from_secs(60)))
            .read_to_end(&mut message)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(message, b"slow\r\n");
    }
}

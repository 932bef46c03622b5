//! The single-byte pushback wrapper spec section 9 calls for: a small
//! buffer in front of the socket, not a bespoke `Reader` hierarchy. Used
//! twice per connection: once to classify `0x16` vs plain HTTP, and
//! again, via [`PeekableStream::unread`], to hand a CONNECT tunnel's
//! leftover bytes to the TLS acceptor that takes over the same socket.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub struct PeekableStream<S> {
    inner: S,
    pending: Vec<u8>,
    pos: usize,
}

impl<S> PeekableStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            pos: 0,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> PeekableStream<S> {
    /// Read exactly one byte ahead without consuming it from the stream
    /// as seen by later `poll_read` calls. Returns `None` on EOF.
    pub async fn peek_first_byte(&mut self) -> std::io::Result<Option<u8>> {
        use tokio::io::AsyncReadExt;
        if self.pos < self.pending.len() {
            return Ok(Some(self.pending[self.pos]));
        }
        let mut byte = [0u8; 1];
        let n = self.inner.read(&mut byte).await?;
        if n == 0 {
            return Ok(None);
        }
        self.pending.push(byte[0]);
        Ok(Some(byte[0]))
    }

    /// Push bytes already consumed from the caller's point of view back
    /// in front of whatever is still pending, so a later reader sees them
    /// first. Used when a CONNECT handshake's header reader over-reads
    /// past the blank line into what is actually the start of the TLS
    /// ClientHello.
    pub fn unread(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        let remaining = self.pending.split_off(self.pos);
        self.pending = bytes;
        self.pending.extend(remaining);
        self.pos = 0;
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekableStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pos < self.pending.len() {
            let available = &self.pending[self.pos..];
            let n = available.len().min(buf.remaining());
            buf.put_slice(&available[..n]);
            self.pos += n;
            if self.pos == self.pending.len() {
                self.pending.clear();
                self.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekableStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn peeked_byte_is_replayed_to_the_next_reader() {
        let data = b"\x16hello".to_vec();
        let mut stream = PeekableStream::new(std::io::Cursor::new(data));

        let first = stream.peek_first_byte().await.unwrap();
        assert_eq!(first, Some(0x16));

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"\x16hello");
    }

    #[tokio::test]
    async fn unread_bytes_are_replayed_before_the_inner_stream() {
        let mut stream = PeekableStream::new(std::io::Cursor::new(b"tail".to_vec()));
        stream.unread(b"head-".to_vec());

        let mut all = Vec::new();
        stream.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"head-tail");
    }
}

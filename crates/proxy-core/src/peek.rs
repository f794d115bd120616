//! `PeekReader`: a buffered-peek connection wrapper (spec §9 Design Notes).
//!
//! Sniffing SNI/Host requires looking at the client's first bytes before
//! deciding where the flow goes, but whoever ends up handling the connection
//! (a raw relay, or a TLS acceptor for MITM) must see those same bytes as
//! part of its own first read. `PeekReader` buffers whatever it reads during
//! the sniff and replays it before falling through to the wrapped stream, so
//! it can be handed to anything that expects a plain `AsyncRead + AsyncWrite`.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub struct PeekReader<S> {
    inner: S,
    primed: Vec<u8>,
    pos: usize,
}

impl<S: AsyncRead + Unpin> PeekReader<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            primed: Vec::new(),
            pos: 0,
        }
    }

    /// Reads up to `max` bytes from the underlying stream and stages them to
    /// be replayed by subsequent `poll_read` calls. Returns the bytes read
    /// (which may be fewer than `max` if the peer has not yet sent more, or
    /// empty on EOF). Bounded by `deadline`; on timeout returns whatever was
    /// read so far (possibly nothing), matching spec §4.4's "skip sniff and
    /// use IP identifier" fallback.
    pub async fn peek(&mut self, max: usize, deadline: std::time::Duration) -> io::Result<&[u8]> {
        debug_assert_eq!(self.pos, 0, "peek must be called before any read");
        let mut buf = vec![0u8; max];
        let read_fut = async {
            let mut total = 0;
            // A single read is enough for the sniff cases we care about
            // (ClientHello / request line), but loop in case the first
            // read returns a short slice while more is already buffered
            // in the kernel socket.
            loop {
                let n = tokio::io::AsyncReadExt::read(&mut self.inner, &mut buf[total..]).await?;
                if n == 0 {
                    break;
                }
                total += n;
                if total >= max {
                    break;
                }
            }
            Ok::<usize, io::Error>(total)
        };
        let total = match tokio::time::timeout(deadline, read_fut).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            Err(_) => 0,
        };
        buf.truncate(total);
        self.primed = buf;
        Ok(&self.primed[..])
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekReader<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.pos < self.primed.len() {
            let remaining = &self.primed[self.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekReader<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

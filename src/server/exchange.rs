//! Per-request ownership of the client connection.
//!
//! An [`Exchange`] holds the raw client stream together with the bytes that
//! were read while parsing the request head.  The stream leaves the exchange
//! exactly once: either through [`Exchange::hijack`], which hands the raw
//! duplex stream (positioned right after the head) to the proxy engine, or
//! through [`Exchange::into_replay`], which rewinds to the start of the
//! request so a regular HTTP server can parse it again.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::head::RequestHead;
use crate::proxy::ProxyError;

/// Canned response for every failure surfaced to the client.
pub const NOT_FOUND_RESPONSE: &[u8] = b"HTTP/1.1 404 Not Found\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Length: 10\r\n\
Connection: close\r\n\
\r\n\
Not found\n";

pub const BAD_REQUEST_RESPONSE: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Length: 12\r\n\
Connection: close\r\n\
\r\n\
Bad request\n";

// ---------------------------------------------------------------------------
// Rewind
// ---------------------------------------------------------------------------

/// A stream that yields `prefix` before reading from `inner`.  Writes go
/// straight to `inner`.
pub struct Rewind<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(inner: S, prefix: Bytes) -> Self {
        Self { prefix, inner }
    }

    /// Bytes still waiting to be replayed.
    pub fn pending(&self) -> &[u8] {
        &self.prefix
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

pub struct Exchange<S> {
    head: RequestHead,
    conn: Option<(S, BytesMut, usize)>,
}

impl<S> Exchange<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// `buf` holds everything read so far; its first `head_len` bytes are
    /// the request head.
    pub fn new(stream: S, head: RequestHead, buf: BytesMut, head_len: usize) -> Self {
        Self {
            head,
            conn: Some((stream, buf, head_len)),
        }
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    /// Whether the connection has been handed out.
    #[cfg(test)]
    pub fn is_detached(&self) -> bool {
        self.conn.is_none()
    }

    /// Detach the raw client stream.  Reads continue right after the request
    /// head (already-buffered body bytes first); the caller becomes
    /// responsible for writing a complete response.
    pub fn hijack(&mut self) -> Result<Rewind<S>, ProxyError> {
        let (stream, mut buf, head_len) = self.conn.take().ok_or_else(|| {
            ProxyError::ConnectionTakeoverFailed("connection already detached".to_string())
        })?;
        let body = buf.split_off(head_len).freeze();
        Ok(Rewind::new(stream, body))
    }

    /// Give the connection back with the whole request, head included, ready
    /// to be read again.
    pub fn into_replay(self) -> Option<Rewind<S>> {
        self.conn
            .map(|(stream, buf, _)| Rewind::new(stream, buf.freeze()))
    }

    /// Answer with a bare 404 and close, unless the connection has already
    /// been detached (its new owner answers instead).
    pub async fn respond_not_found(&mut self) -> io::Result<()> {
        let Some((mut stream, _, _)) = self.conn.take() else {
            return Ok(());
        };
        stream.write_all(NOT_FOUND_RESPONSE).await?;
        stream.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::server::head::read_head;

    async fn exchange_for(
        request: &[u8],
    ) -> (Exchange<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        client.write_all(request).await.unwrap();
        let (head, buf, len) = read_head(&mut server, 64 * 1024).await.unwrap().unwrap();
        (Exchange::new(server, head, buf, len), client)
    }

    #[tokio::test]
    async fn rewind_replays_prefix_first() {
        let inner = std::io::Cursor::new(b" world".to_vec());
        let mut rewind = Rewind::new(inner, Bytes::from_static(b"hello"));
        let mut out = String::new();
        rewind.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
        assert!(rewind.pending().is_empty());
    }

    #[tokio::test]
    async fn hijack_starts_after_head() {
        let (mut exchange, mut client) =
            exchange_for(b"POST /x HTTP/1.1\r\nContent-Length: 8\r\n\r\nbody").await;
        let mut conn = exchange.hijack().unwrap();
        assert_eq!(conn.pending(), b"body");
        assert!(exchange.is_detached());

        client.write_all(b"more").await.unwrap();
        let mut body = [0u8; 8];
        conn.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"bodymore");

        conn.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        let mut reply = [0u8; 19];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"HTTP/1.1 200 OK\r\n\r\n");
    }

    #[tokio::test]
    async fn second_hijack_fails() {
        let (mut exchange, _client) = exchange_for(b"GET / HTTP/1.1\r\n\r\n").await;
        let _conn = exchange.hijack().unwrap();
        assert!(matches!(
            exchange.hijack(),
            Err(ProxyError::ConnectionTakeoverFailed(_))
        ));
        assert!(exchange.into_replay().is_none());
    }

    #[tokio::test]
    async fn replay_includes_head() {
        let request = b"GET /index.html HTTP/1.1\r\nHost: h\r\n\r\n";
        let (exchange, _client) = exchange_for(request).await;
        let replay = exchange.into_replay().unwrap();
        assert_eq!(replay.pending(), request);
    }

    #[tokio::test]
    async fn respond_not_found_closes() {
        let (mut exchange, mut client) = exchange_for(b"GET / HTTP/1.1\r\n\r\n").await;
        exchange.respond_not_found().await.unwrap();
        drop(exchange);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, NOT_FOUND_RESPONSE);
    }

    #[tokio::test]
    async fn respond_not_found_after_hijack_is_noop() {
        let (mut exchange, _client) = exchange_for(b"GET / HTTP/1.1\r\n\r\n").await;
        let _conn = exchange.hijack().unwrap();
        exchange.respond_not_found().await.unwrap();
    }
}

//! Minimal HTTP/1.x handling for the relay's listening socket
//!
//! The relay only ever reads one request head per connection, so there is no
//! keep-alive and every response it writes closes the connection.

use burrow_proto::{HandshakeError, MAX_HANDSHAKE_SIZE};
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

const MAX_HEADERS: usize = 64;

/// Parsed head of an incoming request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// HTTP/1.x minor version
    pub version: u8,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse a request head; `Ok(None)` means more data is needed
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, HandshakeError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let head_len = match req.parse(buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(HandshakeError::Malformed(e.to_string())),
        };

        let head = Self {
            method: req.method.unwrap_or("").to_string(),
            target: req.path.unwrap_or("").to_string(),
            version: req.version.unwrap_or(1),
            headers: req
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).trim().to_string(),
                    )
                })
                .collect(),
        };

        Ok(Some((head, head_len)))
    }

    /// First header with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a comma-separated header contains `token`
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Whether this is a WebSocket upgrade request
    pub fn is_websocket_upgrade(&self) -> bool {
        self.method == "GET"
            && self.has_token("Connection", "upgrade")
            && self.has_token("Upgrade", "websocket")
            && self.header("Sec-WebSocket-Key").is_some()
            && self.header("Sec-WebSocket-Version") == Some("13")
    }

    /// Headers worth passing on to the agent: everything except `Host`, the
    /// hop-by-hop `Proxy-*` headers and `Client`, which only the relay sets
    pub fn forwardable_headers(&self) -> impl Iterator<Item = &(String, String)> {
        self.headers.iter().filter(|(name, _)| {
            !name.eq_ignore_ascii_case("host")
                && !name.eq_ignore_ascii_case("client")
                && !name
                    .get(..6)
                    .is_some_and(|prefix| prefix.eq_ignore_ascii_case("proxy-"))
        })
    }
}

/// Read one request head off `reader`.
///
/// Returns the head, every byte read so far, and the length of the head
/// within those bytes.
pub async fn read_request_head<R>(
    reader: &mut R,
) -> Result<(RequestHead, BytesMut, usize), HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        if let Some((head, head_len)) = RequestHead::parse(&buf)? {
            return Ok((head, buf, head_len));
        }
        if buf.len() >= MAX_HANDSHAKE_SIZE {
            return Err(HandshakeError::HeadTooLarge(buf.len()));
        }
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(HandshakeError::UnexpectedEof);
        }
    }
}

/// Responses the relay generates itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    BadRequest,
    NotFound,
    MethodNotAllowed,
    Conflict,
    InternalServerError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::MethodNotAllowed => 405,
            Status::Conflict => 409,
            Status::InternalServerError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::BadRequest => "Bad Request",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::Conflict => "Conflict",
            Status::InternalServerError => "Internal Server Error",
        }
    }
}

/// Write an error response and close our side of the connection
pub async fn write_response<W>(writer: &mut W, status: Status) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = format!("{} {}\n", status.code(), status.reason());
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.code(),
        status.reason(),
        body.len(),
        body
    );

    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    writer.shutdown().await
}

/// A connection taken over from the HTTP layer
///
/// Bytes already read past what the relay consumed are replayed before
/// reading from the socket again.
#[derive(Debug)]
pub struct HijackedConnection<S> {
    inner: S,
    buffered: Bytes,
}

impl<S> HijackedConnection<S> {
    pub fn new(inner: S, buffered: Bytes) -> Self {
        Self { inner, buffered }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for HijackedConnection<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.buffered.is_empty() {
            let n = this.buffered.len().min(buf.remaining());
            buf.put_slice(&this.buffered[..n]);
            this.buffered.advance(n);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for HijackedConnection<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

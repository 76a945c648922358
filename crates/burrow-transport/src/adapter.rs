//! Byte-stream adapter over a WebSocket connection
//!
//! WebSocket is message oriented, the multiplexer wants a continuous byte
//! stream. Reads drain one binary message at a time, keeping the unread
//! remainder for the next call; every write becomes exactly one binary message.

use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

/// A WebSocket connection exposed as `AsyncRead + AsyncWrite`
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    /// Unread remainder of the last binary message
    pending: Bytes,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    eof: bool,
    closed: bool,
}

impl<S> std::fmt::Debug for WsByteStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsByteStream")
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("pending", &self.pending.len())
            .field("eof", &self.eof)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<S> WsByteStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            peer_addr: None,
            local_addr: None,
            eof: false,
            closed: false,
        }
    }

    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn with_local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn get_ref(&self) -> &WebSocketStream<S> {
        &self.inner
    }
}

/// Close codes treated as a graceful end of stream
fn is_graceful_close(code: CloseCode) -> bool {
    matches!(code, CloseCode::Normal | CloseCode::Abnormal)
}

fn to_io_error(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }

            if this.eof {
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    trace!("Received binary message, len={}", data.len());
                    this.pending = Bytes::from(data);
                }
                Some(Ok(Message::Close(frame))) => match frame {
                    Some(frame) if !is_graceful_close(frame.code) => {
                        debug!("WebSocket closed with code {}", frame.code);
                        this.eof = true;
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            format!("websocket closed: {} {}", frame.code, frame.reason),
                        )));
                    }
                    _ => {
                        debug!("WebSocket close received");
                        this.eof = true;
                    }
                },
                // Text, ping and pong carry nothing for the byte stream
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed))
                | Some(Err(WsError::AlreadyClosed))
                | Some(Err(WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake))) => {
                    this.eof = true;
                }
                Some(Err(WsError::Io(e))) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    this.eof = true;
                }
                Some(Err(e)) => return Poll::Ready(Err(to_io_error(e))),
                None => this.eof = true,
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "websocket already closed",
            )));
        }

        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(to_io_error)?;
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(to_io_error)?;

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(to_io_error)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.closed {
            return Poll::Ready(Ok(()));
        }

        let result = ready!(Pin::new(&mut this.inner).poll_close(cx));
        this.closed = true;

        match result {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(to_io_error(e))),
        }
    }
}

//! Logical stream carried inside a multiplexed session

use burrow_proto::{Frame, StreamId, MAX_FRAME_PAYLOAD, STREAM_WINDOW};
use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::PollSender;
use tracing::trace;

use crate::flow::FlowControl;
use crate::session::Outbound;

/// One bidirectional byte stream of a [`Session`](crate::Session)
///
/// Reads return EOF once the peer half-closed the stream (FIN), reset it
/// (RST), or the whole session went away. `shutdown` half-closes our
/// direction. Dropping the stream releases it; a stream dropped before the
/// peer finished is reset so the peer stops sending.
///
/// Writes wait while the peer's receive window is full, so a stream nobody
/// reads stalls its writer instead of queueing without bound.
pub struct MuxStream {
    stream_id: StreamId,
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
    tx: PollSender<Outbound>,
    control: mpsc::Sender<Outbound>,
    updates: mpsc::UnboundedSender<Frame>,
    flow: Arc<FlowControl>,
    /// Bytes read since the last window update
    unacked: u32,
    fin_sent: bool,
    remote_closed: bool,
}

impl MuxStream {
    pub(crate) fn new(
        stream_id: StreamId,
        rx: mpsc::UnboundedReceiver<Bytes>,
        flow: Arc<FlowControl>,
        outbound: mpsc::Sender<Outbound>,
        updates: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        Self {
            stream_id,
            rx,
            pending: Bytes::new(),
            tx: PollSender::new(outbound.clone()),
            control: outbound,
            updates,
            flow,
            unacked: 0,
            fin_sent: false,
            remote_closed: false,
        }
    }

    /// Hand read bytes back to the peer as send credit, in batches of half
    /// a window
    fn consumed(&mut self, n: usize) {
        let n = n as u32;
        self.flow.consume(n);
        self.unacked += n;

        if self.unacked >= STREAM_WINDOW / 2 {
            let _ = self
                .updates
                .send(Frame::window_update(self.stream_id, self.unacked));
            self.unacked = 0;
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("stream_id", &self.stream_id)
            .field("fin_sent", &self.fin_sent)
            .field("remote_closed", &self.remote_closed)
            .finish()
    }
}

fn session_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "session closed")
}

impl AsyncRead for MuxStream {
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
                this.consumed(n);
                return Poll::Ready(Ok(()));
            }

            if this.remote_closed {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.rx.poll_recv(cx)) {
                Some(chunk) => this.pending = chunk,
                None => {
                    trace!(stream_id = this.stream_id, "Stream reached EOF");
                    this.remote_closed = true;
                }
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.fin_sent {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream already closed for writing",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let credit = ready!(this.flow.poll_send_credit(cx))?;
        ready!(this.tx.poll_reserve(cx)).map_err(|_| session_closed())?;

        let n = buf
            .len()
            .min(MAX_FRAME_PAYLOAD as usize)
            .min(credit as usize);
        this.flow.spend(n as u32);
        let frame = Frame::data(this.stream_id, Bytes::copy_from_slice(&buf[..n]));
        this.tx
            .send_item(Outbound::Frame(frame))
            .map_err(|_| session_closed())?;

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the session writer as soon as they are written
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.fin_sent {
            return Poll::Ready(Ok(()));
        }

        // A session that is already gone has nothing left to half-close
        if ready!(this.tx.poll_reserve(cx)).is_ok() {
            let _ = this
                .tx
                .send_item(Outbound::Frame(Frame::fin(this.stream_id)));
        }
        this.fin_sent = true;
        trace!(stream_id = this.stream_id, "Stream half-closed");

        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        let frame = if !self.remote_closed {
            Some(Frame::rst(self.stream_id))
        } else if !self.fin_sent {
            Some(Frame::fin(self.stream_id))
        } else {
            None
        };
        let release = Outbound::Release {
            stream_id: self.stream_id,
            frame,
        };

        match self.control.try_send(release) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(release)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let control = self.control.clone();
                    handle.spawn(async move {
                        let _ = control.send(release).await;
                    });
                }
            }
        }
    }
}

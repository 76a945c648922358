//! Multiplexed session over a single byte stream

use async_trait::async_trait;
use burrow_proto::{Frame, FrameCodec, FrameType, StreamId};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{SessionError, SessionResult};
use crate::flow::FlowControl;
use crate::stream::MuxStream;
use crate::{StreamAcceptor, StreamOpener};

/// Capacity of the outbound frame queue shared by all streams
const OUTBOUND_CAPACITY: usize = 256;

/// Streams opened by the peer and not yet accepted
const ACCEPT_BACKLOG: usize = 64;

/// Upper bound for flushing the go-away frame when the session ends
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Which side of the session this is
///
/// Client opens odd stream IDs, server opens even ones, so both sides may
/// open streams without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

impl Mode {
    fn first_stream_id(self) -> StreamId {
        match self {
            Mode::Client => 1,
            Mode::Server => 2,
        }
    }

    /// Whether the peer is allowed to open `stream_id`
    fn is_peer_stream(self, stream_id: StreamId) -> bool {
        match self {
            Mode::Client => stream_id != 0 && stream_id % 2 == 0,
            Mode::Server => stream_id % 2 == 1,
        }
    }
}

/// Work item for the writer task
pub(crate) enum Outbound {
    Frame(Frame),
    /// Forget a stream, optionally telling the peer with a final frame
    Release {
        stream_id: StreamId,
        frame: Option<Frame>,
    },
}

/// Session-side view of one live stream
struct StreamEntry {
    /// Dropped once the peer finished sending
    inbound: Option<mpsc::UnboundedSender<Bytes>>,
    flow: Arc<FlowControl>,
}

impl StreamEntry {
    fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let entry = Self {
            inbound: Some(tx),
            flow: Arc::new(FlowControl::new()),
        };
        (entry, rx)
    }
}

type StreamMap = HashMap<StreamId, StreamEntry>;

struct Shared {
    session_id: String,
    mode: Mode,
    remote_addr: Option<SocketAddr>,
    streams: Mutex<StreamMap>,
    next_stream_id: AtomicU32,
    outbound: mpsc::Sender<Outbound>,
    /// Window updates and resets, which bypass the data queue
    control: mpsc::UnboundedSender<Frame>,
    shutdown: CancellationToken,
    failure: Mutex<Option<String>>,
}

impl Shared {
    fn streams(&self) -> MutexGuard<'_, StreamMap> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_failure(&self, reason: String) {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        failure.get_or_insert(reason);
    }

    fn new_stream(
        &self,
        stream_id: StreamId,
        entry: &StreamEntry,
        rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> MuxStream {
        MuxStream::new(
            stream_id,
            rx,
            entry.flow.clone(),
            self.outbound.clone(),
            self.control.clone(),
        )
    }

    fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A multiplexed session
///
/// Owns two background tasks: a reader that decodes frames and dispatches
/// them to streams, and a writer that serializes frames from every stream
/// onto the transport. The session is closed once either task ends, when
/// [`Session::close`] is called, or when the session is dropped.
pub struct Session {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.shared.session_id)
            .field("mode", &self.shared.mode)
            .field("remote_addr", &self.shared.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Start a session over `io`
    pub fn new<T>(io: T, mode: Mode, remote_addr: Option<SocketAddr>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session_id = uuid::Uuid::new_v4().to_string();

        let (reader, writer) = tokio::io::split(io);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);

        let shared = Arc::new(Shared {
            session_id,
            mode,
            remote_addr,
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU32::new(mode.first_stream_id()),
            outbound: outbound_tx,
            control: control_tx,
            shutdown: CancellationToken::new(),
            failure: Mutex::new(None),
        });

        debug!(
            "[{}] Session started (mode={:?}, remote={:?})",
            shared.session_id, mode, remote_addr
        );

        tokio::spawn(Self::writer_task(
            FramedWrite::new(writer, FrameCodec),
            outbound_rx,
            control_rx,
            shared.clone(),
        ));
        tokio::spawn(Self::reader_task(
            FramedRead::new(reader, FrameCodec),
            accept_tx,
            shared.clone(),
        ));

        Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    /// Session that opens streams (the relay side)
    pub fn client<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, Mode::Client, None)
    }

    /// Session that accepts streams (the agent side)
    pub fn server<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, Mode::Server, None)
    }

    /// Writer task - serializes frames onto the transport
    async fn writer_task<W>(
        mut sink: FramedWrite<WriteHalf<W>, FrameCodec>,
        mut rx: mpsc::Receiver<Outbound>,
        mut control_rx: mpsc::UnboundedReceiver<Frame>,
        shared: Arc<Shared>,
    ) where
        W: AsyncRead + AsyncWrite,
    {
        let session_id = shared.session_id.clone();

        loop {
            let outbound = tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => break,
                Some(frame) = control_rx.recv() => Outbound::Frame(frame),
                outbound = rx.recv() => match outbound {
                    Some(outbound) => outbound,
                    None => break,
                },
            };

            let frame = match outbound {
                Outbound::Frame(frame) => frame,
                Outbound::Release { stream_id, frame } => {
                    shared.streams().remove(&stream_id);
                    trace!("[{}] Released stream {}", session_id, stream_id);
                    match frame {
                        Some(frame) => frame,
                        None => continue,
                    }
                }
            };

            trace!(
                "[{}] Sending frame: stream={}, flags={:#04x}, len={}",
                session_id,
                frame.stream_id,
                frame.flags.as_u8(),
                frame.payload.len()
            );

            // A peer that stopped reading must not keep the session alive
            // past close()
            let sent = tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                sent = sink.send(frame) => sent,
            };
            if let Err(e) = sent {
                warn!("[{}] Session write error: {}", session_id, e);
                shared.record_failure(e.to_string());
                break;
            }
        }

        shared.shutdown.cancel();

        let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
            let _ = sink.send(Frame::go_away()).await;
            let _ = sink.close().await;
        })
        .await;

        debug!("[{}] Session writer task ended", session_id);
    }

    /// Reader task - decodes frames and dispatches them to streams
    async fn reader_task<R>(
        mut source: FramedRead<ReadHalf<R>, FrameCodec>,
        accept_tx: mpsc::Sender<MuxStream>,
        shared: Arc<Shared>,
    ) where
        R: AsyncRead + AsyncWrite,
    {
        let session_id = shared.session_id.clone();

        loop {
            let frame = tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                frame = source.next() => frame,
            };

            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!("[{}] Session read error: {}", session_id, e);
                    shared.record_failure(e.to_string());
                    break;
                }
                None => {
                    debug!("[{}] Transport reached EOF", session_id);
                    break;
                }
            };

            trace!(
                "[{}] Received frame: stream={}, type={:?}, flags={:#04x}, len={}",
                session_id,
                frame.stream_id,
                frame.frame_type,
                frame.flags.as_u8(),
                frame.payload.len()
            );

            if frame.frame_type == FrameType::GoAway {
                debug!("[{}] Peer is going away", session_id);
                break;
            }

            Self::dispatch(&shared, &accept_tx, frame);
        }

        shared.shutdown.cancel();
        // Dropping the senders ends every stream's read side
        for (_, entry) in shared.streams().drain() {
            entry.flow.reset();
        }

        debug!("[{}] Session reader task ended", session_id);
    }

    fn dispatch(shared: &Shared, accept_tx: &mpsc::Sender<MuxStream>, frame: Frame) {
        let stream_id = frame.stream_id;

        if frame.flags.has_syn() {
            Self::accept_syn(shared, accept_tx, stream_id);
        }

        let mut streams = shared.streams();

        if frame.flags.has_rst() {
            if let Some(entry) = streams.remove(&stream_id) {
                entry.flow.reset();
                debug!("[{}] Stream {} reset by peer", shared.session_id, stream_id);
            }
            return;
        }

        let Some(entry) = streams.get_mut(&stream_id) else {
            trace!(
                "[{}] Discarding frame for unknown stream {}",
                shared.session_id,
                stream_id
            );
            return;
        };

        if let Some(delta) = frame.window_delta() {
            entry.flow.grant(delta);
            return;
        }

        if !frame.payload.is_empty() {
            if !entry.flow.receive(frame.payload.len() as u32) {
                warn!(
                    "[{}] Peer overran the receive window of stream {}",
                    shared.session_id, stream_id
                );
                if let Some(entry) = streams.remove(&stream_id) {
                    entry.flow.reset();
                }
                let _ = shared.control.send(Frame::rst(stream_id));
                return;
            }

            let delivered = entry
                .inbound
                .as_ref()
                .is_some_and(|tx| tx.send(frame.payload).is_ok());
            if !delivered {
                trace!(
                    "[{}] Stream {} is no longer reading",
                    shared.session_id,
                    stream_id
                );
                entry.inbound = None;
            }
        }

        if frame.flags.has_fin() {
            entry.inbound = None;
        }
    }

    fn accept_syn(shared: &Shared, accept_tx: &mpsc::Sender<MuxStream>, stream_id: StreamId) {
        if !shared.mode.is_peer_stream(stream_id) {
            warn!(
                "[{}] Peer opened stream {} with invalid ID",
                shared.session_id, stream_id
            );
            let _ = shared.control.send(Frame::rst(stream_id));
            return;
        }

        let stream = {
            let mut streams = shared.streams();
            if streams.contains_key(&stream_id) {
                warn!(
                    "[{}] Peer reopened existing stream {}",
                    shared.session_id, stream_id
                );
                return;
            }
            let (entry, rx) = StreamEntry::new();
            let stream = shared.new_stream(stream_id, &entry, rx);
            streams.insert(stream_id, entry);
            stream
        };

        // A stream that cannot be queued is dropped, which resets it
        if let Err(e) = accept_tx.try_send(stream) {
            warn!(
                "[{}] Refusing stream {}: {}",
                shared.session_id, stream_id, e
            );
        } else {
            debug!("[{}] Peer opened stream {}", shared.session_id, stream_id);
        }
    }

    /// Open a new stream to the peer
    pub async fn open_stream(&self) -> SessionResult<MuxStream> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let stream_id = self.shared.next_stream_id.fetch_add(2, Ordering::SeqCst);
        if stream_id > u32::MAX - 2 {
            return Err(SessionError::Transport(
                "stream IDs exhausted".to_string(),
            ));
        }

        let (entry, rx) = StreamEntry::new();
        let stream = self.shared.new_stream(stream_id, &entry, rx);
        self.shared.streams().insert(stream_id, entry);

        // The reader may have torn the session down after the check above
        if self.is_closed() {
            self.shared.streams().remove(&stream_id);
            return Err(SessionError::Closed);
        }

        self.shared
            .outbound
            .send(Outbound::Frame(Frame::syn(stream_id)))
            .await
            .map_err(|_| SessionError::Closed)?;

        debug!("[{}] Opened stream {}", self.shared.session_id, stream_id);
        Ok(stream)
    }

    /// Wait for the next stream opened by the peer
    ///
    /// `Ok(None)` means the session closed cleanly.
    pub async fn accept_stream(&self) -> SessionResult<Option<MuxStream>> {
        let mut accept_rx = self.accept_rx.lock().await;

        match accept_rx.recv().await {
            Some(stream) => {
                debug!(
                    "[{}] Accepted stream {}",
                    self.shared.session_id,
                    stream.stream_id()
                );
                Ok(Some(stream))
            }
            None => match self.shared.failure() {
                Some(reason) => Err(SessionError::Transport(reason)),
                None => Ok(None),
            },
        }
    }

    /// Resolves once the session is closed
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Close the session and every stream in it
    pub fn close(&self) {
        if !self.shared.shutdown.is_cancelled() {
            debug!("[{}] Closing session", self.shared.session_id);
            self.shared.shutdown.cancel();
        }
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.shared.remote_addr
    }

    pub fn id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn mode(&self) -> Mode {
        self.shared.mode
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

#[async_trait]
impl StreamOpener for Session {
    type Stream = MuxStream;

    async fn open_stream(&self) -> SessionResult<Self::Stream> {
        Session::open_stream(self).await
    }
}

#[async_trait]
impl StreamAcceptor for Session {
    type Stream = MuxStream;

    async fn accept_stream(&self) -> SessionResult<Option<Self::Stream>> {
        Session::accept_stream(self).await
    }
}

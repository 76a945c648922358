//! Relay server

use burrow_proto::{DestinationAck, DestinationRequest, HandshakeError};
use burrow_transport::{bridge, Mode, Session, WsByteStream};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::http::{read_request_head, write_response, HijackedConnection, RequestHead, Status};
use crate::slot::SessionSlot;

/// The relay
///
/// Cheap to clone; clones share the registered session and shutdown state.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    config: RelayConfig,
    slot: SessionSlot,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("config", &self.inner.config)
            .field("has_active_session", &self.has_active_session())
            .finish()
    }
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                config,
                slot: SessionSlot::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Bind the listening socket
    pub async fn bind(addr: SocketAddr) -> Result<TcpListener, RelayError> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::BindError {
                address: addr.ip().to_string(),
                port: addr.port(),
                reason: e.to_string(),
            })
    }

    /// Bind `addr` and serve until shut down
    pub async fn run(&self, addr: SocketAddr) -> Result<(), RelayError> {
        let listener = Self::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until [`Relay::shutdown`] is called
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        let local_addr = listener.local_addr()?;
        info!("Relay listening on {}", local_addr);

        loop {
            let accepted = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer_addr)) => {
                    debug!("Accepted connection from {}", peer_addr);
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        if let Err(e) = inner.handle_connection(socket, peer_addr).await {
                            debug!("Connection from {} ended with error: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }

        info!("Relay on {} stopped", local_addr);
        Ok(())
    }

    /// Stop accepting connections and close the registered session, which
    /// ends every tunnel running through it
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Some(session) = self.inner.slot.take() {
            session.close();
        }
    }

    /// Whether an agent is currently registered
    pub fn has_active_session(&self) -> bool {
        self.inner.slot.active().is_some()
    }
}

impl RelayInner {
    async fn handle_connection(
        &self,
        mut socket: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), RelayError> {
        let (head, mut buffered, head_len) = match read_request_head(&mut socket).await {
            Ok(request) => request,
            Err(HandshakeError::UnexpectedEof) => return Ok(()),
            Err(HandshakeError::Io(e)) => return Err(e.into()),
            Err(e) => {
                debug!("Bad request from {}: {}", peer_addr, e);
                write_response(&mut socket, Status::BadRequest).await?;
                return Ok(());
            }
        };

        match head.method.as_str() {
            "CONNECT" => {
                let leftover = buffered.split_off(head_len).freeze();
                self.handle_proxy(socket, head, leftover, peer_addr).await
            }
            "GET" => {
                // The upgrade handshake re-reads the whole head
                self.handle_registration(socket, head, buffered.freeze(), peer_addr)
                    .await
            }
            method => {
                debug!("Rejecting {} request from {}", method, peer_addr);
                write_response(&mut socket, Status::MethodNotAllowed).await?;
                Ok(())
            }
        }
    }

    /// Upgrade an agent registration and hold its session until it closes
    async fn handle_registration(
        &self,
        mut socket: TcpStream,
        head: RequestHead,
        buffered: Bytes,
        peer_addr: SocketAddr,
    ) -> Result<(), RelayError> {
        let Some(generation) = self.slot.reserve() else {
            warn!(agent = %peer_addr, "Rejecting registration, an agent is already connected");
            write_response(&mut socket, Status::Conflict).await?;
            return Ok(());
        };

        if !head.is_websocket_upgrade() {
            self.slot.release(generation);
            debug!(agent = %peer_addr, "Registration is not a WebSocket upgrade");
            write_response(&mut socket, Status::BadRequest).await?;
            return Ok(());
        }

        let local_addr = socket.local_addr().ok();
        let ws = match tokio_tungstenite::accept_async(HijackedConnection::new(socket, buffered))
            .await
        {
            Ok(ws) => ws,
            Err(e) => {
                self.slot.release(generation);
                error!(agent = %peer_addr, "Failed to upgrade: {}", e);
                return Err(RelayError::Upgrade(e.to_string()));
            }
        };

        let mut transport = WsByteStream::new(ws).with_peer_addr(peer_addr);
        if let Some(local_addr) = local_addr {
            transport = transport.with_local_addr(local_addr);
        }

        let session = Arc::new(Session::new(transport, Mode::Client, Some(peer_addr)));
        if !self.slot.activate(generation, session.clone()) {
            session.close();
            return Ok(());
        }

        info!(agent = %peer_addr, session_id = session.id(), "Agent connected");

        // Agents never get to open streams towards the relay
        let refuser = session.clone();
        tokio::spawn(async move {
            while let Ok(Some(stream)) = refuser.accept_stream().await {
                warn!(
                    agent = %peer_addr,
                    stream_id = stream.stream_id(),
                    "Resetting stream opened by agent"
                );
                drop(stream);
            }
        });

        tokio::select! {
            _ = session.closed() => {}
            _ = self.shutdown.cancelled() => {}
        }

        session.close();
        self.slot.release(generation);

        info!(agent = %peer_addr, session_id = session.id(), "Agent disconnected");
        Ok(())
    }

    /// Forward a CONNECT request through the registered agent
    async fn handle_proxy(
        &self,
        mut socket: TcpStream,
        head: RequestHead,
        leftover: Bytes,
        peer_addr: SocketAddr,
    ) -> Result<(), RelayError> {
        let Some((generation, session)) = self.slot.active() else {
            debug!(src = %peer_addr, dest = %head.target, "No agent connected");
            write_response(&mut socket, Status::NotFound).await?;
            return Ok(());
        };

        let agent = session
            .remote_address()
            .map(|addr| addr.to_string())
            .unwrap_or_default();

        let mut stream = match session.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                error!(src = %peer_addr, agent = %agent, "Failed to open stream: {}", e);
                session.close();
                self.slot.release(generation);
                write_response(&mut socket, Status::InternalServerError).await?;
                return Ok(());
            }
        };

        let stream_id = stream.stream_id();
        let client = HijackedConnection::new(socket, leftover);
        let request = self.destination_request(&head, peer_addr);

        info!(src = %peer_addr, agent = %agent, dest = %head.target, stream_id, "Start tunneling");

        if let Some((sent, received)) = self.tunnel(client, stream, &request, peer_addr).await? {
            info!(
                src = %peer_addr,
                agent = %agent,
                dest = %head.target,
                stream_id,
                bytes_sent = sent,
                bytes_received = received,
                "End tunneling"
            );
        }
        Ok(())
    }

    /// The request announcing `head`'s target to the agent
    fn destination_request(&self, head: &RequestHead, peer_addr: SocketAddr) -> DestinationRequest {
        let mut request = DestinationRequest::connect(head.target.clone())
            .with_method(head.method.clone())
            .with_version(head.version)
            .with_requester(peer_addr.to_string());
        for (name, value) in head.forwardable_headers() {
            request = request.with_header(name.clone(), value.clone());
        }
        request
    }

    /// Run the destination handshake over `stream`, then bridge it with the
    /// hijacked client connection.
    ///
    /// Returns `None` when the agent never acknowledged and the client was
    /// simply closed.
    async fn tunnel<C, S>(
        &self,
        mut client: C,
        mut stream: S,
        request: &DestinationRequest,
        peer_addr: SocketAddr,
    ) -> Result<Option<(u64, u64)>, RelayError>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin,
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        if let Err(e) = request
            .write_to(&mut stream, self.config.requester_header)
            .await
        {
            error!(src = %peer_addr, dest = %request.target, "Failed to write destination request: {}", e);
            write_response(&mut client, Status::InternalServerError).await?;
            return Ok(None);
        }

        let (ack, raw) = match DestinationAck::read_from(&mut stream).await {
            Ok(ack) => ack,
            Err(e) => {
                debug!(src = %peer_addr, dest = %request.target, "Agent did not acknowledge: {}", e);
                return Ok(None);
            }
        };
        if !ack.is_success() {
            debug!(status = ack.status, "Agent answered with non-success status");
        }

        client.write_all(&raw).await?;

        Ok(Some(bridge(client, stream).await))
    }
}

//! Agent connection lifecycle

use burrow_transport::{Mode, Session, WsByteStream};
use tokio::net::TcpStream;
use tokio_tungstenite::Connector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{normalize_relay_url, AgentConfig};
use crate::error::AgentError;
use crate::forwarder::{ForwardError, StreamForwarder};
use crate::tls;

/// A single connection to one relay
pub struct Agent {
    config: AgentConfig,
    url: Url,
    forwarder: StreamForwarder,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("url", &self.url.as_str())
            .field("insecure", &self.config.insecure)
            .finish()
    }
}

impl Agent {
    /// Create an agent; fails only on a malformed or unsupported relay URL
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let url = normalize_relay_url(&config.relay_url)?;
        let forwarder = StreamForwarder::new(config.relay_url.clone(), config.dial_timeout);

        Ok(Self {
            config,
            url,
            forwarder,
            shutdown: CancellationToken::new(),
        })
    }

    /// Tie the agent's lifetime to an external token
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// The normalized `ws`/`wss` URL of the relay
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Close the session, ending every tunnel in flight
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Connect to the relay and serve streams until the session ends.
    ///
    /// Returns `Ok(())` when the relay closes the session or the agent is shut
    /// down, and an error when connecting fails or the session breaks.
    pub async fn run(&self) -> Result<(), AgentError> {
        let relay = self.config.relay_url.as_str();

        let session = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Ok(()),
            session = self.connect() => session?,
        };

        info!(relay = %relay, session_id = session.id(), "Connected to relay");

        let result = loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Ok(()),
                accepted = session.accept_stream() => accepted,
            };

            match accepted {
                Ok(Some(stream)) => {
                    let stream_id = stream.stream_id();
                    let forwarder = self.forwarder.clone();
                    tokio::spawn(async move {
                        match forwarder.forward(stream).await {
                            Ok(_) => {}
                            Err(ForwardError::DestinationUnreachable { address, source }) => {
                                warn!(stream_id, dest = %address, "Failed to dial destination: {}", source);
                            }
                            Err(e) => {
                                warn!(stream_id, "Failed to serve stream: {}", e);
                            }
                        }
                    });
                }
                Ok(None) => break Ok(()),
                Err(e) => {
                    error!(relay = %relay, "Failed to accept stream: {}", e);
                    break Err(e.into());
                }
            }
        };

        session.close();
        info!(relay = %relay, session_id = session.id(), "Disconnected from relay");

        result
    }

    async fn connect(&self) -> Result<Session, AgentError> {
        match self.config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, self.establish())
                .await
                .map_err(|_| AgentError::ConnectTimeout(self.url.to_string()))?,
            None => self.establish().await,
        }
    }

    /// Dial, upgrade and start the session in the accepting role
    async fn establish(&self) -> Result<Session, AgentError> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| AgentError::InvalidUrl(self.url.to_string()))?;
        let port = self
            .url
            .port_or_known_default()
            .ok_or_else(|| AgentError::InvalidUrl(self.url.to_string()))?;
        let address = format!("{}:{}", host, port);

        debug!("Connecting to relay at {}", address);

        let socket = TcpStream::connect(&address)
            .await
            .map_err(|source| AgentError::Connect {
                address: address.clone(),
                source,
            })?;
        let _ = socket.set_nodelay(true);
        let peer_addr = socket.peer_addr().ok();
        let local_addr = socket.local_addr().ok();

        let connector = match self.url.scheme() {
            "wss" => Some(Connector::Rustls(tls::client_config(self.config.insecure))),
            _ => Some(Connector::Plain),
        };

        let (ws, _response) = tokio_tungstenite::client_async_tls_with_config(
            self.url.as_str(),
            socket,
            None,
            connector,
        )
        .await
        .map_err(|e| AgentError::Handshake(e.to_string()))?;

        let mut transport = WsByteStream::new(ws);
        if let Some(addr) = peer_addr {
            transport = transport.with_peer_addr(addr);
        }
        if let Some(addr) = local_addr {
            transport = transport.with_local_addr(addr);
        }

        Ok(Session::new(transport, Mode::Server, peer_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[test]
    fn test_new_normalizes_url() {
        let agent = Agent::new(AgentConfig::new("https://relay.example.com/")).unwrap();
        assert_eq!(agent.url().as_str(), "wss://relay.example.com/");
    }

    #[test]
    fn test_new_rejects_unsupported_scheme() {
        let err = Agent::new(AgentConfig::new("gopher://relay")).unwrap_err();
        assert!(matches!(err, AgentError::UnsupportedScheme(_)));
    }

    #[tokio::test]
    async fn test_run_reports_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let agent = Agent::new(AgentConfig::new(format!("http://{}", addr))).unwrap();
        let err = agent.run().await.unwrap_err();
        assert!(matches!(err, AgentError::Connect { .. }));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_run_reports_rejected_upgrade() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 409 Conflict\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
        });

        let agent = Agent::new(AgentConfig::new(format!("ws://{}", addr))).unwrap();
        let err = agent.run().await.unwrap_err();
        assert!(matches!(err, AgentError::Handshake(_)));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        // Accepts the TCP connection but never answers the upgrade
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let config = AgentConfig::new(format!("ws://{}", addr))
            .with_connect_timeout(Duration::from_millis(100));
        let err = Agent::new(config).unwrap().run().await.unwrap_err();
        assert!(matches!(err, AgentError::ConnectTimeout(_)));
    }

    #[tokio::test]
    async fn test_shutdown_before_connect() {
        let agent = Agent::new(AgentConfig::new("ws://192.0.2.1:9")).unwrap();
        agent.shutdown();
        assert!(agent.run().await.is_ok());
    }
}

//! Per-stream handling: destination handshake, dial, bridge

use burrow_proto::{DestinationAck, DestinationRequest, HandshakeError};
use burrow_transport::bridge;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Errors that can occur while serving one stream
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Destination handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Failed to connect to destination {address}: {source}")]
    DestinationUnreachable {
        address: String,
        source: std::io::Error,
    },

    #[error("Timed out connecting to destination {0}")]
    DialTimeout(String),

    #[error("IO error during forwarding: {0}")]
    Io(#[from] std::io::Error),
}

/// Serves streams opened by the relay
#[derive(Debug, Clone)]
pub struct StreamForwarder {
    relay: String,
    dial_timeout: Option<Duration>,
}

impl StreamForwarder {
    /// Create a forwarder; `relay` only labels log lines
    pub fn new(relay: impl Into<String>, dial_timeout: Option<Duration>) -> Self {
        Self {
            relay: relay.into(),
            dial_timeout,
        }
    }

    /// Serve one stream until either end closes
    ///
    /// Reads the destination request, acknowledges it, dials the destination
    /// and bridges the two. The acknowledgment goes out before the dial, so a
    /// destination that cannot be reached shows up on the relay side as the
    /// stream closing right after the ack.
    ///
    /// Returns `(bytes_to_destination, bytes_to_relay)`.
    pub async fn forward<S>(&self, mut stream: S) -> Result<(u64, u64), ForwardError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (request, leftover) = DestinationRequest::read_from(&mut stream).await?;
        DestinationAck::ok(&request).write_to(&mut stream).await?;

        let src = request.requester.as_deref().unwrap_or("unknown");
        let dest = request.target.as_str();

        let mut destination = self.dial(dest).await?;

        tracing::debug!(src = %src, dest = %dest, "Connected to destination");

        if !leftover.is_empty() {
            destination.write_all(&leftover).await?;
        }

        tracing::info!(src = %src, relay = %self.relay, dest = %dest, "Start tunneling");

        let (to_destination, to_relay) = bridge(stream, destination).await;
        let to_destination = to_destination + leftover.len() as u64;

        tracing::info!(
            src = %src,
            relay = %self.relay,
            dest = %dest,
            bytes_to_destination = to_destination,
            bytes_to_relay = to_relay,
            "End tunneling"
        );

        Ok((to_destination, to_relay))
    }

    async fn dial(&self, address: &str) -> Result<TcpStream, ForwardError> {
        let connect = TcpStream::connect(address);

        let result = match self.dial_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| ForwardError::DialTimeout(address.to_string()))?,
            None => connect.await,
        };

        result.map_err(|source| ForwardError::DestinationUnreachable {
            address: address.to_string(),
            source,
        })
    }
}

use burrow_proto::HandshakeError;
use thiserror::Error;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Invalid request: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("WebSocket upgrade failed: {0}")]
    Upgrade(String),
}

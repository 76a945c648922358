use burrow_transport::SessionError;
use thiserror::Error;

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported relay URL scheme: {0} (expected http, https, ws or wss)")]
    UnsupportedScheme(String),

    #[error("Failed to connect to relay at {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    #[error("Timed out connecting to relay at {0}")]
    ConnectTimeout(String),

    #[error("WebSocket handshake with relay failed: {0}")]
    Handshake(String),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

impl AgentError {
    /// Configuration errors never go away by retrying
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::InvalidUrl(_) | AgentError::UnsupportedScheme(_)
        )
    }
}

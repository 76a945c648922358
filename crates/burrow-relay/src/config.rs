//! Relay configuration

use burrow_proto::RequesterHeader;

/// Relay configuration
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    /// How the client address is passed to the agent
    pub requester_header: RequesterHeader,
}

impl RelayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_requester_header(mut self, requester_header: RequesterHeader) -> Self {
        self.requester_header = requester_header;
        self
    }
}

//! Edge side of the tunnel
//!
//! The agent dials out to a relay, upgrades the connection to a WebSocket and
//! runs a multiplexed session in the accepting role. Every stream the relay
//! opens names a destination; the agent acknowledges it, dials the
//! destination and bridges the two until either side is done.
//!
//! # Example
//!
//! ```no_run
//! use burrow_agent::{Agent, AgentConfig};
//!
//! # async fn run() -> Result<(), burrow_agent::AgentError> {
//! let agent = Agent::new(AgentConfig::new("https://relay.example.com"))?;
//! agent.run().await
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod forwarder;
mod tls;

pub use agent::Agent;
pub use config::{normalize_relay_url, AgentConfig};
pub use error::AgentError;
pub use forwarder::{ForwardError, StreamForwarder};

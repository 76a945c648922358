//! Public side of the tunnel
//!
//! The relay listens for plain HTTP/1.x connections and tells two kinds of
//! request apart by method:
//!
//! - `GET` with WebSocket upgrade headers registers an agent. The upgraded
//!   connection becomes a multiplexed session in which the relay opens streams.
//! - `CONNECT host:port` is a proxy request. It is forwarded to the registered
//!   agent over a fresh stream and then bridged to the client socket.
//!
//! At most one agent is registered at a time.

pub mod config;
pub mod error;
pub mod http;
pub mod relay;
pub mod slot;

pub use config::RelayConfig;
pub use error::RelayError;
pub use relay::Relay;

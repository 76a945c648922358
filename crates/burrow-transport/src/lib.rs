//! Session and stream substrate for the tunnel
//!
//! This crate turns one WebSocket connection into many independent byte
//! streams:
//!
//! - [`WsByteStream`] adapts a message-oriented WebSocket into a continuous
//!   `AsyncRead + AsyncWrite` byte stream
//! - [`Session`] multiplexes logical [`MuxStream`]s over that byte stream
//! - [`bridge`] splices two byte streams together until either side ends
//!
//! # Roles
//!
//! A session is created in one of two [`Mode`]s. The side that opens streams
//! (the relay) runs in [`Mode::Client`], the side that accepts them (the agent)
//! in [`Mode::Server`]. The mode is independent of who dialed the physical
//! connection, which is what lets the relay reach an agent behind NAT.

pub mod adapter;
pub mod bridge;
pub mod error;
mod flow;
pub mod session;
pub mod stream;

pub use adapter::WsByteStream;
pub use bridge::bridge;
pub use error::{SessionError, SessionResult};
pub use session::{Mode, Session};
pub use stream::MuxStream;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Capability of a session to open new logical streams
#[async_trait]
pub trait StreamOpener: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin;

    /// Open a new stream; fails once the session is closed
    async fn open_stream(&self) -> SessionResult<Self::Stream>;
}

/// Capability of a session to accept streams opened by the peer
#[async_trait]
pub trait StreamAcceptor: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin;

    /// Wait for the next incoming stream.
    ///
    /// Returns `Ok(None)` when the session closed cleanly and `Err` when the
    /// underlying transport failed.
    async fn accept_stream(&self) -> SessionResult<Option<Self::Stream>>;
}

//! Burrow Protocol Definitions
//!
//! This crate defines the two wire formats shared by the relay and the agent:
//!
//! - [`frame`]: the multiplexing frames carried over the WebSocket byte stream
//! - [`handshake`]: the destination handshake sent as the first bytes of every stream

pub mod frame;
pub mod handshake;

pub use frame::{Frame, FrameCodec, FrameError, FrameFlags, FrameType, StreamId};
pub use handshake::{
    parse_forwarded_for, quote, DestinationAck, DestinationRequest, HandshakeError,
    RequesterHeader,
};

/// Maximum payload carried by a single frame (256KB)
pub const MAX_FRAME_PAYLOAD: u32 = 256 * 1024;

/// Bytes a receiver buffers per stream before the sender must wait for a
/// window update
pub const STREAM_WINDOW: u32 = 256 * 1024;

/// Reserved stream ID for session-level frames
pub const SESSION_STREAM_ID: StreamId = 0;

/// Maximum size of a handshake head (request line + headers)
pub const MAX_HANDSHAKE_SIZE: usize = 16 * 1024;

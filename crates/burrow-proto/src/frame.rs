//! Multiplexing frames for the session layer
//!
//! Every logical stream of a session is carried over one byte stream as a
//! sequence of frames:
//!
//! - 4 bytes: stream ID (big-endian u32)
//! - 1 byte: frame type (0=data, 1=go-away, 2=window-update)
//! - 1 byte: flags (SYN, FIN, RST)
//! - 4 bytes: payload length (big-endian u32)
//! - Rest: payload
//!
//! A window-update frame carries a 4-byte big-endian credit in its payload:
//! the number of additional bytes the receiver is prepared to buffer for
//! that stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::{MAX_FRAME_PAYLOAD, SESSION_STREAM_ID};

/// Stream identifier
pub type StreamId = u32;

/// Frame types for multiplexing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0,
    GoAway = 1,
    WindowUpdate = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::GoAway),
            2 => Ok(FrameType::WindowUpdate),
            _ => Err(FrameError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const SYN: u8 = 0b0000_0001;
    pub const FIN: u8 = 0b0000_0010;
    pub const RST: u8 = 0b0000_0100;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_syn(mut self) -> Self {
        self.0 |= Self::SYN;
        self
    }

    pub fn with_fin(mut self) -> Self {
        self.0 |= Self::FIN;
        self
    }

    pub fn with_rst(mut self) -> Self {
        self.0 |= Self::RST;
        self
    }

    pub fn has_syn(&self) -> bool {
        self.0 & Self::SYN != 0
    }

    pub fn has_fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn has_rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: stream_id (4) + frame_type (1) + flags (1) + length (4) = 10 bytes
    pub const HEADER_SIZE: usize = 10;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    /// Opens a stream on the peer
    pub fn syn(stream_id: StreamId) -> Self {
        Self::data(stream_id, Bytes::new()).with_flags(FrameFlags::new().with_syn())
    }

    /// Half-closes a stream: no more data will follow from this side
    pub fn fin(stream_id: StreamId) -> Self {
        Self::data(stream_id, Bytes::new()).with_flags(FrameFlags::new().with_fin())
    }

    /// Refuses or aborts a stream
    pub fn rst(stream_id: StreamId) -> Self {
        Self::data(stream_id, Bytes::new()).with_flags(FrameFlags::new().with_rst())
    }

    /// Announces that the session is shutting down
    pub fn go_away() -> Self {
        Self::new(SESSION_STREAM_ID, FrameType::GoAway, Bytes::new())
    }

    /// Grants the peer `delta` more bytes of send credit on a stream
    pub fn window_update(stream_id: StreamId, delta: u32) -> Self {
        Self::new(
            stream_id,
            FrameType::WindowUpdate,
            Bytes::copy_from_slice(&delta.to_be_bytes()),
        )
    }

    /// The credit carried by a window-update frame
    pub fn window_delta(&self) -> Option<u32> {
        if self.frame_type != FrameType::WindowUpdate {
            return None;
        }
        let bytes: [u8; 4] = self.payload.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Frame codec errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed frame codec for use with `FramedRead` / `FramedWrite`
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < Frame::HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &src[..Frame::HEADER_SIZE];
        let stream_id = header.get_u32();
        let frame_type = FrameType::try_from(header.get_u8())?;
        let flags = FrameFlags::from_u8(header.get_u8());
        let length = header.get_u32();

        if length > MAX_FRAME_PAYLOAD {
            return Err(FrameError::FrameTooLarge(length as usize));
        }

        let frame_len = Frame::HEADER_SIZE + length as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(Frame::HEADER_SIZE);
        let payload = src.split_to(length as usize).freeze();

        Ok(Some(Frame {
            stream_id,
            frame_type,
            flags,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = frame.payload.len();
        if payload_len > MAX_FRAME_PAYLOAD as usize {
            return Err(FrameError::FrameTooLarge(payload_len));
        }

        dst.reserve(Frame::HEADER_SIZE + payload_len);
        dst.put_u32(frame.stream_id);
        dst.put_u8(frame.frame_type as u8);
        dst.put_u8(frame.flags.as_u8());
        dst.put_u32(payload_len as u32);
        dst.put(frame.payload);

        Ok(())
    }
}

//! Frames and their wire representation, see the crate documentation for the format

use anyhow::bail;
use bytes::{BufMut, Bytes};
use crate::buffers::read_buffer::ReadBuffer;

pub mod tcp_frame;
pub mod ws_frame;

pub const MAX_IDENTIFIER_LENGTH: usize = 512;
pub const MAX_PAYLOAD_LENGTH: usize = 50 * 1024 * 1024;
/// frames up to this size are serialized on the stack and copied into the pipe in one go
pub const SAFE_STACK_BUFFER_SIZE: usize = 1024;

/// Prefix for identifiers of frames carrying codec-serialized values. It separates typed
///  handlers from raw handlers registered for the same user-visible identifier.
pub const SERIALIZE_PREFIX: &str = "#_#serialize#_#";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Sending,
    Receiving,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    /// `None` for raw frames
    identifier: Option<String>,
    payload: Bytes,
    raw_only: bool,
    direction: Direction,
}

impl Frame {
    pub fn new(identifier: impl Into<String>, payload: impl Into<Bytes>) -> Frame {
        Frame {
            identifier: Some(identifier.into()),
            payload: payload.into(),
            raw_only: false,
            direction: Direction::Sending,
        }
    }

    /// a frame that is sent as its payload without any header, used for handshakes
    pub fn raw(payload: impl Into<Bytes>) -> Frame {
        Frame {
            identifier: None,
            payload: payload.into(),
            raw_only: true,
            direction: Direction::Sending,
        }
    }

    pub(crate) fn received(identifier: String, payload: Bytes) -> Frame {
        Frame {
            identifier: Some(identifier),
            payload,
            raw_only: false,
            direction: Direction::Receiving,
        }
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn is_raw_only(&self) -> bool {
        self.raw_only
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// check a frame before it is queued for sending
    pub fn validate(&self, max_payload_size: usize) -> anyhow::Result<()> {
        if let Some(identifier) = &self.identifier {
            if identifier.len() > MAX_IDENTIFIER_LENGTH {
                bail!("identifier has {} bytes, the maximum is {}", identifier.len(), MAX_IDENTIFIER_LENGTH);
            }
        }
        if self.payload.len() > max_payload_size {
            bail!("payload has {} bytes, the maximum is {}", self.payload.len(), max_payload_size);
        }
        Ok(())
    }
}

/// Incremental parser for one connection's incoming frames. Implementations keep partial
///  progress between calls, so a frame may arrive in arbitrarily small pieces.
pub trait FrameReader: Send {
    /// Consume as much of `buf` as possible. Returns the next complete frame, or `None` if more
    ///  data is required. Bytes belonging to a field that is not complete yet may be left in
    ///  `buf` for the next call.
    ///
    /// Errors are fatal for the connection.
    fn read(&mut self, buf: &mut ReadBuffer) -> anyhow::Result<Option<Frame>>;
}

/// Creates frame readers and serializes frames for one wire format
pub trait FrameFactory: Send + Sync + 'static {
    fn create_reader(&self, max_payload_size: usize) -> Box<dyn FrameReader>;

    /// serialize a frame with identifier; raw frames are written by the caller
    fn write_frame(&self, frame: &Frame, out: &mut dyn BufMut);
}

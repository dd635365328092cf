//! The WebSocket envelope around the plain wire format (RFC 6455 section 5.2). Every frame is
//!  sent as a single unmasked binary WebSocket frame. Incoming binary and continuation frames
//!  are unmasked if necessary and fed into an inner [TcpFrameReader], so a frame may span
//!  several WebSocket frames and vice versa.

use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{debug, trace};
use crate::buffers::read_buffer::ReadBuffer;
use crate::error::{protocol_violation, PeerClosed};
use crate::protocol::tcp_frame::{TcpFrameFactory, TcpFrameReader};
use crate::protocol::{Frame, FrameFactory, FrameReader};
use crate::safe_converter::{PrecheckedCast, SafeCast};

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const OPCODE_MASK: u8 = 0x0f;
const LENGTH_MASK: u8 = 0x7f;

const LENGTH_U16_MARKER: u8 = 126;
const LENGTH_U64_MARKER: u8 = 127;
const MAX_INLINE_LENGTH: usize = 125;

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum WsOpcode {
    Continuation = 0,
    Text = 1,
    Binary = 2,
    Close = 8,
    Ping = 9,
    Pong = 10,
}

impl WsOpcode {
    fn is_control(&self) -> bool {
        matches!(self, WsOpcode::Close | WsOpcode::Ping | WsOpcode::Pong)
    }

    /// frames whose payload is part of the byte stream carrying our frames
    fn carries_data(&self) -> bool {
        matches!(self, WsOpcode::Binary | WsOpcode::Continuation)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WsFrameFactory;

impl WsFrameFactory {
    pub fn write_header<B: BufMut + ?Sized>(opcode: WsOpcode, len: usize, out: &mut B) {
        out.put_u8(FIN_BIT | u8::from(opcode));
        if len <= MAX_INLINE_LENGTH {
            out.put_u8(len.prechecked_cast());
        }
        else if len <= u16::MAX as usize {
            out.put_u8(LENGTH_U16_MARKER);
            out.put_u16(len.prechecked_cast());
        }
        else {
            out.put_u8(LENGTH_U64_MARKER);
            out.put_u64(len.safe_cast());
        }
    }
}

impl FrameFactory for WsFrameFactory {
    fn create_reader(&self, max_payload_size: usize) -> Box<dyn FrameReader> {
        Box::new(WsFrameReader::new(max_payload_size))
    }

    fn write_frame(&self, frame: &Frame, out: &mut dyn BufMut) {
        Self::write_header(WsOpcode::Binary, TcpFrameFactory::binary_size(frame), out);
        TcpFrameFactory.write_frame(frame, out);
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ReadStep {
    Header,
    ExtendedLength { num_bytes: usize },
    MaskingKey,
    Payload,
}

pub struct WsFrameReader {
    step: ReadStep,
    opcode: WsOpcode,
    is_masked: bool,
    masking_key: [u8; 4],
    /// position in the masking key for the next payload byte
    mask_offset: usize,
    /// payload bytes of the current WebSocket frame not consumed yet
    remaining: u64,
    /// unwrapped payload not consumed by the inner reader yet
    body: ReadBuffer,
    inner: TcpFrameReader,
}

impl WsFrameReader {
    pub fn new(max_payload_size: usize) -> WsFrameReader {
        WsFrameReader {
            step: ReadStep::Header,
            opcode: WsOpcode::Binary,
            is_masked: false,
            masking_key: [0; 4],
            mask_offset: 0,
            remaining: 0,
            body: ReadBuffer::new(),
            inner: TcpFrameReader::new(max_payload_size),
        }
    }

    fn after_length(&self) -> ReadStep {
        if self.is_masked {
            ReadStep::MaskingKey
        }
        else {
            ReadStep::Payload
        }
    }

    fn unmask(&mut self, data: &mut [u8]) {
        for b in data.iter_mut() {
            *b ^= self.masking_key[self.mask_offset];
            self.mask_offset = (self.mask_offset + 1) % 4;
        }
    }
}

impl FrameReader for WsFrameReader {
    fn read(&mut self, buf: &mut ReadBuffer) -> anyhow::Result<Option<Frame>> {
        loop {
            if !self.body.is_empty() {
                if let Some(frame) = self.inner.read(&mut self.body)? {
                    return Ok(Some(frame));
                }
            }

            match self.step {
                ReadStep::Header => {
                    if buf.remaining() < 2 {
                        return Ok(None);
                    }
                    let first = buf.get_u8();
                    let second = buf.get_u8();

                    let raw_opcode = first & OPCODE_MASK;
                    self.opcode = WsOpcode::try_from(raw_opcode)
                        .map_err(|_| protocol_violation(format!("unsupported WebSocket opcode {}", raw_opcode)))?;
                    self.is_masked = second & MASK_BIT != 0;
                    self.mask_offset = 0;

                    let len = second & LENGTH_MASK;
                    if self.opcode.is_control() && len > MAX_INLINE_LENGTH as u8 {
                        return Err(protocol_violation("WebSocket control frame payload exceeds 125 bytes"));
                    }
                    self.step = match len {
                        LENGTH_U16_MARKER => ReadStep::ExtendedLength { num_bytes: 2 },
                        LENGTH_U64_MARKER => ReadStep::ExtendedLength { num_bytes: 8 },
                        len => {
                            self.remaining = len.into();
                            self.after_length()
                        }
                    };
                    trace!("WebSocket frame header: opcode {:?}, fin {}, masked {}", self.opcode, first & FIN_BIT != 0, self.is_masked);
                }
                ReadStep::ExtendedLength { num_bytes } => {
                    if buf.remaining() < num_bytes {
                        return Ok(None);
                    }
                    self.remaining = if num_bytes == 2 {
                        buf.get_u16().into()
                    }
                    else {
                        buf.get_u64()
                    };
                    self.step = self.after_length();
                }
                ReadStep::MaskingKey => {
                    if buf.remaining() < 4 {
                        return Ok(None);
                    }
                    buf.copy_to_slice(&mut self.masking_key);
                    self.step = ReadStep::Payload;
                }
                ReadStep::Payload => {
                    let available = (buf.remaining() as u64).min(self.remaining) as usize;
                    if available == 0 && self.remaining > 0 {
                        return Ok(None);
                    }

                    if self.opcode.carries_data() {
                        let chunk = buf.copy_to_bytes(available);
                        if self.is_masked {
                            let mut unmasked = BytesMut::from(chunk.as_ref());
                            self.unmask(&mut unmasked);
                            self.body.push(unmasked.freeze());
                        }
                        else {
                            self.body.push(chunk);
                        }
                    }
                    else {
                        buf.advance(available);
                    }
                    self.remaining -= available as u64;

                    if self.remaining == 0 {
                        match self.opcode {
                            WsOpcode::Close => {
                                debug!("received WebSocket close frame");
                                return Err(PeerClosed.into());
                            }
                            WsOpcode::Ping | WsOpcode::Pong | WsOpcode::Text => {
                                debug!("skipped WebSocket {:?} frame", self.opcode);
                            }
                            _ => {}
                        }
                        self.step = ReadStep::Header;
                    }
                }
            }
        }
    }
}

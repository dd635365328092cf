use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;
use crate::buffers::read_buffer::ReadBuffer;
use crate::error::protocol_violation;
use crate::protocol::{Frame, FrameFactory, FrameReader, MAX_IDENTIFIER_LENGTH, SAFE_STACK_BUFFER_SIZE};
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// The plain length-prefixed wire format
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpFrameFactory;

impl TcpFrameFactory {
    /// number of bytes a frame occupies on the wire
    pub fn binary_size(frame: &Frame) -> usize {
        let identifier_len = frame.identifier().map(|i| i.len()).unwrap_or(0);
        4 + identifier_len + 4 + frame.payload().len()
    }

    /// NB: the frame must have been validated
    pub fn write_body<B: BufMut + ?Sized>(frame: &Frame, out: &mut B) {
        let identifier = frame.identifier().unwrap_or_default();
        out.put_u32(identifier.len().prechecked_cast());
        out.put_slice(identifier.as_bytes());
        out.put_u32(frame.payload().len().prechecked_cast());
        out.put_slice(frame.payload());
    }
}

impl FrameFactory for TcpFrameFactory {
    fn create_reader(&self, max_payload_size: usize) -> Box<dyn FrameReader> {
        Box::new(TcpFrameReader::new(max_payload_size))
    }

    fn write_frame(&self, frame: &Frame, out: &mut dyn BufMut) {
        let size = Self::binary_size(frame);
        if size <= SAFE_STACK_BUFFER_SIZE {
            let mut stack_buf = [0u8; SAFE_STACK_BUFFER_SIZE];
            let mut slot: &mut [u8] = &mut stack_buf[..size];
            Self::write_body(frame, &mut slot);
            out.put_slice(&stack_buf[..size]);
        }
        else {
            Self::write_body(frame, out);
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ReadStep {
    IdentifierLength,
    Identifier { len: usize },
    PayloadLength,
    Payload,
}

/// Resumable parser for the plain wire format
pub struct TcpFrameReader {
    step: ReadStep,
    identifier: Option<String>,
    /// payload bytes still missing
    remaining: usize,
    /// accumulates a payload that arrives in several pieces
    partial_payload: Option<BytesMut>,
    max_payload_size: usize,
}

impl TcpFrameReader {
    pub fn new(max_payload_size: usize) -> TcpFrameReader {
        TcpFrameReader {
            step: ReadStep::IdentifierLength,
            identifier: None,
            remaining: 0,
            partial_payload: None,
            max_payload_size,
        }
    }

    fn complete(&mut self, payload: Bytes) -> Frame {
        self.step = ReadStep::IdentifierLength;
        self.remaining = 0;
        let identifier = self.identifier.take().unwrap_or_default();
        trace!("received frame {:?} with {} bytes payload", identifier, payload.len());
        Frame::received(identifier, payload)
    }
}

impl FrameReader for TcpFrameReader {
    fn read(&mut self, buf: &mut ReadBuffer) -> anyhow::Result<Option<Frame>> {
        loop {
            match self.step {
                ReadStep::IdentifierLength => {
                    if buf.remaining() < 4 {
                        return Ok(None);
                    }
                    let len: usize = buf.get_u32().safe_cast();
                    if len > MAX_IDENTIFIER_LENGTH {
                        return Err(protocol_violation(format!("identifier length {} exceeds the maximum of {}", len, MAX_IDENTIFIER_LENGTH)));
                    }
                    self.step = ReadStep::Identifier { len };
                }
                ReadStep::Identifier { len } => {
                    if buf.remaining() < len {
                        return Ok(None);
                    }
                    let raw = buf.copy_to_bytes(len);
                    let identifier = std::str::from_utf8(&raw)
                        .map_err(|_| protocol_violation("identifier is not valid UTF-8"))?;
                    self.identifier = Some(identifier.to_string());
                    self.step = ReadStep::PayloadLength;
                }
                ReadStep::PayloadLength => {
                    if buf.remaining() < 4 {
                        return Ok(None);
                    }
                    let len: usize = buf.get_u32().safe_cast();
                    if len > self.max_payload_size {
                        return Err(protocol_violation(format!("payload length {} exceeds the maximum of {}", len, self.max_payload_size)));
                    }
                    self.remaining = len;
                    self.step = ReadStep::Payload;
                }
                ReadStep::Payload => {
                    let available = buf.remaining().min(self.remaining);
                    match self.partial_payload.take() {
                        None if available == self.remaining => {
                            let payload = buf.copy_to_bytes(available);
                            return Ok(Some(self.complete(payload)));
                        }
                        None => {
                            if available > 0 {
                                let mut partial = BytesMut::with_capacity(available);
                                partial.put((&mut *buf).take(available));
                                self.remaining -= available;
                                self.partial_payload = Some(partial);
                            }
                            return Ok(None);
                        }
                        Some(mut partial) => {
                            partial.put((&mut *buf).take(available));
                            self.remaining -= available;
                            if self.remaining == 0 {
                                return Ok(Some(self.complete(partial.freeze())));
                            }
                            self.partial_payload = Some(partial);
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }
}

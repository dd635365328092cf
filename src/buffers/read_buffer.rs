//! A read-only view of a sequence of byte segments, the unit in which pipes hand data to their
//!  readers.

use std::collections::VecDeque;
use std::io::IoSlice;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// An ordered sequence of [Bytes] segments, consumed through [Buf]. Cloning is cheap: it clones
///  the segment handles, not the data.
#[derive(Clone, Default, Debug)]
pub struct ReadBuffer {
    segments: VecDeque<Bytes>,
    remaining: usize,
}

impl ReadBuffer {
    pub fn new() -> ReadBuffer {
        Default::default()
    }

    pub fn push(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.remaining += segment.len();
        self.segments.push_back(segment);
    }

    pub fn len(&self) -> usize {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.remaining = 0;
    }

    pub fn segments(&self) -> impl Iterator<Item = &Bytes> {
        self.segments.iter()
    }

    /// the offset of the first occurrence of `needle`, looking at most at the first `limit` bytes
    pub fn find(&self, needle: &[u8], limit: usize) -> Option<usize> {
        let prefix = self.peek(limit);
        prefix.windows(needle.len())
            .position(|w| w == needle)
    }

    /// copy of the first `len` bytes (or fewer if the buffer is shorter), without consuming them
    pub fn peek(&self, len: usize) -> Vec<u8> {
        let mut result = Vec::with_capacity(len.min(self.remaining));
        for segment in &self.segments {
            let missing = len - result.len();
            if missing == 0 {
                break;
            }
            result.extend_from_slice(&segment[..missing.min(segment.len())]);
        }
        result
    }
}

impl From<Bytes> for ReadBuffer {
    fn from(value: Bytes) -> Self {
        let mut result = ReadBuffer::new();
        result.push(value);
        result
    }
}

impl From<&[u8]> for ReadBuffer {
    fn from(value: &[u8]) -> Self {
        Bytes::copy_from_slice(value).into()
    }
}

impl Buf for ReadBuffer {
    fn remaining(&self) -> usize {
        self.remaining
    }

    fn chunk(&self) -> &[u8] {
        match self.segments.front() {
            Some(segment) => segment.as_ref(),
            None => &[],
        }
    }

    fn chunks_vectored<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        let mut n = 0;
        for (slot, segment) in dst.iter_mut().zip(self.segments.iter()) {
            *slot = IoSlice::new(segment);
            n += 1;
        }
        n
    }

    fn advance(&mut self, mut cnt: usize) {
        assert!(cnt <= self.remaining, "advancing beyond the end of the buffer");
        while cnt > 0 {
            let Some(front) = self.segments.front_mut() else { break };
            if front.len() <= cnt {
                cnt -= front.len();
                self.remaining -= front.len();
                self.segments.pop_front();
            }
            else {
                front.advance(cnt);
                self.remaining -= cnt;
                cnt = 0;
            }
        }
    }

    /// zero-copy if the requested range is contained in a single segment
    fn copy_to_bytes(&mut self, len: usize) -> Bytes {
        assert!(len <= self.remaining, "copying beyond the end of the buffer");
        if let Some(front) = self.segments.front_mut() {
            if front.len() >= len {
                let result = front.split_to(len);
                if front.is_empty() {
                    self.segments.pop_front();
                }
                self.remaining -= len;
                return result;
            }
        }

        let mut result = BytesMut::with_capacity(len);
        result.put((&mut *self).take(len));
        result.freeze()
    }
}

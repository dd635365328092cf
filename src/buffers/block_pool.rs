//! Fixed-size memory blocks that back the pipes' segments. Blocks are rented from a pool and
//!  find their way back into it when they are dropped, which happens when the last [Bytes]
//!  view of a flushed segment is released.
//!
//! Blocks are kept initialized (zeroed once when they are created): they are reused
//!  aggressively, and we trade the overhead of initial initialization for simplicity.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use bytes::buf::UninitSlice;
use bytes::Bytes;
use crossbeam_queue::SegQueue;
use tracing::{debug, trace};

pub const BLOCK_SIZE: usize = 4096;

/// A lock-free pool of [BLOCK_SIZE] byte blocks. There is no upper bound on the number of pooled
///  blocks: the pool grows to the peak number of blocks in flight and stays there.
pub struct BlockPool {
    blocks: SegQueue<Box<[u8]>>,
}

impl BlockPool {
    pub fn new() -> Arc<BlockPool> {
        Arc::new(BlockPool {
            blocks: SegQueue::new(),
        })
    }

    pub fn rent(self: &Arc<Self>) -> PooledBlock {
        let buf = match self.blocks.pop() {
            Some(buf) => {
                trace!("renting block from pool");
                buf
            }
            None => {
                debug!("no block in pool: allocating new block");
                vec![0u8; BLOCK_SIZE].into_boxed_slice()
            }
        };

        PooledBlock {
            buf: Some(buf),
            len: 0,
            pool: self.clone(),
        }
    }

    /// the number of blocks currently available for renting
    pub fn num_pooled(&self) -> usize {
        self.blocks.len()
    }

    fn return_to_pool(&self, buf: Box<[u8]>) {
        trace!("returning block to pool");
        self.blocks.push(buf);
    }
}

/// A block rented from a [BlockPool], with a fill level. Data is appended through the
///  [bytes::BufMut] implementation, and [AsRef] exposes the filled part.
pub struct PooledBlock {
    /// always `Some` until the block is dropped
    buf: Option<Box<[u8]>>,
    len: usize,
    pool: Arc<BlockPool>,
}

impl PooledBlock {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        BLOCK_SIZE
    }

    pub fn spare_capacity(&self) -> usize {
        BLOCK_SIZE - self.len
    }

    /// the part of the block that was not written yet
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.raw_mut()[len..]
    }

    /// mark `cnt` bytes at the start of [PooledBlock::spare_mut] as written
    pub fn advance(&mut self, cnt: usize) {
        assert!(self.len + cnt <= BLOCK_SIZE, "advancing beyond the block's capacity");
        self.len += cnt;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// turn the filled part of the block into an immutable, shareable segment. The block returns
    ///  to the pool when the last clone of the segment is dropped.
    pub fn freeze(self) -> Bytes {
        Bytes::from_owner(self)
    }

    fn raw(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => &buf[..],
            None => &[],
        }
    }

    fn raw_mut(&mut self) -> &mut [u8] {
        match &mut self.buf {
            Some(buf) => &mut buf[..],
            None => &mut [],
        }
    }
}

impl Drop for PooledBlock {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.return_to_pool(buf);
        }
    }
}

impl PartialEq for PooledBlock {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for PooledBlock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl AsRef<[u8]> for PooledBlock {
    fn as_ref(&self) -> &[u8] {
        &self.raw()[..self.len]
    }
}

unsafe impl bytes::BufMut for PooledBlock {
    fn remaining_mut(&self) -> usize {
        BLOCK_SIZE - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        self.advance(cnt);
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(self.spare_mut())
    }
}

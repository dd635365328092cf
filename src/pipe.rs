//! Single-producer / single-consumer byte pipes with backpressure.
//!
//! The writer appends data into pooled blocks and makes it visible to the reader by flushing.
//!  When the amount of flushed but unconsumed data reaches the pause threshold, a flush suspends
//!  until the reader has consumed data down to the resume threshold. The reader sees all
//!  flushed, unconsumed data as a [ReadBuffer] and marks how much of it it consumed; unconsumed
//!  data is returned again by the next read, together with newly flushed data.
//!
//! Either side can complete the pipe. Completing the writer lets the reader drain the remaining
//!  data; completing the reader discards pending data and causes subsequent flushes to report
//!  completion.

use std::sync::{Arc, Mutex};
use bytes::buf::UninitSlice;
use bytes::{Buf, Bytes};
use tokio::sync::Notify;
use tracing::trace;
use crate::buffers::block_pool::{BlockPool, PooledBlock, BLOCK_SIZE};
use crate::buffers::read_buffer::ReadBuffer;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PipeOptions {
    /// a flush suspends if at least this many bytes are unconsumed; 0 disables backpressure
    pub pause_writer_threshold: usize,
    /// a suspended flush resumes once unconsumed data dropped to this many bytes
    pub resume_writer_threshold: usize,
}

impl PipeOptions {
    /// pause at `max_buffer_size`, resume at half of it
    pub fn with_max_buffer_size(max_buffer_size: usize) -> PipeOptions {
        PipeOptions {
            pause_writer_threshold: max_buffer_size,
            resume_writer_threshold: max_buffer_size / 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlushResult {
    /// the reader completed, no more data will be consumed
    pub is_completed: bool,
    pub is_canceled: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ReadResult {
    pub buffer: ReadBuffer,
    /// the writer completed: `buffer` holds all remaining data
    pub is_completed: bool,
    pub is_canceled: bool,
}

#[derive(Default)]
struct PipeState {
    unread: ReadBuffer,
    has_unexamined_data: bool,
    writer_completed: bool,
    reader_completed: bool,
    read_canceled: bool,
    flush_canceled: bool,
}

struct PipeShared {
    state: Mutex<PipeState>,
    data_available: Notify,
    space_available: Notify,
    options: PipeOptions,
}

pub fn pipe(pool: Arc<BlockPool>, options: PipeOptions) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(PipeShared {
        state: Default::default(),
        data_available: Notify::new(),
        space_available: Notify::new(),
        options,
    });

    let writer = PipeWriter {
        shared: shared.clone(),
        pool,
        current: None,
        staged: Vec::new(),
        unflushed: 0,
    };
    let reader = PipeReader {
        shared,
    };
    (writer, reader)
}

/// Completion and cancellation of a pipe's sides from outside the tasks owning them
#[derive(Clone)]
pub struct PipeControl {
    shared: Arc<PipeShared>,
}

impl PipeControl {
    pub fn complete_writer(&self) {
        self.shared.state.lock().unwrap().writer_completed = true;
        self.shared.data_available.notify_one();
    }

    pub fn complete_reader(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.reader_completed = true;
            state.unread.clear();
        }
        self.shared.space_available.notify_one();
    }

    /// a pending (or the next) flush returns with `is_canceled` set
    pub fn cancel_pending_flush(&self) {
        self.shared.state.lock().unwrap().flush_canceled = true;
        self.shared.space_available.notify_one();
    }

    /// a pending (or the next) read returns with `is_canceled` set
    pub fn cancel_pending_read(&self) {
        self.shared.state.lock().unwrap().read_canceled = true;
        self.shared.data_available.notify_one();
    }

    /// flushed data not consumed by the reader yet
    pub fn unread_len(&self) -> usize {
        self.shared.state.lock().unwrap().unread.len()
    }
}

pub struct PipeWriter {
    shared: Arc<PipeShared>,
    pool: Arc<BlockPool>,
    current: Option<PooledBlock>,
    staged: Vec<Bytes>,
    unflushed: usize,
}

impl PipeWriter {
    pub fn control(&self) -> PipeControl {
        PipeControl { shared: self.shared.clone() }
    }

    /// Writable memory of at least `min_size` bytes (capped at the block size), to be committed
    ///  with [PipeWriter::advance].
    pub fn get_memory(&mut self, min_size: usize) -> &mut [u8] {
        let min_size = min_size.clamp(1, BLOCK_SIZE);
        if self.current.as_ref().map(|b| b.spare_capacity() < min_size).unwrap_or(true) {
            self.stage_current();
            self.current = Some(self.pool.rent());
        }
        match &mut self.current {
            Some(block) => block.spare_mut(),
            None => &mut [],
        }
    }

    pub fn advance(&mut self, cnt: usize) {
        if cnt == 0 {
            return;
        }
        match &mut self.current {
            Some(block) => block.advance(cnt),
            None => panic!("advancing a pipe writer without memory"),
        }
        self.unflushed += cnt;
    }

    pub fn write(&mut self, data: &[u8]) {
        bytes::BufMut::put_slice(self, data);
    }

    /// number of bytes written but not flushed yet
    pub fn unflushed_len(&self) -> usize {
        self.unflushed
    }

    /// Make all written data visible to the reader, suspending while the reader is behind by
    ///  the pause threshold or more.
    pub async fn flush(&mut self) -> FlushResult {
        self.stage_current();

        {
            let mut state = self.shared.state.lock().unwrap();
            if state.reader_completed {
                self.staged.clear();
                self.unflushed = 0;
                return FlushResult { is_completed: true, is_canceled: false };
            }
            for segment in self.staged.drain(..) {
                state.unread.push(segment);
            }
            if self.unflushed > 0 {
                state.has_unexamined_data = true;
            }
        }
        if self.unflushed > 0 {
            self.unflushed = 0;
            self.shared.data_available.notify_one();
        }

        let options = self.shared.options;
        let mut suspended = false;
        loop {
            {
                let mut state = self.shared.state.lock().unwrap();
                if state.reader_completed {
                    return FlushResult { is_completed: true, is_canceled: false };
                }
                if state.flush_canceled {
                    state.flush_canceled = false;
                    return FlushResult { is_completed: false, is_canceled: true };
                }

                let unread = state.unread.len();
                let may_proceed = options.pause_writer_threshold == 0
                    || if suspended {
                        unread <= options.resume_writer_threshold
                    }
                    else {
                        unread < options.pause_writer_threshold
                    };
                if may_proceed {
                    return FlushResult::default();
                }
                if !suspended {
                    trace!("pipe reader is behind by {} bytes: suspending flush", unread);
                    suspended = true;
                }
            }
            self.shared.space_available.notified().await;
        }
    }

    /// no more data will be written; pending data is still readable
    pub fn complete(&mut self) {
        self.stage_current();
        {
            let mut state = self.shared.state.lock().unwrap();
            if !state.reader_completed {
                for segment in self.staged.drain(..) {
                    state.unread.push(segment);
                }
            }
            state.writer_completed = true;
        }
        self.staged.clear();
        self.unflushed = 0;
        self.shared.data_available.notify_one();
    }

    fn stage_current(&mut self) {
        if self.current.as_ref().map(|b| b.is_empty()).unwrap_or(true) {
            return;
        }
        if let Some(block) = self.current.take() {
            self.staged.push(block.freeze());
        }
    }
}

unsafe impl bytes::BufMut for PipeWriter {
    fn remaining_mut(&self) -> usize {
        usize::MAX - self.unflushed
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        self.advance(cnt);
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(self.get_memory(1))
    }
}

pub struct PipeReader {
    shared: Arc<PipeShared>,
}

impl PipeReader {
    pub fn control(&self) -> PipeControl {
        PipeControl { shared: self.shared.clone() }
    }

    /// Wait for data that was flushed after the previous read, for writer completion or for
    ///  cancellation. The returned buffer holds all unconsumed data.
    pub async fn read(&mut self) -> ReadResult {
        loop {
            {
                let mut state = self.shared.state.lock().unwrap();
                if state.read_canceled {
                    state.read_canceled = false;
                    return ReadResult {
                        buffer: state.unread.clone(),
                        is_completed: state.writer_completed,
                        is_canceled: true,
                    };
                }
                if state.has_unexamined_data || state.writer_completed {
                    state.has_unexamined_data = false;
                    return ReadResult {
                        buffer: state.unread.clone(),
                        is_completed: state.writer_completed,
                        is_canceled: false,
                    };
                }
            }
            self.shared.data_available.notified().await;
        }
    }

    /// mark the first `consumed` bytes of the previously returned buffer as consumed
    pub fn advance(&mut self, consumed: usize) {
        if consumed == 0 {
            return;
        }
        self.shared.state.lock().unwrap().unread.advance(consumed);
        self.shared.space_available.notify_one();
    }

    /// no more data will be read; pending and future data is discarded
    pub fn complete(&mut self) {
        self.control().complete_reader();
    }
}

/// The two ends of a bidirectional connection seen from one side: read the peer's data from
///  `input`, write data for the peer to `output`.
pub struct DuplexPipe {
    pub input: PipeReader,
    pub output: PipeWriter,
}

impl DuplexPipe {
    /// create two connected duplex pipes, typically one for the transport and one for the
    ///  application
    pub fn pair(pool: &Arc<BlockPool>, input_options: PipeOptions, output_options: PipeOptions) -> (DuplexPipe, DuplexPipe) {
        let (input_writer, input_reader) = pipe(pool.clone(), input_options);
        let (output_writer, output_reader) = pipe(pool.clone(), output_options);

        let transport = DuplexPipe {
            input: output_reader,
            output: input_writer,
        };
        let application = DuplexPipe {
            input: input_reader,
            output: output_writer,
        };
        (transport, application)
    }
}

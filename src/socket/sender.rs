use std::io;
use std::io::IoSlice;
use bytes::Buf;
use crossbeam_queue::ArrayQueue;
use tokio::net::TcpStream;
use tracing::trace;
use crate::buffers::read_buffer::ReadBuffer;

/// maximum number of segments passed to a single vectored write
const MAX_IO_SLICES: usize = 64;

/// Writes a segmented buffer to a socket, using vectored writes for multi-segment buffers.
///  Senders are reusable and pooled per I/O queue.
#[derive(Default)]
pub struct SocketSender {
    pending: ReadBuffer,
}

impl SocketSender {
    pub fn new() -> SocketSender {
        Default::default()
    }

    pub async fn send(&mut self, socket: &TcpStream, buffer: &ReadBuffer) -> io::Result<()> {
        self.pending.clear();
        for segment in buffer.segments() {
            self.pending.push(segment.clone());
        }

        while self.pending.has_remaining() {
            socket.writable().await?;

            let written = {
                let mut slices = [IoSlice::new(&[]); MAX_IO_SLICES];
                let num_slices = self.pending.chunks_vectored(&mut slices);
                if num_slices == 1 {
                    socket.try_write(self.pending.chunk())
                }
                else {
                    socket.try_write_vectored(&slices[..num_slices])
                }
            };
            match written {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    trace!("sent {} bytes", n);
                    self.pending.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.pending.clear();
    }
}

/// A bounded pool of [SocketSender]s: renting creates a new sender if the pool is empty, returned
///  senders are discarded if the pool is full.
pub struct SenderPool {
    senders: ArrayQueue<SocketSender>,
}

impl SenderPool {
    pub const DEFAULT_MAX_POOLED: usize = 2048;

    pub fn new(max_pooled: usize) -> SenderPool {
        SenderPool {
            senders: ArrayQueue::new(max_pooled),
        }
    }

    pub fn rent(&self) -> SocketSender {
        self.senders.pop()
            .unwrap_or_default()
    }

    pub fn return_to_pool(&self, mut sender: SocketSender) {
        sender.reset();
        if self.senders.push(sender).is_err() {
            trace!("sender pool is full: discarding returned sender");
        }
    }

    pub fn num_pooled(&self) -> usize {
        self.senders.len()
    }
}

impl Default for SenderPool {
    fn default() -> Self {
        SenderPool::new(Self::DEFAULT_MAX_POOLED)
    }
}

//! Connections are spread round-robin over a fixed number of I/O queues. Each queue has its own
//!  block pool and sender pool, which keeps pools small and contention low.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::debug;
use crate::buffers::block_pool::BlockPool;
use crate::config::ConnectionOptions;
use crate::pipe::PipeOptions;
use crate::socket::sender::SenderPool;

pub struct IoQueueSettings {
    pub block_pool: Arc<BlockPool>,
    /// the runtime that a connection's loops are spawned on
    pub scheduler: Handle,
    pub sender_pool: Arc<SenderPool>,
    pub input_options: PipeOptions,
    pub output_options: PipeOptions,
}

pub struct IoQueues {
    settings: Vec<Arc<IoQueueSettings>>,
    next: AtomicUsize,
}

impl IoQueues {
    pub fn new(options: &ConnectionOptions, scheduler: Handle) -> IoQueues {
        let count = options.io_queue_count.max(1);
        debug!("creating {} I/O queues", count);

        let settings = (0..count)
            .map(|_| Arc::new(IoQueueSettings {
                block_pool: BlockPool::new(),
                scheduler: scheduler.clone(),
                sender_pool: Arc::new(SenderPool::default()),
                input_options: PipeOptions::with_max_buffer_size(options.max_read_buffer_size),
                output_options: PipeOptions::with_max_buffer_size(options.max_write_buffer_size),
            }))
            .collect();

        IoQueues {
            settings,
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    /// the settings for the next connection, round-robin
    pub fn next(&self) -> Arc<IoQueueSettings> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.settings.len();
        self.settings[idx].clone()
    }
}

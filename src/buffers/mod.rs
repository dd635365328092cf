pub mod atomic_map;
pub mod block_pool;
pub mod read_buffer;

//! A byte-oriented message transport for TCP (optionally TLS-wrapped) and a WebSocket overlay.
//!
//! Two peers exchange either raw payloads or identifier-tagged messages over a persistent duplex
//!  connection. The crate is organized bottom-up:
//!
//! * pooled 4096 byte blocks ([buffers::block_pool]) back a pair of segmented byte pipes per
//!    connection ([pipe]) that apply backpressure in both directions
//! * a socket transport ([socket]) moves bytes between the socket and the pipes, one receive
//!    task and one send task per connection
//! * frame readers / writers ([protocol]) parse the pipe's input incrementally and serialize
//!    outgoing frames into the pipe's output
//! * [connection::Connection] ties transport, framing, handshake ([handshake]) and dispatch
//!    ([router]) together; [server::TcpServer] and [client::TcpClient] are the entry points
//!
//! ## Wire format
//!
//! All numbers in network byte order (BE):
//!
//! ```ascii
//! 0: identifier length (u32), at most 512
//! 4: identifier (UTF-8)
//! *: payload length (u32), at most the configured maximum payload size (default 50 MiB)
//! *: payload
//! ```
//!
//! Raw frames (used for handshake exchanges only) are sent as their payload without any header.
//!
//! ## WebSocket envelope
//!
//! The WebSocket variant wraps each frame above in a single RFC 6455 frame:
//!
//! ```ascii
//! 0: FIN bit (always set) | opcode (binary = 2)
//! 1: payload length: <= 125 inline, 126 + u16 or 127 + u64
//! *: 4 byte masking key if the mask bit is set (never set by this crate's writer)
//! *: the frame as described above
//! ```
//!
//! The handshake is a regular HTTP/1.1 upgrade exchange, see [handshake::ws].
//!
//! ## Structured messages
//!
//! Values sent through [connection::Connection::send_value] are serialized by a pluggable
//!  [codec::Codec] (JSON by default) and sent under the identifier prefixed with
//!  [protocol::SERIALIZE_PREFIX], so raw and typed handlers can share a user-visible identifier.

pub mod buffers;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod handshake;
pub mod io_queue;
pub mod pipe;
pub mod protocol;
pub mod router;
pub mod safe_converter;
pub mod server;
pub mod socket;
pub mod util;

#[cfg(test)]
mod test_util;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}

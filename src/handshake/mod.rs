//! Negotiation that happens on a connection before frames are exchanged. Until the handshake
//!  succeeded, incoming bytes are handed to the [Handshaker] instead of the frame reader.

use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use crate::buffers::read_buffer::ReadBuffer;

pub mod ws;

/// The part of a connection a handshake needs
#[cfg_attr(test, automock)]
pub trait RawSender: Send + Sync {
    /// send bytes as they are, without frame header
    fn send_raw(&self, payload: Bytes) -> anyhow::Result<()>;
}

pub trait Handshaker: Send + Sync + 'static {
    /// Called once when the connection is established. Returns `true` if the connection is
    ///  handshaked right away.
    fn start_handshake(&self, connection: &dyn RawSender) -> anyhow::Result<bool>;

    /// Called with all buffered incoming data while the handshake is pending. On success, the
    ///  handshake's bytes are consumed and `true` is returned. While more data is required,
    ///  nothing is consumed and `false` is returned. An error rejects the peer.
    fn handshake(&self, connection: &dyn RawSender, buf: &mut ReadBuffer) -> anyhow::Result<bool>;
}

/// No handshake: the connection is handshaked as soon as it is established
#[derive(Clone, Copy, Debug, Default)]
pub struct InstantHandshake;

impl Handshaker for InstantHandshake {
    fn start_handshake(&self, _connection: &dyn RawSender) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn handshake(&self, _connection: &dyn RawSender, _buf: &mut ReadBuffer) -> anyhow::Result<bool> {
        Ok(true)
    }
}

//! The HTTP/1.1 upgrade exchange that starts a WebSocket connection (RFC 6455 section 4).
//!
//! The client sends:
//!
//! ```ascii
//! GET / HTTP/1.1
//! Host: <host>
//! Connection: Upgrade
//! Upgrade: websocket
//! Sec-WebSocket-Version: 13
//! Sec-WebSocket-Key: <base64 of 16 random bytes>
//! ```
//!
//! and the server replies with `101 Switching Protocols`, proving that it understood the request
//!  by returning `base64(SHA1(key + GUID))` as `Sec-WebSocket-Accept`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Buf, Bytes};
use sha1::{Digest, Sha1};
use tracing::debug;
use crate::buffers::read_buffer::ReadBuffer;
use crate::error::protocol_violation;
use crate::handshake::{Handshaker, RawSender};
use crate::util::random::{websocket_key, RngRandom};

pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
/// upper bound for the number of headers in upgrade requests and responses
const MAX_HEADERS: usize = 32;

pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// the header block including the terminating empty line if it is complete
fn header_block_len(buf: &ReadBuffer) -> Option<usize> {
    buf.find(HEADER_TERMINATOR, buf.len())
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

#[derive(Clone, Debug)]
pub struct WsClientHandshake {
    host: String,
    path: String,
}

impl WsClientHandshake {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> WsClientHandshake {
        WsClientHandshake {
            host: host.into(),
            path: path.into(),
        }
    }

    pub fn upgrade_request(&self, key: &str) -> String {
        format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {}\r\n\r\n",
            self.path, self.host, key,
        )
    }
}

impl Handshaker for WsClientHandshake {
    fn start_handshake(&self, connection: &dyn RawSender) -> anyhow::Result<bool> {
        let key = websocket_key::<RngRandom>();
        debug!("sending WebSocket upgrade request");
        connection.send_raw(Bytes::from(self.upgrade_request(&key)))?;
        Ok(false)
    }

    /// The server's response is accepted as soon as its header block is complete. Status line
    ///  and accept key are not validated.
    fn handshake(&self, _connection: &dyn RawSender, buf: &mut ReadBuffer) -> anyhow::Result<bool> {
        let Some(len) = header_block_len(buf) else {
            return Ok(false);
        };

        let raw = buf.peek(len);
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&raw) {
            Ok(httparse::Status::Complete(_)) if response.code == Some(101) => {}
            Ok(_) => debug!("unexpected WebSocket upgrade response status {:?} {:?}", response.code, response.reason),
            Err(e) => debug!("malformed WebSocket upgrade response: {}", e),
        }
        buf.advance(len);
        Ok(true)
    }
}

/// Accepts upgrade requests for any path
#[derive(Clone, Copy, Debug, Default)]
pub struct WsServerHandshake;

impl WsServerHandshake {
    /// the `Sec-WebSocket-Key` of a well-formed upgrade request
    pub fn parse_request(request: &[u8]) -> anyhow::Result<String> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed.parse(request) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => return Err(protocol_violation("incomplete WebSocket upgrade request")),
            Err(e) => return Err(protocol_violation(format!("invalid WebSocket upgrade request: {}", e))),
        }

        if parsed.method != Some("GET") || parsed.version != Some(1) {
            return Err(protocol_violation(format!(
                "invalid WebSocket upgrade request line: {:?} {:?} HTTP/1.{:?}",
                parsed.method, parsed.path, parsed.version,
            )));
        }

        parsed.headers.iter()
            .find(|h| h.name.eq_ignore_ascii_case("Sec-WebSocket-Key"))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .ok_or_else(|| protocol_violation("WebSocket upgrade request without Sec-WebSocket-Key"))
    }

    pub fn upgrade_response(key: &str) -> String {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            compute_accept_key(key),
        )
    }
}

impl Handshaker for WsServerHandshake {
    fn start_handshake(&self, _connection: &dyn RawSender) -> anyhow::Result<bool> {
        Ok(false)
    }

    fn handshake(&self, connection: &dyn RawSender, buf: &mut ReadBuffer) -> anyhow::Result<bool> {
        let Some(len) = header_block_len(buf) else {
            return Ok(false);
        };

        let key = Self::parse_request(&buf.peek(len))?;

        debug!("accepting WebSocket upgrade");
        connection.send_raw(Bytes::from(Self::upgrade_response(&key)))?;
        buf.advance(len);
        Ok(true)
    }
}

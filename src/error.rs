use std::error::Error;
use std::fmt::{Display, Formatter};

/// Why a connection ended. The first reason recorded for a connection wins, later ones are
///  ignored.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ShutdownReason {
    /// The send loop ran to completion without recording an error
    SendLoopCompleted,
    /// The peer closed its side of the connection (FIN, reset, WebSocket close frame)
    PeerClosed,
    /// The connection was disconnected locally, e.g. through `disconnect()` or stopping a server
    LocalDisconnect,
    /// An I/O operation was aborted, typically racing with local disposal
    Aborted(String),
    /// The peer sent data violating the wire protocol or the handshake
    ProtocolViolation(String),
    Unexpected(String),
}

impl ShutdownReason {
    /// errors trigger an abortive close if the transport is configured for it
    pub fn is_error(&self) -> bool {
        matches!(self, ShutdownReason::ProtocolViolation(_) | ShutdownReason::Unexpected(_))
    }

    /// Derive a shutdown reason from an error returned by the connection's receive side
    pub fn from_error(e: &anyhow::Error) -> ShutdownReason {
        if let Some(violation) = e.downcast_ref::<ProtocolViolation>() {
            return ShutdownReason::ProtocolViolation(violation.0.clone());
        }
        if e.downcast_ref::<PeerClosed>().is_some() {
            return ShutdownReason::PeerClosed;
        }
        if let Some(io_error) = e.downcast_ref::<std::io::Error>() {
            return crate::socket::ErrorClass::shutdown_reason(io_error);
        }
        ShutdownReason::Unexpected(e.to_string())
    }
}

impl Display for ShutdownReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::SendLoopCompleted => write!(f, "send loop completed gracefully"),
            ShutdownReason::PeerClosed => write!(f, "connection closed by peer"),
            ShutdownReason::LocalDisconnect => write!(f, "disconnected locally"),
            ShutdownReason::Aborted(msg) => write!(f, "operation aborted: {}", msg),
            ShutdownReason::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            ShutdownReason::Unexpected(msg) => write!(f, "unexpected error: {}", msg),
        }
    }
}

/// Malformed or oversized data from the peer. This is fatal for the connection.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProtocolViolation(pub String);

impl Display for ProtocolViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "protocol violation: {}", self.0)
    }
}
impl Error for ProtocolViolation {}

pub fn protocol_violation(msg: impl Into<String>) -> anyhow::Error {
    ProtocolViolation(msg.into()).into()
}

/// The peer announced the end of the connection inside the protocol (WebSocket close frame)
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PeerClosed;

impl Display for PeerClosed {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer closed the connection")
    }
}
impl Error for PeerClosed {}

//! Transports move bytes between a network stream and a pair of pipes: a receive loop writes
//!  incoming data into the application's input pipe, a send loop writes the application's output
//!  pipe to the network. [SocketTransport] works directly on a TCP socket, [StreamTransport] on
//!  any async stream (TLS in particular).

use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use crate::error::ShutdownReason;
use crate::pipe::PipeControl;

pub mod endpoint;
pub mod receiver;
pub mod sender;
pub mod socket_transport;
pub mod stream_transport;

pub use socket_transport::SocketTransport;
pub use stream_transport::StreamTransport;

/// minimum size of the memory requested from the input pipe per socket read
pub const MIN_ALLOC_BUFFER_SIZE: usize = 2048;

/// upper bound for sending buffered output when a connection is disposed
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn peer_addr(&self) -> SocketAddr;

    fn shutdown_reason(&self) -> Option<ShutdownReason>;

    /// keep `reason` as the shutdown reason unless one was recorded before
    fn record_reason(&self, reason: ShutdownReason);

    /// Stop both loops and close the socket. Idempotent: only the first call has an effect,
    ///  and its reason is kept unless an earlier reason was recorded.
    fn shutdown(&self, reason: ShutdownReason);

    /// Drain pending output (bounded by [DRAIN_TIMEOUT]), shut down and wait for both loops to
    ///  terminate. `reason` is recorded unless a reason is present already. Idempotent.
    async fn dispose(&self, reason: ShutdownReason);
}

/// The three ways an I/O error can end a connection
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// the peer closed or reset the connection, which is a regular way for a connection to end
    Graceful,
    /// the operation was aborted locally, typically racing with disposal
    Aborted,
    Unexpected,
}

impl ErrorClass {
    pub fn classify(e: &io::Error) -> ErrorClass {
        use io::ErrorKind::*;

        match e.kind() {
            ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof | NotConnected => ErrorClass::Graceful,
            // InvalidInput: operations on a socket that is being disposed concurrently
            Interrupted | InvalidInput => ErrorClass::Aborted,
            _ => ErrorClass::Unexpected,
        }
    }

    pub fn shutdown_reason(e: &io::Error) -> ShutdownReason {
        match ErrorClass::classify(e) {
            ErrorClass::Graceful => ShutdownReason::PeerClosed,
            ErrorClass::Aborted => ShutdownReason::Aborted(e.to_string()),
            ErrorClass::Unexpected => ShutdownReason::Unexpected(e.to_string()),
        }
    }
}

#[derive(Default)]
struct ShutdownState {
    reason: Option<ShutdownReason>,
    is_shut_down: bool,
}

/// State and disposal logic shared by the transport implementations
pub(crate) struct TransportCore {
    peer_addr: SocketAddr,
    state: Mutex<ShutdownState>,
    /// stops both loops
    shutdown_token: CancellationToken,
    /// the pipe filled by the receive loop
    input: PipeControl,
    /// the pipe drained by the send loop
    output: PipeControl,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    send_task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportCore {
    pub fn new(peer_addr: SocketAddr, input: PipeControl, output: PipeControl) -> TransportCore {
        TransportCore {
            peer_addr,
            state: Default::default(),
            shutdown_token: CancellationToken::new(),
            input,
            output,
            receive_task: Default::default(),
            send_task: Default::default(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown_token
    }

    pub fn set_tasks(&self, receive_task: JoinHandle<()>, send_task: JoinHandle<()>) {
        *self.receive_task.lock().unwrap() = Some(receive_task);
        *self.send_task.lock().unwrap() = Some(send_task);
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.state.lock().unwrap().reason.clone()
    }

    /// record a reason without shutting down, unless a reason is already present
    pub fn record_reason(&self, reason: ShutdownReason) {
        let mut state = self.state.lock().unwrap();
        if state.reason.is_none() {
            debug!("recording shutdown reason for {:?}: {}", self.peer_addr, reason);
            state.reason = Some(reason);
        }
    }

    /// Marks the transport as shut down and returns the effective reason. Returns `None` if the
    ///  transport was shut down before, leaving the caller with nothing to do.
    pub fn begin_shutdown(&self, reason: ShutdownReason) -> Option<ShutdownReason> {
        let mut state = self.state.lock().unwrap();
        if state.is_shut_down {
            return None;
        }
        state.is_shut_down = true;
        Some(state.reason.get_or_insert(reason).clone())
    }

    /// stop the loops after the OS level shutdown
    pub fn finish_shutdown(&self) {
        self.shutdown_token.cancel();
        self.output.cancel_pending_read();
        self.input.cancel_pending_flush();
    }

    pub async fn dispose(&self, transport: &dyn Transport, reason: ShutdownReason) {
        self.record_reason(reason.clone());

        // the send loop drains buffered output before it terminates
        self.output.complete_writer();
        let send_task = self.send_task.lock().unwrap().take();
        if let Some(mut send_task) = send_task {
            if timeout(DRAIN_TIMEOUT, &mut send_task).await.is_err() {
                warn!("timeout draining output for {:?} - closing", self.peer_addr);
                transport.shutdown(ShutdownReason::Aborted("timeout draining output".to_string()));
                let _ = send_task.await;
            }
        }

        transport.shutdown(reason);
        self.input.complete_reader();

        let receive_task = self.receive_task.lock().unwrap().take();
        if let Some(receive_task) = receive_task {
            let _ = receive_task.await;
        }
        debug!("transport for {:?} disposed", self.peer_addr);
    }
}

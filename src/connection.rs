//! A connection ties a transport's duplex pipe to framing, handshake and dispatch. The same type
//!  serves accepted and dialed sockets.

use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use anyhow::{anyhow, bail};
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace, warn, Instrument, Span};
use crate::buffers::read_buffer::ReadBuffer;
use crate::codec::{Codec, JsonCodec};
use crate::error::{protocol_violation, ShutdownReason};
use crate::handshake::{Handshaker, RawSender};
use crate::pipe::{DuplexPipe, PipeReader, PipeWriter};
use crate::protocol::{Frame, FrameFactory, FrameReader, SERIALIZE_PREFIX};
use crate::router::FrameDispatcher;
use crate::socket::Transport;

/// the send loop flushes at the latest when this much output is buffered
pub const SEND_FLUSH_THRESHOLD: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Open,
    Closing,
    Closed,
    /// client side only: waiting for the reconnect interval to pass
    Reconnecting,
}

/// Callbacks into the server or client owning a connection
pub(crate) trait ConnectionObserver<C: Codec>: Send + Sync + 'static {
    fn on_handshaked(&self, connection: &Arc<Connection<C>>);

    /// called once at the start of teardown, before any I/O is shut down
    fn on_closing(&self, connection: &Arc<Connection<C>>);

    fn on_closed(&self, connection: &Arc<Connection<C>>);
}

/// Everything a running connection needs besides its transport
pub(crate) struct ConnectionContext<C: Codec> {
    pub handshaker: Arc<dyn Handshaker>,
    pub frame_factory: Arc<dyn FrameFactory>,
    pub dispatcher: Arc<dyn FrameDispatcher<C>>,
    pub observer: Arc<dyn ConnectionObserver<C>>,
    pub max_handshake_size: usize,
}

pub struct Connection<C: Codec = JsonCodec> {
    unique_id: String,
    peer_addr: SocketAddr,
    transport: Arc<dyn Transport>,
    codec: Arc<C>,
    max_payload_size: usize,
    outgoing: mpsc::UnboundedSender<Frame>,
    is_handshaked: AtomicBool,
    state: AtomicU8,
    /// triggered by `disconnect()` and by teardown, stops both of the connection's loops
    cancel: CancellationToken,
    /// triggered once when teardown is complete
    closed: CancellationToken,
}

impl <C: Codec> Connection<C> {
    /// `cancel` is usually a child token of the owning server's or client's token, so stopping
    ///  them disconnects the connection
    pub(crate) fn new(unique_id: String, transport: Arc<dyn Transport>, codec: Arc<C>, max_payload_size: usize, cancel: CancellationToken) -> (Arc<Connection<C>>, mpsc::UnboundedReceiver<Frame>) {
        let (outgoing, outgoing_receiver) = mpsc::unbounded_channel();
        let connection = Arc::new(Connection {
            unique_id,
            peer_addr: transport.peer_addr(),
            transport,
            codec,
            max_payload_size,
            outgoing,
            is_handshaked: AtomicBool::new(false),
            state: AtomicU8::new(ConnectionState::Connecting.into()),
            cancel,
            closed: CancellationToken::new(),
        });
        (connection, outgoing_receiver)
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::try_from(self.state.load(Ordering::Acquire))
            .unwrap_or(ConnectionState::Closed)
    }

    fn set_state(&self, state: ConnectionState) {
        trace!("connection {} is {:?}", self.unique_id, state);
        self.state.store(state.into(), Ordering::Release);
    }

    pub fn is_handshaked(&self) -> bool {
        self.is_handshaked.load(Ordering::Acquire)
    }

    /// `None` while the connection is alive
    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.transport.shutdown_reason()
    }

    /// Queue a frame for sending. This never blocks; frames are sent in the order they were
    ///  queued.
    pub fn send(&self, identifier: &str, payload: impl Into<Bytes>) -> anyhow::Result<()> {
        if identifier.starts_with(SERIALIZE_PREFIX) {
            bail!("identifier {:?} uses the reserved prefix {:?}", identifier, SERIALIZE_PREFIX);
        }
        self.enqueue(Frame::new(identifier, payload))
    }

    /// Serialize a value with the connection's codec and queue it for the handler registered
    ///  with `on_value` for the same identifier.
    pub fn send_value<T: Serialize + ?Sized>(&self, identifier: &str, value: &T) -> anyhow::Result<()> {
        if identifier.starts_with(SERIALIZE_PREFIX) {
            bail!("identifier {:?} uses the reserved prefix {:?}", identifier, SERIALIZE_PREFIX);
        }
        let payload = self.codec.serialize(value)?;
        self.enqueue(Frame::new(format!("{}{}", SERIALIZE_PREFIX, identifier), payload))
    }

    fn enqueue(&self, frame: Frame) -> anyhow::Result<()> {
        frame.validate(self.max_payload_size)?;
        if self.cancel.is_cancelled() {
            bail!("connection {} is closed", self.unique_id);
        }
        self.outgoing.send(frame)
            .map_err(|_| anyhow!("connection {} is closed", self.unique_id))
    }

    /// Start closing the connection. Frames that are still queued are dropped, data already
    ///  handed to the transport is sent. Returns immediately, see [Connection::closed].
    pub fn disconnect(&self) {
        if !self.cancel.is_cancelled() {
            debug!("disconnecting {}", self.unique_id);
            self.cancel.cancel();
        }
    }

    /// completes when the connection is closed and its resources are released
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Run the connection until it is closed: handshake, receive loop and (in a separate task)
    ///  send loop, followed by teardown.
    #[instrument(name="connection", skip_all, fields(conn = %self.unique_id, peer = ?self.peer_addr))]
    pub(crate) async fn run(self: Arc<Self>, pipe: DuplexPipe, outgoing: mpsc::UnboundedReceiver<Frame>, ctx: ConnectionContext<C>) {
        let DuplexPipe { mut input, output } = pipe;

        let send_task = tokio::spawn(
            self.clone().do_send(output, outgoing, ctx.frame_factory.clone())
                .instrument(Span::current())
        );

        self.set_state(ConnectionState::Handshaking);
        let result = match ctx.handshaker.start_handshake(&*self) {
            Ok(is_handshaked) => {
                if is_handshaked {
                    self.handshake_completed(&ctx);
                }
                self.receive_loop(&mut input, &ctx).await
            }
            Err(e) => Err(e),
        };
        input.complete();

        let reason = match result {
            Ok(()) if self.cancel.is_cancelled() => ShutdownReason::LocalDisconnect,
            Ok(()) => self.transport.shutdown_reason()
                .unwrap_or(ShutdownReason::PeerClosed),
            Err(e) => {
                let reason = ShutdownReason::from_error(&e);
                match &reason {
                    ShutdownReason::ProtocolViolation(_) => warn!("closing connection: {}", reason),
                    ShutdownReason::Unexpected(_) => error!("closing connection: {}", reason),
                    _ => debug!("closing connection: {}", reason),
                }
                reason
            }
        };

        self.set_state(ConnectionState::Closing);
        ctx.observer.on_closing(&self);

        // completing the output below ends the transport's send loop, which must not become the
        //  recorded reason
        self.transport.record_reason(reason.clone());
        if reason.is_error() {
            self.transport.shutdown(reason.clone());
        }
        self.cancel.cancel();
        let _ = send_task.await;
        self.transport.dispose(reason).await;

        self.set_state(ConnectionState::Closed);
        debug!("connection closed: {:?}", self.shutdown_reason());
        ctx.observer.on_closed(&self);
        self.closed.cancel();
    }

    fn handshake_completed(self: &Arc<Self>, ctx: &ConnectionContext<C>) {
        debug!("handshake completed");
        self.is_handshaked.store(true, Ordering::Release);
        self.set_state(ConnectionState::Open);
        ctx.observer.on_handshaked(self);
    }

    async fn receive_loop(self: &Arc<Self>, input: &mut PipeReader, ctx: &ConnectionContext<C>) -> anyhow::Result<()> {
        let mut reader = ctx.frame_factory.create_reader(self.max_payload_size);

        loop {
            let result = select! {
                r = input.read() => r,
                _ = self.cancel.cancelled() => return Ok(()),
            };

            let mut buffer = result.buffer;
            let available = buffer.len();
            self.process(&mut buffer, reader.as_mut(), ctx)?;
            input.advance(available - buffer.len());

            if result.is_completed || result.is_canceled {
                return Ok(());
            }
        }
    }

    /// Hand buffered input to the pending handshake, and to the frame reader once handshaked.
    ///  Whatever is not consumed stays in `buffer`.
    fn process(self: &Arc<Self>, buffer: &mut ReadBuffer, reader: &mut dyn FrameReader, ctx: &ConnectionContext<C>) -> anyhow::Result<()> {
        if !self.is_handshaked() {
            if !ctx.handshaker.handshake(&**self, buffer)? {
                if buffer.len() > ctx.max_handshake_size {
                    return Err(protocol_violation(format!("handshake exceeds {} bytes", ctx.max_handshake_size)));
                }
                return Ok(());
            }
            self.handshake_completed(ctx);
        }

        while let Some(frame) = reader.read(buffer)? {
            trace!("received frame {:?} with {} bytes", frame.identifier(), frame.payload().len());
            ctx.dispatcher.dispatch(frame, self);
        }
        Ok(())
    }

    async fn do_send(self: Arc<Self>, mut output: PipeWriter, mut outgoing: mpsc::UnboundedReceiver<Frame>, frame_factory: Arc<dyn FrameFactory>) {
        select! {
            _ = Self::send_loop(&mut output, &mut outgoing, frame_factory.as_ref()) => {}
            _ = self.cancel.cancelled() => {}
        }

        outgoing.close();
        let mut num_dropped = 0;
        while outgoing.try_recv().is_ok() {
            num_dropped += 1;
        }
        if num_dropped > 0 {
            debug!("dropped {} queued frames", num_dropped);
        }
        output.complete();
    }

    async fn send_loop(output: &mut PipeWriter, outgoing: &mut mpsc::UnboundedReceiver<Frame>, frame_factory: &dyn FrameFactory) {
        while let Some(frame) = outgoing.recv().await {
            Self::write_frame(output, &frame, frame_factory);

            // batch everything that is queued already into one flush
            while let Ok(frame) = outgoing.try_recv() {
                Self::write_frame(output, &frame, frame_factory);
                if output.unflushed_len() >= SEND_FLUSH_THRESHOLD {
                    break;
                }
            }

            let result = output.flush().await;
            if result.is_completed || result.is_canceled {
                debug!("output closed - stopping send loop");
                return;
            }
        }
    }

    fn write_frame(output: &mut PipeWriter, frame: &Frame, frame_factory: &dyn FrameFactory) {
        if frame.is_raw_only() {
            if frame.payload().is_empty() {
                trace!("skipping empty raw frame");
                return;
            }
            trace!("sending {} raw bytes", frame.payload().len());
            output.write(frame.payload());
        }
        else {
            trace!("sending frame {:?} with {} bytes", frame.identifier(), frame.payload().len());
            frame_factory.write_frame(frame, output);
        }
    }
}

impl <C: Codec> RawSender for Connection<C> {
    fn send_raw(&self, payload: Bytes) -> anyhow::Result<()> {
        self.enqueue(Frame::raw(payload))
    }
}

impl <C: Codec> Debug for Connection<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("unique_id", &self.unique_id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::runtime::Handle;
    use tokio::time::timeout;
    use crate::config::ConnectionOptions;
    use crate::handshake::InstantHandshake;
    use crate::io_queue::IoQueues;
    use crate::protocol::tcp_frame::TcpFrameFactory;
    use crate::router::MockFrameDispatcher;
    use crate::socket::StreamTransport;
    use crate::test_util::{test_connection, test_peer_addr, RecordingObserver};

    /// Starts a connection on one end of an in-memory stream and returns the other end
    fn start_connection(handshaker: Arc<dyn Handshaker>, dispatcher: MockFrameDispatcher<JsonCodec>, observer: Arc<RecordingObserver>) -> (Arc<Connection>, DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let settings = IoQueues::new(&ConnectionOptions::default(), Handle::current()).next();
        let (transport, pipe) = StreamTransport::start(local, test_peer_addr(), &settings);
        let (connection, outgoing) = Connection::new("conn-1".to_string(), transport, Arc::new(JsonCodec), 1024, CancellationToken::new());

        let ctx = ConnectionContext {
            handshaker,
            frame_factory: Arc::new(TcpFrameFactory),
            dispatcher: Arc::new(dispatcher),
            observer,
            max_handshake_size: 16,
        };
        tokio::spawn(connection.clone().run(pipe, outgoing, ctx));
        (connection, remote)
    }

    fn encoded(identifier: &str, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        TcpFrameFactory.write_frame(&Frame::new(identifier, payload.to_vec()), &mut buf);
        buf
    }

    /// completes a handshake once the peer sent `HELLO`
    struct HelloHandshake;
    impl Handshaker for HelloHandshake {
        fn start_handshake(&self, _connection: &dyn RawSender) -> anyhow::Result<bool> {
            Ok(false)
        }

        fn handshake(&self, connection: &dyn RawSender, buf: &mut ReadBuffer) -> anyhow::Result<bool> {
            if buf.len() < 5 {
                return Ok(false);
            }
            if buf.peek(5) != b"HELLO" {
                return Err(protocol_violation("not a hello"));
            }
            bytes::Buf::advance(buf, 5);
            connection.send_raw(Bytes::from_static(b"WELCOME"))?;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_dispatch_in_order() {
        let (sender, mut received) = mpsc::unbounded_channel();
        let mut dispatcher = MockFrameDispatcher::new();
        dispatcher.expect_dispatch()
            .times(2)
            .returning(move |frame, _| sender.send(frame).unwrap());

        let observer = Arc::new(RecordingObserver::default());
        let (connection, mut remote) = start_connection(Arc::new(InstantHandshake), dispatcher, observer.clone());

        let mut data = encoded("A", b"first");
        data.extend_from_slice(&encoded("B", b"second"));
        remote.write_all(&data).await.unwrap();

        let a = received.recv().await.unwrap();
        let b = received.recv().await.unwrap();
        assert_eq!((a.identifier(), a.payload().as_ref()), (Some("A"), &b"first"[..]));
        assert_eq!((b.identifier(), b.payload().as_ref()), (Some("B"), &b"second"[..]));
        assert!(connection.is_handshaked());
        assert_eq!(connection.state(), ConnectionState::Open);

        connection.disconnect();
        timeout(Duration::from_secs(5), connection.closed()).await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(connection.shutdown_reason(), Some(ShutdownReason::LocalDisconnect));
        assert_eq!(observer.events(), vec!["handshaked", "closing", "closed"]);
    }

    #[tokio::test]
    async fn test_send_order() {
        let observer = Arc::new(RecordingObserver::default());
        let (connection, mut remote) = start_connection(Arc::new(InstantHandshake), MockFrameDispatcher::new(), observer);

        connection.send("A", Bytes::from_static(b"1")).unwrap();
        connection.send("B", Bytes::from_static(b"")).unwrap();
        connection.send_raw(Bytes::new()).unwrap();
        connection.send_value("C", &vec![1, 2]).unwrap();

        let mut expected = encoded("A", b"1");
        expected.extend_from_slice(&encoded("B", b""));
        expected.extend_from_slice(&encoded(&format!("{}C", SERIALIZE_PREFIX), b"[1,2]"));

        let mut actual = vec![0u8; expected.len()];
        timeout(Duration::from_secs(5), remote.read_exact(&mut actual)).await.unwrap().unwrap();
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn test_handshake_gating() {
        let (sender, mut received) = mpsc::unbounded_channel();
        let mut dispatcher = MockFrameDispatcher::new();
        dispatcher.expect_dispatch()
            .times(1)
            .returning(move |frame, _| sender.send(frame).unwrap());

        let observer = Arc::new(RecordingObserver::default());
        let (connection, mut remote) = start_connection(Arc::new(HelloHandshake), dispatcher, observer.clone());

        // a frame is sent before the handshake, it must not reach the dispatcher
        remote.write_all(b"HEL").await.unwrap();
        connection.send("early", Bytes::from_static(b"x")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!connection.is_handshaked());
        assert_eq!(connection.state(), ConnectionState::Handshaking);
        assert!(observer.events().is_empty());

        let mut data = b"LO".to_vec();
        data.extend_from_slice(&encoded("after", b"y"));
        remote.write_all(&data).await.unwrap();

        let frame = received.recv().await.unwrap();
        assert_eq!(frame.identifier(), Some("after"));
        assert!(connection.is_handshaked());
        assert_eq!(observer.events(), vec!["handshaked"]);

        let mut expected = encoded("early", b"x");
        expected.extend_from_slice(b"WELCOME");
        let mut actual = vec![0u8; expected.len()];
        timeout(Duration::from_secs(5), remote.read_exact(&mut actual)).await.unwrap().unwrap();
        assert_eq!(actual, expected);
    }

    /// never completes
    struct PendingHandshake;
    impl Handshaker for PendingHandshake {
        fn start_handshake(&self, _connection: &dyn RawSender) -> anyhow::Result<bool> {
            Ok(false)
        }

        fn handshake(&self, _connection: &dyn RawSender, _buf: &mut ReadBuffer) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_handshake_too_long() {
        let observer = Arc::new(RecordingObserver::default());
        let (connection, mut remote) = start_connection(Arc::new(PendingHandshake), MockFrameDispatcher::new(), observer.clone());

        remote.write_all(&[b'x'; 16]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!connection.is_closed());

        remote.write_all(b"x").await.unwrap();
        timeout(Duration::from_secs(5), connection.closed()).await.unwrap();
        assert!(!connection.is_handshaked());
        assert!(matches!(connection.shutdown_reason(), Some(ShutdownReason::ProtocolViolation(_))));
        assert_eq!(observer.events(), vec!["closing", "closed"]);
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let observer = Arc::new(RecordingObserver::default());
        let (connection, mut remote) = start_connection(Arc::new(HelloHandshake), MockFrameDispatcher::new(), observer);

        remote.write_all(b"GOODBYE").await.unwrap();
        timeout(Duration::from_secs(5), connection.closed()).await.unwrap();
        assert_eq!(connection.shutdown_reason(), Some(ShutdownReason::ProtocolViolation("not a hello".to_string())));
    }

    #[tokio::test]
    async fn test_protocol_violation() {
        let observer = Arc::new(RecordingObserver::default());
        let (connection, mut remote) = start_connection(Arc::new(InstantHandshake), MockFrameDispatcher::new(), observer);

        // identifier length beyond the maximum
        remote.write_all(&[0, 0, 0x10, 0]).await.unwrap();
        timeout(Duration::from_secs(5), connection.closed()).await.unwrap();
        assert!(matches!(connection.shutdown_reason(), Some(ShutdownReason::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_peer_close() {
        let observer = Arc::new(RecordingObserver::default());
        let (connection, remote) = start_connection(Arc::new(InstantHandshake), MockFrameDispatcher::new(), observer.clone());

        drop(remote);
        timeout(Duration::from_secs(5), connection.closed()).await.unwrap();
        assert_eq!(connection.shutdown_reason(), Some(ShutdownReason::PeerClosed));
        assert!(connection.send("x", Bytes::new()).is_err());
        assert_eq!(observer.events(), vec!["handshaked", "closing", "closed"]);
    }

    #[tokio::test]
    async fn test_send_validation() {
        let (connection, mut outgoing) = test_connection();
        assert!(connection.send(&format!("{}x", SERIALIZE_PREFIX), Bytes::new()).is_err());
        assert!(connection.send("x", vec![0u8; 2000]).is_err());
        assert!(connection.send("x", vec![0u8; 10]).is_ok());
        assert_eq!(outgoing.try_recv().unwrap().payload().len(), 10);

        connection.disconnect();
        assert!(connection.send("x", vec![0u8; 10]).is_err());
    }

    #[test]
    fn test_state_repr() {
        for state in [ConnectionState::Connecting, ConnectionState::Handshaking, ConnectionState::Open, ConnectionState::Closing, ConnectionState::Closed, ConnectionState::Reconnecting] {
            let raw: u8 = state.into();
            assert_eq!(ConnectionState::try_from(raw).unwrap(), state);
        }
    }
}

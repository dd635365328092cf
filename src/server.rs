use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::{anyhow, bail};
use bytes::Bytes;
use rustc_hash::FxHashSet;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use crate::buffers::atomic_map::AtomicMap;
use crate::codec::{Codec, JsonCodec};
use crate::config::{ServerConfig, TransportKind};
use crate::connection::{Connection, ConnectionContext, ConnectionObserver};
use crate::events::{ConnectionEvent, EventNotifier};
use crate::io_queue::{IoQueueSettings, IoQueues};
use crate::pipe::DuplexPipe;
use crate::router::Router;
use crate::socket::endpoint::bind_listener;
use crate::socket::{ErrorClass, SocketTransport, StreamTransport, Transport};
use crate::util::random::{unique_id, RngRandom};

/// pause after an unexpected accept error, e.g. when running out of file descriptors
pub const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Accepts connections and keeps track of the live (i.e. handshaked) ones. The server is
///  started and stopped explicitly, and it can be restarted after it was stopped.
pub struct TcpServer<C: Codec = JsonCodec> {
    inner: Arc<ServerInner<C>>,
}

struct RunState {
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

struct ServerInner<C: Codec> {
    config: ServerConfig,
    scheduler: Handle,
    codec: Arc<C>,
    router: Arc<Router<C>>,
    events: EventNotifier<C>,
    io_queues: IoQueues,
    tls_acceptor: Option<TlsAcceptor>,
    connections: AtomicMap<String, Arc<Connection<C>>>,
    /// ids of accepted connections that did not complete their handshake yet
    reserved_ids: Mutex<FxHashSet<String>>,
    run_state: Mutex<Option<RunState>>,
}

impl TcpServer<JsonCodec> {
    /// Must be called from within a tokio runtime, which is used for all of the server's tasks
    pub fn new(config: ServerConfig) -> anyhow::Result<TcpServer<JsonCodec>> {
        TcpServer::with_codec(config, JsonCodec)
    }
}

impl <C: Codec> TcpServer<C> {
    pub fn with_codec(config: ServerConfig, codec: C) -> anyhow::Result<TcpServer<C>> {
        config.validate()?;
        let scheduler = Handle::try_current()
            .map_err(|_| anyhow!("a server must be created inside a tokio runtime"))?;

        let codec = Arc::new(codec);
        let tls_acceptor = config.tls_config.clone()
            .map(TlsAcceptor::from);

        debug!("creating server: {:?}", config);
        Ok(TcpServer {
            inner: Arc::new(ServerInner {
                io_queues: IoQueues::new(&config.connection_options, scheduler.clone()),
                router: Arc::new(Router::new(codec.clone(), scheduler.clone())),
                config,
                scheduler,
                codec,
                events: EventNotifier::new(),
                tls_acceptor,
                connections: AtomicMap::new(),
                reserved_ids: Default::default(),
                run_state: Default::default(),
            })
        })
    }

    /// register a handler for raw payloads sent with [Connection::send]
    pub fn on<F>(&self, identifier: &str, handler: F) -> anyhow::Result<()>
    where F: Fn(Bytes, &Arc<Connection<C>>) + Send + Sync + 'static
    {
        self.inner.router.on(identifier, handler)
    }

    /// register a handler for values sent with [Connection::send_value]
    pub fn on_value<T, F>(&self, identifier: &str, handler: F) -> anyhow::Result<()>
    where
        T: DeserializeOwned,
        F: Fn(T, &Arc<Connection<C>>) + Send + Sync + 'static,
    {
        self.inner.router.on_value(identifier, handler)
    }

    /// register an async handler for raw payloads, see [Router::on_async]
    pub fn on_async<F, Fut>(&self, identifier: &str, handler: F) -> anyhow::Result<()>
    where
        F: Fn(Bytes, Arc<Connection<C>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.router.on_async(identifier, handler)
    }

    pub fn on_value_async<T, F, Fut>(&self, identifier: &str, handler: F) -> anyhow::Result<()>
    where
        T: DeserializeOwned,
        F: Fn(T, Arc<Connection<C>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.router.on_value_async(identifier, handler)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent<C>> {
        self.inner.events.subscribe()
    }

    /// Bind the listening socket and start accepting connections. Returns the address the server
    ///  listens on. Calling this on a running server has no effect.
    pub fn start(&self) -> anyhow::Result<SocketAddr> {
        let mut run_state = self.inner.run_state.lock().unwrap();
        if let Some(state) = run_state.as_ref() {
            debug!("server is running already");
            return Ok(state.local_addr);
        }

        let listener = {
            let _guard = self.inner.scheduler.enter();
            bind_listener(self.inner.config.bind_addr()?)?
        };
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let accept_task = self.inner.scheduler.spawn(
            self.inner.clone().accept_loop(listener, cancel.clone())
                .instrument(info_span!("server", addr = ?local_addr))
        );

        info!("server started on {:?}", local_addr);
        *run_state = Some(RunState {
            cancel,
            accept_task,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Stop accepting, close the listening socket and disconnect all connections. Returns when
    ///  the live connections are closed. Calling this on a stopped server has no effect.
    pub async fn stop(&self) {
        let run_state = self.inner.run_state.lock().unwrap().take();
        let Some(run_state) = run_state else {
            debug!("server is not running");
            return;
        };

        run_state.cancel.cancel();
        let _ = run_state.accept_task.await;

        let connections = self.inner.connections.clear();
        for connection in connections.values() {
            connection.disconnect();
        }
        for connection in connections.values() {
            connection.closed().await;
        }
        info!("server on {:?} stopped, {} connections closed", run_state.local_addr, connections.len());
    }

    pub fn is_running(&self) -> bool {
        self.inner.run_state.lock().unwrap().is_some()
    }

    /// the actual listening address while the server is running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.run_state.lock().unwrap()
            .as_ref()
            .map(|s| s.local_addr)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn connection(&self, unique_id: &str) -> Option<Arc<Connection<C>>> {
        self.inner.connections.get(unique_id)
    }

    pub fn connections(&self) -> Vec<Arc<Connection<C>>> {
        self.inner.connections.load()
            .values()
            .cloned()
            .collect()
    }

    /// Send a frame to every live connection, returning the number of connections it was queued
    ///  for. Connections that are closing are skipped.
    pub fn broadcast(&self, identifier: &str, payload: impl Into<Bytes>) -> anyhow::Result<usize> {
        let payload = payload.into();
        self.broadcast_with(|connection| connection.send(identifier, payload.clone()))
    }

    pub fn broadcast_value<T: Serialize + ?Sized>(&self, identifier: &str, value: &T) -> anyhow::Result<usize> {
        self.broadcast_with(|connection| connection.send_value(identifier, value))
    }

    fn broadcast_with(&self, send: impl Fn(&Arc<Connection<C>>) -> anyhow::Result<()>) -> anyhow::Result<usize> {
        let connections = self.inner.connections.load();
        let mut num_sent = 0;
        for connection in connections.values() {
            match send(connection) {
                Ok(()) => num_sent += 1,
                Err(e) if connection.is_closed() || connection.shutdown_reason().is_some() => {
                    debug!("skipping closing connection {}: {}", connection.unique_id(), e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(num_sent)
    }
}

impl <C: Codec> Drop for TcpServer<C> {
    fn drop(&mut self) {
        if let Some(run_state) = self.inner.run_state.lock().unwrap().take() {
            debug!("server dropped while running - stopping");
            run_state.cancel.cancel();
        }
    }
}

impl <C: Codec> ServerInner<C> {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            let accepted = select! {
                r = listener.accept() => r,
                _ = cancel.cancelled() => break,
            };

            match accepted {
                Ok((socket, peer_addr)) => self.on_accepted(socket, peer_addr, &cancel),
                Err(e) => match ErrorClass::classify(&e) {
                    ErrorClass::Unexpected => {
                        warn!("error accepting connection: {}", e);
                        sleep(ACCEPT_ERROR_DELAY).await;
                    }
                    _ => debug!("accepting connection failed: {}", e),
                }
            }
        }
        debug!("accept loop stopped");
    }

    fn on_accepted(self: &Arc<Self>, socket: TcpStream, peer_addr: SocketAddr, server_cancel: &CancellationToken) {
        let unique_id = self.reserve_id();
        debug!("accepted connection {} from {:?}", unique_id, peer_addr);

        let settings = self.io_queues.next();
        let cancel = server_cancel.child_token();
        let server = self.clone();
        settings.scheduler.clone().spawn(async move {
            if let Err(e) = server.serve(socket, peer_addr, unique_id.clone(), settings, cancel).await {
                debug!("failed to set up connection {}: {:#}", unique_id, e);
                server.reserved_ids.lock().unwrap().remove(&unique_id);
            }
        }.instrument(info_span!("accept", peer = ?peer_addr)));
    }

    /// a random id that is neither used by a live connection nor by a pending handshake
    fn reserve_id(&self) -> String {
        let mut reserved = self.reserved_ids.lock().unwrap();
        let connections = self.connections.load();
        let id = unique_id::<RngRandom>(|id| reserved.contains(id) || connections.contains_key(id));
        reserved.insert(id.clone());
        id
    }

    async fn serve(self: &Arc<Self>, socket: TcpStream, peer_addr: SocketAddr, unique_id: String, settings: Arc<IoQueueSettings>, cancel: CancellationToken) -> anyhow::Result<()> {
        let (transport, pipe) = self.start_transport(socket, peer_addr, &settings, &cancel).await?;
        let options = &self.config.connection_options;
        let (connection, outgoing) = Connection::new(unique_id, transport, self.codec.clone(), options.max_payload_size, cancel);

        let ctx = ConnectionContext {
            handshaker: self.config.handshaker.clone(),
            frame_factory: self.config.frame_factory.clone(),
            dispatcher: self.router.clone(),
            observer: self.clone(),
            max_handshake_size: options.max_handshake_size,
        };
        connection.run(pipe, outgoing, ctx).await;
        Ok(())
    }

    async fn start_transport(&self, socket: TcpStream, peer_addr: SocketAddr, settings: &IoQueueSettings, cancel: &CancellationToken) -> anyhow::Result<(Arc<dyn Transport>, DuplexPipe)> {
        match self.config.effective_transport_kind() {
            TransportKind::SecureStream => {
                let Some(acceptor) = &self.tls_acceptor else {
                    bail!("secure transport without TLS configuration");
                };
                let stream = select! {
                    r = timeout(self.config.tls_handshake_timeout, acceptor.accept(socket)) => match r {
                        Ok(stream) => stream?,
                        Err(_) => bail!("TLS handshake timed out after {:?}", self.config.tls_handshake_timeout),
                    },
                    _ = cancel.cancelled() => bail!("server stopped during TLS handshake"),
                };
                let (transport, pipe) = StreamTransport::start(stream, peer_addr, settings);
                Ok((transport as Arc<dyn Transport>, pipe))
            }
            TransportKind::Stream => {
                let (transport, pipe) = StreamTransport::start(socket, peer_addr, settings);
                Ok((transport as Arc<dyn Transport>, pipe))
            }
            TransportKind::Socket | TransportKind::Auto => {
                let (transport, pipe) = SocketTransport::start(socket, settings, self.config.connection_options.wait_for_data, self.config.fin_on_error)?;
                Ok((transport as Arc<dyn Transport>, pipe))
            }
        }
    }
}

impl <C: Codec> ConnectionObserver<C> for ServerInner<C> {
    fn on_handshaked(&self, connection: &Arc<Connection<C>>) {
        let unique_id = connection.unique_id().to_string();
        self.reserved_ids.lock().unwrap().remove(&unique_id);

        debug!("connection {} from {:?} is live", unique_id, connection.peer_addr());
        self.connections.update(|connections| connections.insert(unique_id, connection.clone()));
        self.events.send_event(ConnectionEvent::Connected(connection.clone()));
    }

    fn on_closing(&self, connection: &Arc<Connection<C>>) {
        let unique_id = connection.unique_id();
        self.reserved_ids.lock().unwrap().remove(unique_id);
        if self.connections.update(|connections| connections.remove(unique_id).is_some()) {
            debug!("removed connection {}", unique_id);
        }
    }

    fn on_closed(&self, connection: &Arc<Connection<C>>) {
        if connection.is_handshaked() {
            self.events.send_event(ConnectionEvent::Disconnected(connection.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use rstest::rstest;
    use serde::Deserialize;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use crate::client::TcpClient;
    use crate::config::{ClientConfig, ConnectionOptions};
    use crate::protocol::tcp_frame::TcpFrameFactory;
    use crate::protocol::{Frame, FrameFactory};
    use crate::socket::endpoint::connect;
    use crate::test_util::wait_until;

    const MAX_WAIT: Duration = Duration::from_secs(5);

    fn server_config(kind: TransportKind) -> ServerConfig {
        let mut config = ServerConfig::new("127.0.0.1", 0);
        config.transport_kind = kind;
        config.connection_options = ConnectionOptions {
            io_queue_count: 2,
            ..Default::default()
        };
        config
    }

    fn client_config(port: u16) -> ClientConfig {
        let mut config = ClientConfig::new("127.0.0.1", port);
        config.reconnect_interval = Duration::from_millis(100);
        config.connection_options.io_queue_count = 1;
        config
    }

    fn encoded(identifier: &str, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        TcpFrameFactory.write_frame(&Frame::new(identifier, payload.to_vec()), &mut buf);
        buf
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let server = TcpServer::new(server_config(TransportKind::Auto)).unwrap();
        let (sender, mut received) = mpsc::unbounded_channel();
        server.on("ping", move |payload, _| sender.send(payload).unwrap()).unwrap();

        server.stop().await;
        assert!(!server.is_running());

        let addr = server.start().unwrap();
        assert_eq!(server.start().unwrap(), addr);
        assert_eq!(server.local_addr(), Some(addr));

        server.stop().await;
        server.stop().await;
        assert!(!server.is_running());
        assert_eq!(server.local_addr(), None);
        assert!(connect(addr).await.is_err());

        let addr = server.start().unwrap();
        let mut socket = connect(addr).await.unwrap();
        socket.write_all(&encoded("ping", b"after restart")).await.unwrap();
        let payload = timeout(MAX_WAIT, received.recv()).await.unwrap().unwrap();
        assert_eq!(payload.as_ref(), b"after restart");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_config() {
        assert!(TcpServer::new(ServerConfig::new("localhost", 0)).is_err());

        let mut config = ServerConfig::new("127.0.0.1", 0);
        config.connection_options.io_queue_count = 0;
        assert!(TcpServer::new(config).is_err());
    }

    #[test]
    fn test_requires_runtime() {
        assert!(TcpServer::new(ServerConfig::new("127.0.0.1", 0)).is_err());
    }

    #[rstest]
    #[case::socket(TransportKind::Socket)]
    #[case::stream(TransportKind::Stream)]
    #[tokio::test]
    async fn test_bytes_arrive_intact(#[case] kind: TransportKind) {
        let server = TcpServer::new(server_config(kind)).unwrap();
        let (sender, mut received) = mpsc::unbounded_channel();
        server.on("test-bytes", move |payload, connection| {
            sender.send((payload, connection.unique_id().to_string())).unwrap();
        }).unwrap();
        let mut events = server.subscribe();
        let addr = server.start().unwrap();

        let client = TcpClient::new(client_config(addr.port())).unwrap();
        client.connect();
        let connected = timeout(MAX_WAIT, events.recv()).await.unwrap().unwrap();
        assert!(matches!(connected, ConnectionEvent::Connected(_)));
        wait_until(MAX_WAIT, || client.is_connected()).await;

        client.send("test-bytes", vec![0u8, 2, 3, 5]).unwrap();
        let (payload, unique_id) = timeout(MAX_WAIT, received.recv()).await.unwrap().unwrap();
        assert_eq!(payload.as_ref(), &[0u8, 2, 3, 5]);
        assert_eq!(unique_id, connected.connection().unique_id());
        assert_eq!(server.connection_count(), 1);
        assert!(server.connection(&unique_id).is_some());

        client.disconnect().await;
        let disconnected = timeout(MAX_WAIT, events.recv()).await.unwrap().unwrap();
        assert!(matches!(disconnected, ConnectionEvent::Disconnected(_)));
        assert_eq!(server.connection_count(), 0);

        server.stop().await;
    }

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    struct Greeting {
        text: String,
    }

    #[tokio::test]
    async fn test_request_response() {
        let server = TcpServer::new(server_config(TransportKind::Auto)).unwrap();
        server.on_value("greet", |greeting: Greeting, connection| {
            connection.send_value("greet", &Greeting { text: format!("{} back", greeting.text) }).unwrap();
        }).unwrap();
        let addr = server.start().unwrap();

        let client = TcpClient::new(client_config(addr.port())).unwrap();
        let (sender, mut received) = mpsc::unbounded_channel();
        client.on_value("greet", move |greeting: Greeting, _| sender.send(greeting).unwrap()).unwrap();
        client.connect();
        wait_until(MAX_WAIT, || client.is_connected()).await;

        client.send_value("greet", &Greeting { text: "hello".to_string() }).unwrap();
        let response = timeout(MAX_WAIT, received.recv()).await.unwrap().unwrap();
        assert_eq!(response, Greeting { text: "hello back".to_string() });

        client.disconnect().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_async_handlers() {
        let server = TcpServer::new(server_config(TransportKind::Auto)).unwrap();
        server.on_value_async("greet", |greeting: Greeting, connection| async move {
            sleep(Duration::from_millis(20)).await;
            connection.send("greeted", greeting.text.into_bytes()).unwrap();
        }).unwrap();
        let addr = server.start().unwrap();

        let client = TcpClient::new(client_config(addr.port())).unwrap();
        let (sender, mut received) = mpsc::unbounded_channel();
        client.on_async("greeted", move |payload, _| {
            let sender = sender.clone();
            async move { sender.send(payload).unwrap(); }
        }).unwrap();
        client.connect();
        wait_until(MAX_WAIT, || client.is_connected()).await;

        client.send_value("greet", &Greeting { text: "hello".to_string() }).unwrap();
        let payload = timeout(MAX_WAIT, received.recv()).await.unwrap().unwrap();
        assert_eq!(payload.as_ref(), b"hello");

        client.disconnect().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast() {
        let server = TcpServer::new(server_config(TransportKind::Auto)).unwrap();
        let addr = server.start().unwrap();

        let (sender, mut received) = mpsc::unbounded_channel();
        let mut clients = Vec::new();
        for _ in 0..3 {
            let client = TcpClient::new(client_config(addr.port())).unwrap();
            let sender = sender.clone();
            client.on("news", move |payload, _| sender.send(payload).unwrap()).unwrap();
            client.connect();
            clients.push(client);
        }
        wait_until(MAX_WAIT, || server.connection_count() == 3).await;
        for client in &clients {
            wait_until(MAX_WAIT, || client.is_connected()).await;
        }

        assert_eq!(server.broadcast("news", Bytes::from_static(b"extra")).unwrap(), 3);
        for _ in 0..3 {
            let payload = timeout(MAX_WAIT, received.recv()).await.unwrap().unwrap();
            assert_eq!(payload.as_ref(), b"extra");
        }

        for client in &clients {
            client.disconnect().await;
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn test_server_side_disconnect() {
        let server = TcpServer::new(server_config(TransportKind::Auto)).unwrap();
        server.on("bye", |_, connection| connection.disconnect()).unwrap();
        let mut events = server.subscribe();
        let addr = server.start().unwrap();

        let mut socket = connect(addr).await.unwrap();
        let connected = timeout(MAX_WAIT, events.recv()).await.unwrap().unwrap();
        socket.write_all(&encoded("bye", b"")).await.unwrap();

        let disconnected = timeout(MAX_WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(disconnected.connection().unique_id(), connected.connection().unique_id());
        assert_eq!(disconnected.connection().shutdown_reason(), Some(crate::error::ShutdownReason::LocalDisconnect));
        assert_eq!(server.connection_count(), 0);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_protocol_violation_keeps_server_running() {
        let server = TcpServer::new(server_config(TransportKind::Auto)).unwrap();
        let (sender, mut received) = mpsc::unbounded_channel();
        server.on("ok", move |payload, _| sender.send(payload).unwrap()).unwrap();
        let addr = server.start().unwrap();

        let mut bad = connect(addr).await.unwrap();
        bad.write_all(&[0xff, 0xff, 0xff, 0xff]).await.unwrap();
        wait_until(MAX_WAIT, || server.connection_count() == 0).await;

        let mut good = connect(addr).await.unwrap();
        good.write_all(&encoded("ok", b"still accepting")).await.unwrap();
        let payload = timeout(MAX_WAIT, received.recv()).await.unwrap().unwrap();
        assert_eq!(payload.as_ref(), b"still accepting");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_websocket() {
        let mut config = ServerConfig::websocket("127.0.0.1", 0);
        config.connection_options.io_queue_count = 1;
        let server = TcpServer::new(config).unwrap();
        server.on("echo", |payload, connection| connection.send("echo", payload).unwrap()).unwrap();
        let addr = server.start().unwrap();

        let mut client_config = ClientConfig::websocket("127.0.0.1", addr.port());
        client_config.connection_options.io_queue_count = 1;
        let client = TcpClient::new(client_config).unwrap();
        let (sender, mut received) = mpsc::unbounded_channel();
        client.on("echo", move |payload, _| sender.send(payload).unwrap()).unwrap();
        client.connect();
        wait_until(MAX_WAIT, || client.is_connected()).await;

        let large = (0..100_000u32).map(|i| i as u8).collect::<Vec<_>>();
        client.send("echo", Bytes::from_static(b"small")).unwrap();
        client.send("echo", large.clone()).unwrap();

        assert_eq!(timeout(MAX_WAIT, received.recv()).await.unwrap().unwrap().as_ref(), b"small");
        assert_eq!(timeout(MAX_WAIT, received.recv()).await.unwrap().unwrap().as_ref(), &large[..]);

        client.disconnect().await;
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_clients_disconnected_by_server() {
        const NUM_CLIENTS: usize = 150;

        let server = TcpServer::new(server_config(TransportKind::Auto)).unwrap();
        let num_received = Arc::new(AtomicUsize::new(0));
        let num_received_clone = num_received.clone();
        server.on("hello", move |_, _| {
            num_received_clone.fetch_add(1, Ordering::SeqCst);
        }).unwrap();
        let mut events = server.subscribe();
        let addr = server.start().unwrap();

        let disconnecter = tokio::spawn(async move {
            let mut num_disconnected = 0;
            while num_disconnected < NUM_CLIENTS {
                match events.recv().await {
                    Ok(ConnectionEvent::Connected(connection)) => {
                        tokio::spawn(async move {
                            sleep(Duration::from_millis(300)).await;
                            connection.disconnect();
                        });
                    }
                    Ok(ConnectionEvent::Disconnected(_)) => num_disconnected += 1,
                    Err(e) => panic!("lost events: {}", e),
                }
            }
        });

        let mut sockets = Vec::new();
        for i in 0..NUM_CLIENTS {
            let mut socket = connect(addr).await.unwrap();
            socket.write_all(&encoded("hello", format!("client {}", i).as_bytes())).await.unwrap();
            sockets.push(socket);
        }

        timeout(Duration::from_secs(20), disconnecter).await.unwrap().unwrap();
        assert_eq!(server.connection_count(), 0);
        assert_eq!(num_received.load(Ordering::SeqCst), NUM_CLIENTS);

        server.stop().await;
    }
}

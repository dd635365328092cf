use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use anyhow::{anyhow, bail};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use crate::codec::{Codec, JsonCodec};
use crate::config::{ClientConfig, TransportKind};
use crate::connection::{Connection, ConnectionContext, ConnectionObserver, ConnectionState};
use crate::events::{ConnectionEvent, EventNotifier};
use crate::io_queue::{IoQueueSettings, IoQueues};
use crate::pipe::DuplexPipe;
use crate::router::Router;
use crate::socket::endpoint::connect;
use crate::socket::{SocketTransport, StreamTransport, Transport};
use crate::util::random::{unique_id, RngRandom};

/// Keeps one connection to a server, reconnecting after the configured interval whenever the
///  connection is lost, until [TcpClient::disconnect] is called.
pub struct TcpClient<C: Codec = JsonCodec> {
    inner: Arc<ClientInner<C>>,
}

struct RunState {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct ClientInner<C: Codec> {
    config: ClientConfig,
    server_addr: SocketAddr,
    scheduler: Handle,
    codec: Arc<C>,
    router: Arc<Router<C>>,
    events: EventNotifier<C>,
    io_queues: IoQueues,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    connection: Mutex<Option<Arc<Connection<C>>>>,
    /// state while there is no current connection
    state: AtomicU8,
    run_state: Mutex<Option<RunState>>,
}

impl TcpClient<JsonCodec> {
    /// Must be called from within a tokio runtime, which is used for all of the client's tasks
    pub fn new(config: ClientConfig) -> anyhow::Result<TcpClient<JsonCodec>> {
        TcpClient::with_codec(config, JsonCodec)
    }
}

impl <C: Codec> TcpClient<C> {
    pub fn with_codec(config: ClientConfig, codec: C) -> anyhow::Result<TcpClient<C>> {
        config.validate()?;
        let server_addr = config.server_addr()?;
        let scheduler = Handle::try_current()
            .map_err(|_| anyhow!("a client must be created inside a tokio runtime"))?;

        let tls = match &config.tls_config {
            Some(tls_config) => {
                let server_name = ServerName::try_from(config.host_name())?;
                Some((TlsConnector::from(tls_config.clone()), server_name))
            }
            None => None,
        };

        let codec = Arc::new(codec);
        debug!("creating client: {:?}", config);
        Ok(TcpClient {
            inner: Arc::new(ClientInner {
                io_queues: IoQueues::new(&config.connection_options, scheduler.clone()),
                router: Arc::new(Router::new(codec.clone(), scheduler.clone())),
                config,
                server_addr,
                scheduler,
                codec,
                events: EventNotifier::new(),
                tls,
                connection: Default::default(),
                state: AtomicU8::new(ConnectionState::Closed.into()),
                run_state: Default::default(),
            })
        })
    }

    pub fn on<F>(&self, identifier: &str, handler: F) -> anyhow::Result<()>
    where F: Fn(Bytes, &Arc<Connection<C>>) + Send + Sync + 'static
    {
        self.inner.router.on(identifier, handler)
    }

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

    /// Start connecting in the background. Calling this while the client is connecting or
    ///  connected has no effect.
    pub fn connect(&self) {
        let mut run_state = self.inner.run_state.lock().unwrap();
        if run_state.is_some() {
            debug!("client is connecting or connected already");
            return;
        }

        let cancel = CancellationToken::new();
        let task = self.inner.scheduler.spawn(
            self.inner.clone().run_loop(cancel.clone())
                .instrument(info_span!("client", server = ?self.inner.server_addr))
        );
        *run_state = Some(RunState { cancel, task });
    }

    /// Close the current connection and stop reconnecting. Returns when the connection is
    ///  closed. Calling this on a disconnected client has no effect.
    pub async fn disconnect(&self) {
        let run_state = self.inner.run_state.lock().unwrap().take();
        let Some(run_state) = run_state else {
            debug!("client is not connected");
            return;
        };

        run_state.cancel.cancel();
        let _ = run_state.task.await;
        info!("disconnected from {:?}", self.inner.server_addr);
    }

    /// the current connection, which may still be handshaking
    pub fn connection(&self) -> Option<Arc<Connection<C>>> {
        self.inner.connection.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection()
            .map(|c| c.state() == ConnectionState::Open)
            .unwrap_or(false)
    }

    pub fn state(&self) -> ConnectionState {
        match self.connection() {
            Some(connection) => connection.state(),
            None => self.inner.state(),
        }
    }

    pub fn send(&self, identifier: &str, payload: impl Into<Bytes>) -> anyhow::Result<()> {
        self.open_connection()?.send(identifier, payload)
    }

    pub fn send_value<T: Serialize + ?Sized>(&self, identifier: &str, value: &T) -> anyhow::Result<()> {
        self.open_connection()?.send_value(identifier, value)
    }

    fn open_connection(&self) -> anyhow::Result<Arc<Connection<C>>> {
        match self.connection() {
            Some(connection) if connection.is_handshaked() => Ok(connection),
            _ => bail!("not connected to {:?}", self.inner.server_addr),
        }
    }
}

impl <C: Codec> Drop for TcpClient<C> {
    fn drop(&mut self) {
        if let Some(run_state) = self.inner.run_state.lock().unwrap().take() {
            debug!("client dropped while connected - disconnecting");
            run_state.cancel.cancel();
        }
    }
}

impl <C: Codec> ClientInner<C> {
    fn state(&self) -> ConnectionState {
        ConnectionState::try_from(self.state.load(Ordering::Acquire))
            .unwrap_or(ConnectionState::Closed)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.into(), Ordering::Release);
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            self.set_state(ConnectionState::Connecting);
            if let Err(e) = self.connect_once(&cancel).await {
                warn!("connection to {:?} failed: {:#}", self.server_addr, e);
            }
            if cancel.is_cancelled() {
                break;
            }

            self.set_state(ConnectionState::Reconnecting);
            debug!("reconnecting in {:?}", self.config.reconnect_interval);
            select! {
                _ = sleep(self.config.reconnect_interval) => {}
                _ = cancel.cancelled() => break,
            }
        }
        self.set_state(ConnectionState::Closed);
        debug!("client loop stopped");
    }

    /// runs a single connection until it is closed
    async fn connect_once(self: &Arc<Self>, cancel: &CancellationToken) -> anyhow::Result<()> {
        let socket = select! {
            r = connect(self.server_addr) => r?,
            _ = cancel.cancelled() => return Ok(()),
        };
        let settings = self.io_queues.next();
        let Some((transport, pipe)) = self.start_transport(socket, &settings, cancel).await? else {
            return Ok(());
        };

        let options = &self.config.connection_options;
        let (connection, outgoing) = Connection::new(unique_id::<RngRandom>(|_| false), transport, self.codec.clone(), options.max_payload_size, cancel.child_token());
        *self.connection.lock().unwrap() = Some(connection.clone());

        let ctx = ConnectionContext {
            handshaker: self.config.handshaker.clone(),
            frame_factory: self.config.frame_factory.clone(),
            dispatcher: self.router.clone(),
            observer: self.clone(),
            max_handshake_size: options.max_handshake_size,
        };
        settings.scheduler.spawn(connection.run(pipe, outgoing, ctx).in_current_span()).await?;
        Ok(())
    }

    /// `None` if the client was disconnected during a TLS handshake
    async fn start_transport(&self, socket: TcpStream, settings: &IoQueueSettings, cancel: &CancellationToken) -> anyhow::Result<Option<(Arc<dyn Transport>, DuplexPipe)>> {
        match self.config.effective_transport_kind() {
            TransportKind::SecureStream => {
                let Some((connector, server_name)) = &self.tls else {
                    bail!("secure transport without TLS configuration");
                };
                let peer_addr = socket.peer_addr()?;
                let stream = select! {
                    r = timeout(self.config.tls_handshake_timeout, connector.connect(server_name.clone(), socket)) => match r {
                        Ok(stream) => stream?,
                        Err(_) => bail!("TLS handshake timed out after {:?}", self.config.tls_handshake_timeout),
                    },
                    _ = cancel.cancelled() => return Ok(None),
                };
                let (transport, pipe) = StreamTransport::start(stream, peer_addr, settings);
                Ok(Some((transport as Arc<dyn Transport>, pipe)))
            }
            TransportKind::Stream => {
                let peer_addr = socket.peer_addr()?;
                let (transport, pipe) = StreamTransport::start(socket, peer_addr, settings);
                Ok(Some((transport as Arc<dyn Transport>, pipe)))
            }
            TransportKind::Socket | TransportKind::Auto => {
                let (transport, pipe) = SocketTransport::start(socket, settings, self.config.connection_options.wait_for_data, false)?;
                Ok(Some((transport as Arc<dyn Transport>, pipe)))
            }
        }
    }
}

impl <C: Codec> ConnectionObserver<C> for ClientInner<C> {
    fn on_handshaked(&self, connection: &Arc<Connection<C>>) {
        info!("connected to {:?}", self.server_addr);
        self.events.send_event(ConnectionEvent::Connected(connection.clone()));
    }

    fn on_closing(&self, connection: &Arc<Connection<C>>) {
        let mut current = self.connection.lock().unwrap();
        if current.as_ref().map(|c| Arc::ptr_eq(c, connection)).unwrap_or(false) {
            *current = None;
        }
    }

    fn on_closed(&self, connection: &Arc<Connection<C>>) {
        if connection.is_handshaked() {
            info!("connection to {:?} closed: {:?}", self.server_addr, connection.shutdown_reason());
            self.events.send_event(ConnectionEvent::Disconnected(connection.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use crate::config::ServerConfig;
    use crate::server::TcpServer;
    use crate::test_util::wait_until;

    const MAX_WAIT: Duration = Duration::from_secs(5);

    fn client_config(port: u16) -> ClientConfig {
        let mut config = ClientConfig::new("127.0.0.1", port);
        config.reconnect_interval = Duration::from_millis(100);
        config.connection_options.io_queue_count = 1;
        config
    }

    #[tokio::test]
    async fn test_invalid_config() {
        assert!(TcpClient::new(ClientConfig::new("127.0.0.1", 0)).is_err());
        assert!(TcpClient::new(ClientConfig::new("localhost", 1234)).is_err());
    }

    #[tokio::test]
    async fn test_send_when_not_connected() {
        let client = TcpClient::new(client_config(1234)).unwrap();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(!client.is_connected());
        assert!(client.send("x", Bytes::new()).is_err());
        assert!(client.send_value("x", &1).is_err());
    }

    #[tokio::test]
    async fn test_reconnect() {
        // reserve a port, then release it so that the first attempts are refused
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = TcpClient::new(client_config(port)).unwrap();
        let mut events = client.subscribe();
        client.connect();
        client.connect();
        wait_until(MAX_WAIT, || client.state() == ConnectionState::Reconnecting).await;

        let mut server_config = ServerConfig::new("127.0.0.1", port);
        server_config.connection_options.io_queue_count = 1;
        let server = TcpServer::new(server_config).unwrap();
        server.start().unwrap();

        let connected = timeout(MAX_WAIT, events.recv()).await.unwrap().unwrap();
        assert!(matches!(connected, ConnectionEvent::Connected(_)));
        assert!(client.is_connected());

        // losing the connection triggers a reconnect
        server.stop().await;
        let disconnected = timeout(MAX_WAIT, events.recv()).await.unwrap().unwrap();
        assert!(matches!(disconnected, ConnectionEvent::Disconnected(_)));
        server.start().unwrap();
        let reconnected = timeout(MAX_WAIT, events.recv()).await.unwrap().unwrap();
        assert!(matches!(reconnected, ConnectionEvent::Connected(_)));
        assert_ne!(reconnected.connection().unique_id(), connected.connection().unique_id());

        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(client.connection().is_none());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_while_reconnecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = client_config(port);
        config.reconnect_interval = Duration::from_secs(3600);
        let client = TcpClient::new(config).unwrap();
        client.connect();
        wait_until(MAX_WAIT, || client.state() == ConnectionState::Reconnecting).await;

        timeout(MAX_WAIT, client.disconnect()).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_disconnect_closes_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpClient::new(client_config(listener.local_addr().unwrap().port())).unwrap();
        client.connect();

        let (mut socket, _) = timeout(MAX_WAIT, listener.accept()).await.unwrap().unwrap();
        wait_until(MAX_WAIT, || client.is_connected()).await;
        client.disconnect().await;

        let mut buf = [0u8; 16];
        let n = timeout(MAX_WAIT, socket.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
    }
}

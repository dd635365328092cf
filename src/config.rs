use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, bail};
use tokio_rustls::rustls;
use crate::handshake::ws::{WsClientHandshake, WsServerHandshake};
use crate::handshake::{Handshaker, InstantHandshake};
use crate::protocol::tcp_frame::TcpFrameFactory;
use crate::protocol::ws_frame::WsFrameFactory;
use crate::protocol::{FrameFactory, MAX_PAYLOAD_LENGTH};

pub const DEFAULT_MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_WRITE_BUFFER_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_HANDSHAKE_SIZE: usize = 2 * 1024;
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_IO_QUEUE_COUNT: usize = 16;

/// How bytes are moved between a connection's socket and its pipes
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TransportKind {
    /// [TransportKind::SecureStream] if TLS is configured, [TransportKind::Socket] otherwise
    #[default]
    Auto,
    /// a generic async stream over the plain socket
    Stream,
    /// TLS over the socket
    SecureStream,
    /// the pooled socket transport with vectored sends
    Socket,
}

/// Settings shared by the server and the client side of connections
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionOptions {
    /// number of I/O queues that connections are spread over round-robin
    pub io_queue_count: usize,
    /// backpressure threshold for data received but not parsed yet; 0 disables backpressure
    pub max_read_buffer_size: usize,
    /// backpressure threshold for serialized data not sent yet; 0 disables backpressure
    pub max_write_buffer_size: usize,
    /// maximum payload length accepted on the receive path
    pub max_payload_size: usize,
    /// maximum number of bytes buffered while a handshake is pending
    pub max_handshake_size: usize,
    /// Wait for the socket to become readable before renting receive memory. This saves
    ///  memory for idle connections at the price of an extra system call per receive. Only
    ///  applies to [TransportKind::Socket].
    pub wait_for_data: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        ConnectionOptions {
            io_queue_count: parallelism.min(MAX_IO_QUEUE_COUNT),
            max_read_buffer_size: DEFAULT_MAX_READ_BUFFER_SIZE,
            max_write_buffer_size: DEFAULT_MAX_WRITE_BUFFER_SIZE,
            max_payload_size: MAX_PAYLOAD_LENGTH,
            max_handshake_size: DEFAULT_MAX_HANDSHAKE_SIZE,
            wait_for_data: true,
        }
    }
}

impl ConnectionOptions {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.io_queue_count == 0 {
            bail!("at least one I/O queue is required");
        }
        if self.max_payload_size > u32::MAX as usize {
            bail!("maximum payload size {} does not fit the wire format's 32 bit length field", self.max_payload_size);
        }
        if self.max_handshake_size == 0 {
            bail!("maximum handshake size must be positive");
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ServerConfig {
    /// an IP address literal; `::` listens dual-stack on all interfaces
    pub address: String,
    /// 0 binds an ephemeral port, see [crate::server::TcpServer::local_addr]
    pub port: u16,
    pub tls_config: Option<Arc<rustls::ServerConfig>>,
    pub tls_handshake_timeout: Duration,
    pub transport_kind: TransportKind,
    pub connection_options: ConnectionOptions,
    pub handshaker: Arc<dyn Handshaker>,
    pub frame_factory: Arc<dyn FrameFactory>,
    /// close connections with RST instead of FIN when they end with an error
    pub fin_on_error: bool,
}

impl ServerConfig {
    /// plain framing without handshake
    pub fn new(address: impl Into<String>, port: u16) -> ServerConfig {
        ServerConfig {
            address: address.into(),
            port,
            tls_config: None,
            tls_handshake_timeout: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
            transport_kind: TransportKind::Auto,
            connection_options: Default::default(),
            handshaker: Arc::new(InstantHandshake),
            frame_factory: Arc::new(TcpFrameFactory),
            fin_on_error: true,
        }
    }

    /// WebSocket upgrade handshake and WebSocket framing
    pub fn websocket(address: impl Into<String>, port: u16) -> ServerConfig {
        ServerConfig {
            handshaker: Arc::new(WsServerHandshake::default()),
            frame_factory: Arc::new(WsFrameFactory),
            ..ServerConfig::new(address, port)
        }
    }

    pub fn with_tls(self, tls_config: Arc<rustls::ServerConfig>) -> ServerConfig {
        ServerConfig {
            tls_config: Some(tls_config),
            ..self
        }
    }

    pub fn is_secure(&self) -> bool {
        self.tls_config.is_some()
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self.address.parse()
            .map_err(|_| anyhow!("invalid listen address {:?}: expected an IP address", self.address))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn effective_transport_kind(&self) -> TransportKind {
        resolve_transport_kind(self.transport_kind, self.is_secure())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.bind_addr()?;
        self.connection_options.validate()?;
        validate_transport_kind(self.transport_kind, self.is_secure())?;
        Ok(())
    }
}

impl Debug for ServerConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("secure", &self.is_secure())
            .field("transport_kind", &self.transport_kind)
            .field("connection_options", &self.connection_options)
            .field("fin_on_error", &self.fin_on_error)
            .finish()
    }
}

#[derive(Clone)]
pub struct ClientConfig {
    /// the server's IP address
    pub address: String,
    pub port: u16,
    /// Host name for the WebSocket `Host` header and for TLS server name validation; defaults
    ///  to the address
    pub host: Option<String>,
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    pub tls_handshake_timeout: Duration,
    pub reconnect_interval: Duration,
    pub transport_kind: TransportKind,
    pub connection_options: ConnectionOptions,
    pub handshaker: Arc<dyn Handshaker>,
    pub frame_factory: Arc<dyn FrameFactory>,
}

impl ClientConfig {
    pub fn new(address: impl Into<String>, port: u16) -> ClientConfig {
        ClientConfig {
            address: address.into(),
            port,
            host: None,
            tls_config: None,
            tls_handshake_timeout: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            transport_kind: TransportKind::Auto,
            connection_options: Default::default(),
            handshaker: Arc::new(InstantHandshake),
            frame_factory: Arc::new(TcpFrameFactory),
        }
    }

    pub fn websocket(address: impl Into<String>, port: u16) -> ClientConfig {
        let mut result = ClientConfig::new(address, port);
        result.handshaker = Arc::new(WsClientHandshake::new(result.host_name(), "/"));
        result.frame_factory = Arc::new(WsFrameFactory);
        result
    }

    /// NB: this does not update a WebSocket handshaker that was installed before
    pub fn with_host(self, host: impl Into<String>) -> ClientConfig {
        ClientConfig {
            host: Some(host.into()),
            ..self
        }
    }

    pub fn with_tls(self, tls_config: Arc<rustls::ClientConfig>) -> ClientConfig {
        ClientConfig {
            tls_config: Some(tls_config),
            ..self
        }
    }

    pub fn is_secure(&self) -> bool {
        self.tls_config.is_some()
    }

    pub fn host_name(&self) -> String {
        self.host.clone()
            .unwrap_or_else(|| self.address.clone())
    }

    pub fn server_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self.address.parse()
            .map_err(|_| anyhow!("invalid server address {:?}: expected an IP address", self.address))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn effective_transport_kind(&self) -> TransportKind {
        resolve_transport_kind(self.transport_kind, self.is_secure())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.server_addr()?;
        if self.port == 0 {
            bail!("server port must not be 0");
        }
        if self.is_secure() && rustls::pki_types::ServerName::try_from(self.host_name()).is_err() {
            bail!("{:?} is not a valid TLS server name", self.host_name());
        }
        self.connection_options.validate()?;
        validate_transport_kind(self.transport_kind, self.is_secure())?;
        Ok(())
    }
}

impl Debug for ClientConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("host", &self.host)
            .field("secure", &self.is_secure())
            .field("reconnect_interval", &self.reconnect_interval)
            .field("transport_kind", &self.transport_kind)
            .field("connection_options", &self.connection_options)
            .finish()
    }
}

fn resolve_transport_kind(kind: TransportKind, is_secure: bool) -> TransportKind {
    match kind {
        TransportKind::Auto if is_secure => TransportKind::SecureStream,
        TransportKind::Auto => TransportKind::Socket,
        other => other,
    }
}

fn validate_transport_kind(kind: TransportKind, is_secure: bool) -> anyhow::Result<()> {
    match kind {
        TransportKind::SecureStream if !is_secure => bail!("secure stream transport requires a TLS configuration"),
        TransportKind::Stream | TransportKind::Socket if is_secure => bail!("transport kind {:?} does not support TLS", kind),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new("::", 0);
        assert!(config.validate().is_ok());
        assert!(!config.is_secure());
        assert_eq!(config.effective_transport_kind(), TransportKind::Socket);

        let options = &config.connection_options;
        assert!(options.io_queue_count >= 1 && options.io_queue_count <= MAX_IO_QUEUE_COUNT);
        assert_eq!(options.max_read_buffer_size, 1024 * 1024);
        assert_eq!(options.max_write_buffer_size, 64 * 1024);
        assert_eq!(options.max_payload_size, 50 * 1024 * 1024);
        assert_eq!(options.max_handshake_size, 2048);
        assert!(options.wait_for_data);

        let client = ClientConfig::new("127.0.0.1", 1234);
        assert!(client.validate().is_ok());
        assert_eq!(client.reconnect_interval, Duration::from_secs(3));
        assert_eq!(client.host_name(), "127.0.0.1");
    }

    #[rstest]
    #[case::ipv4("127.0.0.1", true)]
    #[case::ipv6("::1", true)]
    #[case::unspecified("::", true)]
    #[case::host_name("localhost", false)]
    #[case::empty("", false)]
    fn test_validate_server_address(#[case] address: &str, #[case] is_valid: bool) {
        assert_eq!(ServerConfig::new(address, 8080).validate().is_ok(), is_valid);
    }

    #[rstest]
    #[case::auto(TransportKind::Auto, true)]
    #[case::stream(TransportKind::Stream, true)]
    #[case::socket(TransportKind::Socket, true)]
    #[case::secure_without_tls(TransportKind::SecureStream, false)]
    fn test_validate_transport_kind(#[case] kind: TransportKind, #[case] is_valid: bool) {
        let mut config = ClientConfig::new("127.0.0.1", 8080);
        config.transport_kind = kind;
        assert_eq!(config.validate().is_ok(), is_valid);
    }

    #[rstest]
    #[case::no_queues(ConnectionOptions { io_queue_count: 0, ..Default::default() })]
    #[case::payload_too_big(ConnectionOptions { max_payload_size: u32::MAX as usize + 1, ..Default::default() })]
    #[case::no_handshake(ConnectionOptions { max_handshake_size: 0, ..Default::default() })]
    fn test_invalid_connection_options(#[case] options: ConnectionOptions) {
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_client_port_zero() {
        assert!(ClientConfig::new("127.0.0.1", 0).validate().is_err());
    }

    #[test]
    fn test_websocket_config() {
        let config = ClientConfig::websocket("127.0.0.1", 8080);
        assert!(config.validate().is_ok());
        let config = ServerConfig::websocket("0.0.0.0", 8080);
        assert!(config.validate().is_ok());
    }
}

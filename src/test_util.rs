use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use crate::codec::{Codec, JsonCodec};
use crate::connection::{Connection, ConnectionObserver};
use crate::error::ShutdownReason;
use crate::protocol::Frame;
use crate::socket::MockTransport;

pub fn test_peer_addr() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9810))
}

/// a connection over a mocked transport, for code that only sends or inspects connections
pub fn test_connection() -> (Arc<Connection<JsonCodec>>, mpsc::UnboundedReceiver<Frame>) {
    let mut transport = MockTransport::new();
    transport.expect_peer_addr()
        .return_const(test_peer_addr());
    transport.expect_shutdown_reason()
        .return_const(None::<ShutdownReason>);

    Connection::new("test-connection".to_string(), Arc::new(transport), Arc::new(JsonCodec), 1024, CancellationToken::new())
}

/// records observer callbacks by name
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<&'static str>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }
}

impl <C: Codec> ConnectionObserver<C> for RecordingObserver {
    fn on_handshaked(&self, _connection: &Arc<Connection<C>>) {
        self.events.lock().unwrap().push("handshaked");
    }

    fn on_closing(&self, _connection: &Arc<Connection<C>>) {
        self.events.lock().unwrap().push("closing");
    }

    fn on_closed(&self, _connection: &Arc<Connection<C>>) {
        self.events.lock().unwrap().push("closed");
    }
}

/// polls `condition` until it holds, failing the test after `max_wait`
pub async fn wait_until(max_wait: Duration, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + max_wait;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached within {:?}", max_wait);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

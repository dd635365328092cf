use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;
use crate::codec::{Codec, JsonCodec};
use crate::connection::Connection;

/// capacity of the event channel; subscribers lagging further behind miss events
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Connection lifecycle events published by servers and clients
pub enum ConnectionEvent<C: Codec = JsonCodec> {
    /// the connection completed its handshake and is ready for frames
    Connected(Arc<Connection<C>>),
    /// The connection was closed. This is published only for connections that were
    ///  [ConnectionEvent::Connected] before.
    Disconnected(Arc<Connection<C>>),
}

impl <C: Codec> ConnectionEvent<C> {
    pub fn connection(&self) -> &Arc<Connection<C>> {
        match self {
            ConnectionEvent::Connected(c) => c,
            ConnectionEvent::Disconnected(c) => c,
        }
    }
}

impl <C: Codec> Clone for ConnectionEvent<C> {
    fn clone(&self) -> Self {
        match self {
            ConnectionEvent::Connected(c) => ConnectionEvent::Connected(c.clone()),
            ConnectionEvent::Disconnected(c) => ConnectionEvent::Disconnected(c.clone()),
        }
    }
}

impl <C: Codec> Debug for ConnectionEvent<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionEvent::Connected(c) => write!(f, "Connected({})", c.unique_id()),
            ConnectionEvent::Disconnected(c) => write!(f, "Disconnected({}: {:?})", c.unique_id(), c.shutdown_reason()),
        }
    }
}

pub struct EventNotifier<C: Codec> {
    sender: broadcast::Sender<ConnectionEvent<C>>,
}
impl <C: Codec> EventNotifier<C> {
    pub fn new() -> EventNotifier<C> {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        EventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent<C>> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: ConnectionEvent<C>) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

impl <C: Codec> Default for EventNotifier<C> {
    fn default() -> Self {
        EventNotifier::new()
    }
}

//! Dispatch of incoming frames to application handlers by identifier

use std::future::Future;
use std::sync::Arc;
use anyhow::bail;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tracing::{debug, trace, Instrument, Span};
use crate::buffers::atomic_map::AtomicMap;
use crate::codec::Codec;
use crate::connection::Connection;
use crate::protocol::{Frame, SERIALIZE_PREFIX};

/// Receives every frame of a handshaked connection, in the order the frames arrived
#[cfg_attr(test, automock)]
pub trait FrameDispatcher<C: Codec>: Send + Sync + 'static {
    fn dispatch(&self, frame: Frame, connection: &Arc<Connection<C>>);
}

type Handler<C> = Arc<dyn Fn(Frame, &Arc<Connection<C>>) + Send + Sync>;

/// A table of handlers keyed by identifier. Typed handlers are registered under the identifier
///  prefixed with [SERIALIZE_PREFIX], matching [Connection::send_value].
pub struct Router<C: Codec> {
    handlers: AtomicMap<String, Handler<C>>,
    codec: Arc<C>,
    /// runs the futures returned by async handlers
    scheduler: Handle,
}

impl <C: Codec> Router<C> {
    pub fn new(codec: Arc<C>, scheduler: Handle) -> Router<C> {
        Router {
            handlers: AtomicMap::new(),
            codec,
            scheduler,
        }
    }

    /// register a handler for frames with this identifier, receiving the raw payload
    pub fn on<F>(&self, identifier: &str, handler: F) -> anyhow::Result<()>
    where F: Fn(Bytes, &Arc<Connection<C>>) + Send + Sync + 'static
    {
        if identifier.starts_with(SERIALIZE_PREFIX) {
            bail!("identifier {:?} uses the reserved prefix {:?}", identifier, SERIALIZE_PREFIX);
        }
        self.register(identifier.to_string(), Arc::new(move |frame: Frame, connection: &Arc<Connection<C>>| {
            handler(frame.into_payload(), connection)
        }))
    }

    /// Register a handler for values sent with [Connection::send_value]. Payloads that do not
    ///  deserialize into `T` are dropped.
    pub fn on_value<T, F>(&self, identifier: &str, handler: F) -> anyhow::Result<()>
    where
        T: DeserializeOwned,
        F: Fn(T, &Arc<Connection<C>>) + Send + Sync + 'static,
    {
        if identifier.starts_with(SERIALIZE_PREFIX) {
            bail!("identifier {:?} uses the reserved prefix {:?}", identifier, SERIALIZE_PREFIX);
        }
        let codec = self.codec.clone();
        let key = format!("{}{}", SERIALIZE_PREFIX, identifier);
        self.register(key, Arc::new(move |frame: Frame, connection: &Arc<Connection<C>>| {
            match codec.deserialize::<T>(frame.payload()) {
                Some(value) => handler(value, connection),
                None => debug!("dropping frame {:?}: payload does not deserialize", frame.identifier()),
            }
        }))
    }

    /// Register an async handler for raw payloads. Each call's future is spawned, so async
    ///  handlers of a connection may complete out of order.
    pub fn on_async<F, Fut>(&self, identifier: &str, handler: F) -> anyhow::Result<()>
    where
        F: Fn(Bytes, Arc<Connection<C>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let scheduler = self.scheduler.clone();
        self.on(identifier, move |payload, connection| {
            scheduler.spawn(handler(payload, connection.clone()).instrument(Span::current()));
        })
    }

    /// the async counterpart of [Router::on_value]
    pub fn on_value_async<T, F, Fut>(&self, identifier: &str, handler: F) -> anyhow::Result<()>
    where
        T: DeserializeOwned,
        F: Fn(T, Arc<Connection<C>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let scheduler = self.scheduler.clone();
        self.on_value(identifier, move |value: T, connection| {
            scheduler.spawn(handler(value, connection.clone()).instrument(Span::current()));
        })
    }

    fn register(&self, key: String, handler: Handler<C>) -> anyhow::Result<()> {
        let is_new = self.handlers.update(|handlers| {
            if handlers.contains_key(&key) {
                return false;
            }
            handlers.insert(key.clone(), handler);
            true
        });
        if !is_new {
            bail!("a handler for {:?} is registered already", key);
        }
        Ok(())
    }

    pub fn num_handlers(&self) -> usize {
        self.handlers.len()
    }

    pub fn route(&self, frame: Frame, connection: &Arc<Connection<C>>) {
        let Some(identifier) = frame.identifier() else {
            debug!("dropping frame without identifier");
            return;
        };
        match self.handlers.get(identifier) {
            Some(handler) => {
                trace!("dispatching frame {:?}", identifier);
                handler(frame, connection);
            }
            None => debug!("no handler for {:?} - dropping frame", identifier),
        }
    }
}

impl <C: Codec> FrameDispatcher<C> for Router<C> {
    fn dispatch(&self, frame: Frame, connection: &Arc<Connection<C>>) {
        self.route(frame, connection)
    }
}

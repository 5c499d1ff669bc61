//! Protocol handler registry.

use core::fmt::{self, Debug, Formatter};
use core::future::Future;
use std::collections::hash_map::HashMap;
use std::sync::Arc;

use atek_network_primitives::protocol::ProtocolToken;
use futures_util::future::BoxFuture;

use crate::connection::Connection;
use crate::stream::SocketStream;

/// Takes over an inbound connection once its protocol has been resolved.
///
/// Any `Fn(SocketStream, Connection) -> impl Future<Output = ()>` closure is a
/// handler. Each invocation runs on its own task.
pub trait ProtocolHandler: Send + Sync + 'static {
    fn handle(&self, stream: SocketStream, connection: Connection) -> BoxFuture<'static, ()>;
}

impl<F, Fut> ProtocolHandler for F
where
    F: Fn(SocketStream, Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, stream: SocketStream, connection: Connection) -> BoxFuture<'static, ()> {
        Box::pin(self(stream, connection))
    }
}

#[derive(Clone, Default)]
pub struct DispatchTable {
    handlers: HashMap<ProtocolToken, Arc<dyn ProtocolHandler>>,
    default: Option<Arc<dyn ProtocolHandler>>,
}

impl DispatchTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `protocol`, replacing any previous one. The
    /// wildcard token sets the default handler.
    pub fn set(&mut self, protocol: ProtocolToken, handler: Arc<dyn ProtocolHandler>) {
        if protocol.is_wildcard() {
            self.default = Some(handler);
            return;
        }

        drop(self.handlers.insert(protocol, handler));
    }

    pub fn set_default(&mut self, handler: Arc<dyn ProtocolHandler>) {
        self.default = Some(handler);
    }

    /// Returns whether a handler was registered.
    pub fn remove(&mut self, protocol: &ProtocolToken) -> bool {
        if protocol.is_wildcard() {
            return self.remove_default();
        }

        self.handlers.remove(protocol).is_some()
    }

    pub fn remove_default(&mut self) -> bool {
        self.default.take().is_some()
    }

    /// Exact match first, then the default handler.
    #[must_use]
    pub fn resolve(&self, protocol: &ProtocolToken) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers
            .get(protocol)
            .or(self.default.as_ref())
            .map(Arc::clone)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.default.is_none()
    }
}

impl Debug for DispatchTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("protocols", &self.handlers.keys().collect::<Vec<_>>())
            .field("default", &self.default.is_some())
            .finish()
    }
}

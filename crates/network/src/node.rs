use core::fmt::{self, Debug, Formatter};
use core::mem::{replace, take};
use std::collections::hash_map::HashMap;
use std::sync::{Arc, Weak};

use atek_network_primitives::identity::{Keypair, PublicKey};
use atek_network_primitives::protocol::{ProtocolToken, WILDCARD};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio::{select, spawn};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, ConnectionEvent, Role};
use crate::dispatch::{DispatchTable, ProtocolHandler};
use crate::error::NetworkError;
use crate::negotiate::{Negotiator, WildcardNegotiator, NEGOTIATION_TIMEOUT};
use crate::runtime::Runtime;
use crate::stream::SocketStream;
use crate::transport::{Listener, RawSocket};

#[derive(Debug)]
#[non_exhaustive]
pub enum NodeEvent {
    /// A connection was accepted and registered.
    Connection(Connection),
    /// An accepted connection has no handler for its protocol; its stream is
    /// waiting in [`Connection::take_stream`]. Emitted before the matching
    /// [`NodeEvent::Connection`].
    Select {
        protocol: ProtocolToken,
        connection: Connection,
    },
}

/// A local identity on the DHT.
///
/// Dials peers, optionally listens for inbound connections, routes those to
/// protocol handlers and keeps every live connection in a registry keyed by the
/// remote's base32 public key. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Node {
    shared: Arc<Shared>,
}

#[derive(Clone, Debug)]
pub(crate) struct WeakNode(Weak<Shared>);

impl WeakNode {
    pub(crate) fn upgrade(&self) -> Option<Node> {
        self.0.upgrade().map(|shared| Node { shared })
    }
}

struct Shared {
    runtime: Runtime,
    identity: Arc<Keypair>,
    sockets: Mutex<HashMap<String, Vec<Connection>>>,
    listener: Mutex<ListenerState>,
    handlers: RwLock<DispatchTable>,
    negotiator: RwLock<Arc<dyn Negotiator>>,
    event_sender: mpsc::UnboundedSender<NodeEvent>,
    event_receiver: Mutex<Option<mpsc::UnboundedReceiver<NodeEvent>>>,
}

enum ListenerState {
    Idle,
    Starting,
    Listening {
        shutdown: CancellationToken,
        task: JoinHandle<()>,
    },
}

impl Node {
    #[must_use]
    pub fn new(runtime: Runtime, identity: Keypair) -> Self {
        let (event_sender, event_receiver) = mpsc::unbounded_channel();

        Self {
            shared: Arc::new(Shared {
                runtime,
                identity: Arc::new(identity),
                sockets: Mutex::default(),
                listener: Mutex::new(ListenerState::Idle),
                handlers: RwLock::default(),
                negotiator: RwLock::new(Arc::new(WildcardNegotiator)),
                event_sender,
                event_receiver: Mutex::new(Some(event_receiver)),
            }),
        }
    }

    /// A node on [`Runtime::global`].
    #[must_use]
    pub fn with_global_runtime(identity: Keypair) -> Self {
        Self::new(Runtime::global().clone(), identity)
    }

    #[must_use]
    pub fn identity(&self) -> &Keypair {
        &self.shared.identity
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.shared.identity.public_key()
    }

    /// Base32 form of the public key.
    #[must_use]
    pub fn peer_id(&self) -> String {
        self.public_key().to_base32()
    }

    #[must_use]
    pub fn http_hostname(&self) -> String {
        self.public_key().hostname()
    }

    #[must_use]
    pub fn http_url(&self) -> String {
        self.public_key().url()
    }

    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.shared.runtime
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        matches!(
            *self.shared.listener.lock(),
            ListenerState::Listening { .. }
        )
    }

    /// Event queue of this node; only the first caller receives it.
    ///
    /// Events are queued from creation on, so take the receiver before
    /// listening to see every connection.
    #[must_use]
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<NodeEvent>> {
        self.shared.event_receiver.lock().take()
    }

    /// Opens a connection to `remote`.
    ///
    /// The connection is registered and its stream is waiting in
    /// [`Connection::take_stream`]. Without a protocol the wildcard token is
    /// used.
    pub async fn connect(
        &self,
        remote: PublicKey,
        protocol: Option<ProtocolToken>,
    ) -> Result<Connection, NetworkError> {
        let transport = self.shared.runtime.transport()?;

        let connection = Connection::new(
            remote,
            Arc::clone(&self.shared.identity),
            Role::Client,
            protocol.unwrap_or_default(),
        );

        debug!(local = %self.public_key(), %remote, "Dialing");

        let socket = transport
            .connect(remote, &self.shared.identity)
            .await
            .map_err(|source| NetworkError::Connect { remote, source })?;

        let (_, io, control) = socket.into_parts();
        let mut stream = SocketStream::new(remote, io);

        if !control.is_closed() {
            let negotiator = self.negotiator();

            if let Err(source) = negotiator
                .propose(&mut stream, &connection.protocol())
                .await
            {
                control.request_close();
                return Err(NetworkError::Negotiation { remote, source });
            }
        }

        connection.attach(control, Some(stream));

        self.track(&connection);

        info!(
            local = %self.public_key(),
            %remote,
            connection_id = connection.id(),
            "Connected"
        );

        Ok(connection)
    }

    /// Starts accepting inbound connections. Does nothing when already
    /// listening.
    pub async fn listen(&self) -> Result<(), NetworkError> {
        let transport = {
            let mut state = self.shared.listener.lock();

            if !matches!(*state, ListenerState::Idle) {
                return Ok(());
            }

            let transport = self.shared.runtime.transport()?;

            *state = ListenerState::Starting;

            transport
        };

        let listener = match transport.listen(&self.shared.identity).await {
            Ok(listener) => listener,
            Err(source) => {
                *self.shared.listener.lock() = ListenerState::Idle;

                return Err(NetworkError::Listen {
                    local: self.public_key(),
                    source,
                });
            }
        };

        if let Some(mut listener) = self.install_listener(listener) {
            // Closed while the transport was setting up.
            if let Err(err) = listener.close().await {
                warn!(%err, "Failed to close listener");
            }

            return Ok(());
        }

        info!(public_key = %self.public_key(), "Listening");

        Ok(())
    }

    /// Stops listening, then closes every registered connection.
    ///
    /// All connections are attempted; failures are collected into
    /// [`NetworkError::Close`].
    pub async fn close(&self) -> Result<(), NetworkError> {
        if let Some((shutdown, task)) = self.take_listener() {
            shutdown.cancel();

            if let Err(err) = task.await {
                error!(%err, "Listener task failed");
            }
        }

        let connections: Vec<Connection> = take(&mut *self.shared.sockets.lock())
            .into_values()
            .flatten()
            .collect();

        debug!(public_key = %self.public_key(), count = connections.len(), "Closing connections");

        let failures: Vec<NetworkError> = join_all(connections.iter().map(Connection::close))
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        for err in &failures {
            warn!(%err, "Failed to close connection");
        }

        self.shared.runtime.unregister_active(&self.public_key());

        if !failures.is_empty() {
            return Err(NetworkError::Close(failures));
        }

        Ok(())
    }

    /// Registers `handler` for `protocol`; the wildcard token sets the
    /// default handler.
    pub fn set_protocol_handler(
        &self,
        protocol: impl Into<ProtocolToken>,
        handler: impl ProtocolHandler,
    ) {
        self.shared
            .handlers
            .write()
            .set(protocol.into(), Arc::new(handler));
    }

    pub fn set_default_protocol_handler(&self, handler: impl ProtocolHandler) {
        self.shared.handlers.write().set_default(Arc::new(handler));
    }

    pub fn remove_protocol_handler(&self, protocol: &ProtocolToken) -> bool {
        self.shared.handlers.write().remove(protocol)
    }

    pub fn remove_default_protocol_handler(&self) -> bool {
        self.shared.handlers.write().remove_default()
    }

    /// Replaces how protocols are agreed on for new connections.
    pub fn set_negotiator(&self, negotiator: impl Negotiator) {
        *self.shared.negotiator.write() = Arc::new(negotiator);
    }

    /// First registered connection to `remote`.
    #[must_use]
    pub fn get_socket(&self, remote: &PublicKey) -> Option<Connection> {
        self.shared
            .sockets
            .lock()
            .get(&remote.to_base32())
            .and_then(|connections| connections.first().cloned())
    }

    /// Every registered connection to `remote`, in registration order.
    #[must_use]
    pub fn get_all_sockets(&self, remote: &PublicKey) -> Vec<Connection> {
        self.shared
            .sockets
            .lock()
            .get(&remote.to_base32())
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn add_socket(&self, connection: &Connection) {
        let mut sockets = self.shared.sockets.lock();
        let connections = sockets
            .entry(connection.remote_public_key().to_base32())
            .or_default();

        if connections.iter().any(|known| known.ptr_eq(connection)) {
            return;
        }

        connections.push(connection.clone());
    }

    pub(crate) fn remove_socket(&self, connection: &Connection) {
        let key = connection.remote_public_key().to_base32();
        let mut sockets = self.shared.sockets.lock();

        let Some(connections) = sockets.get_mut(&key) else {
            return;
        };

        connections.retain(|known| !known.ptr_eq(connection));

        if connections.is_empty() {
            drop(sockets.remove(&key));
        }
    }

    pub(crate) fn downgrade(&self) -> WeakNode {
        WeakNode(Arc::downgrade(&self.shared))
    }

    fn negotiator(&self) -> Arc<dyn Negotiator> {
        Arc::clone(&self.shared.negotiator.read())
    }

    fn emit(&self, event: NodeEvent) {
        let _ignored = self.shared.event_sender.send(event);
    }

    /// Registers `connection` and arranges for its removal once it closes.
    fn track(&self, connection: &Connection) {
        self.add_socket(connection);

        let node = self.downgrade();

        connection.on_close(move |connection| {
            if let Some(node) = node.upgrade() {
                node.remove_socket(connection);
            }
        });
    }

    /// Hands `listener` back when the node stopped starting up meanwhile.
    fn install_listener(&self, listener: Box<dyn Listener>) -> Option<Box<dyn Listener>> {
        let mut state = self.shared.listener.lock();

        if !matches!(*state, ListenerState::Starting) {
            return Some(listener);
        }

        let shutdown = CancellationToken::new();
        let task = spawn(accept_loop(self.downgrade(), listener, shutdown.clone()));

        *state = ListenerState::Listening { shutdown, task };

        self.shared.runtime.register_active(self);

        None
    }

    /// Registers an accepted connection unless the node stopped listening.
    ///
    /// Holds the listener lock so that a concurrent [`Node::close`] either
    /// sees the connection in the registry or keeps it out.
    fn track_inbound(&self, connection: &Connection) -> bool {
        let state = self.shared.listener.lock();

        if !matches!(*state, ListenerState::Listening { .. }) {
            return false;
        }

        self.track(connection);

        true
    }

    fn take_listener(&self) -> Option<(CancellationToken, JoinHandle<()>)> {
        let mut state = self.shared.listener.lock();

        match replace(&mut *state, ListenerState::Idle) {
            ListenerState::Listening { shutdown, task } => Some((shutdown, task)),
            ListenerState::Idle | ListenerState::Starting => None,
        }
    }

    async fn accept_inbound(&self, socket: RawSocket) {
        let (remote, io, control) = socket.into_parts();

        let connection = Connection::new(
            remote,
            Arc::clone(&self.shared.identity),
            Role::Server,
            WILDCARD,
        );

        let mut stream = SocketStream::new(remote, io);
        let negotiator = self.negotiator();

        let protocol = match timeout(NEGOTIATION_TIMEOUT, negotiator.accept(&mut stream)).await {
            Ok(Ok(protocol)) => protocol,
            Ok(Err(err)) => {
                warn!(%remote, %err, "Inbound protocol negotiation failed");
                control.request_close();
                return;
            }
            Err(_elapsed) => {
                warn!(
                    %remote,
                    timeout = ?NEGOTIATION_TIMEOUT,
                    "Inbound protocol negotiation timed out"
                );
                control.request_close();
                return;
            }
        };

        connection.set_protocol(protocol.clone());

        if !self.track_inbound(&connection) {
            control.request_close();
            return;
        }

        let handler = self.shared.handlers.read().resolve(&protocol);

        if let Some(handler) = handler {
            connection.attach(control, None);

            drop(spawn(handler.handle(stream, connection.clone())));
        } else {
            connection.attach(control, Some(stream));

            self.emit(NodeEvent::Select {
                protocol: protocol.clone(),
                connection: connection.clone(),
            });
            connection.notify(ConnectionEvent::Select { protocol });
        }

        self.emit(NodeEvent::Connection(connection.clone()));

        debug!(
            local = %self.public_key(),
            %remote,
            connection_id = connection.id(),
            protocol = %connection.protocol(),
            "Accepted connection"
        );
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("public_key", &self.public_key())
            .field("listening", &self.is_listening())
            .field("handlers", &*self.shared.handlers.read())
            .finish_non_exhaustive()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let ListenerState::Listening { shutdown, .. } = self.listener.get_mut() {
            shutdown.cancel();
        }
    }
}

async fn accept_loop(node: WeakNode, mut listener: Box<dyn Listener>, shutdown: CancellationToken) {
    loop {
        let socket = select! {
            () = shutdown.cancelled() => break,
            socket = listener.accept() => socket,
        };

        let Some(socket) = socket else {
            break;
        };

        let Some(node) = node.upgrade() else {
            break;
        };

        drop(spawn(async move { node.accept_inbound(socket).await }));
    }

    if let Err(err) = listener.close().await {
        warn!(%err, "Failed to close listener");
    }
}

#[cfg(test)]
#[path = "tests/node.rs"]
mod tests;

use core::fmt::{self, Debug, Formatter};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use std::sync::Arc;

use atek_network_primitives::identity::{Keypair, PublicKey};
use atek_network_primitives::protocol::ProtocolToken;
use parking_lot::{Mutex, RwLock};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::NetworkError;
use crate::stream::SocketStream;
use crate::transport::SocketControl;

/// How long [`Connection::close`] waits for the transport to confirm.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Role {
    /// This side dialed.
    Client,
    /// This side accepted.
    Server,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Open,
    Closed,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConnectionEvent {
    /// No handler claimed the connection; its stream is waiting in
    /// [`Connection::take_stream`].
    Select { protocol: ProtocolToken },
    Closed,
}

type CloseHook = Box<dyn FnOnce(&Connection) + Send>;

/// One logical connection between a local identity and a remote peer.
///
/// Cheap to clone; clones refer to the same connection. The connection is
/// closed exactly once, whether [`close`](Self::close) is called or the
/// transport drops the socket, and observers see a single
/// [`ConnectionEvent::Closed`].
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    remote_public_key: PublicKey,
    local_identity: Arc<Keypair>,
    role: Role,
    protocol: RwLock<ProtocolToken>,
    stream: Mutex<Option<SocketStream>>,
    control: Mutex<Option<SocketControl>>,
    close_hooks: Mutex<Option<Vec<CloseHook>>>,
    finished: AtomicBool,
    closed: CancellationToken,
    event_sender: mpsc::UnboundedSender<ConnectionEvent>,
    event_receiver: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
}

impl Connection {
    pub(crate) fn new(
        remote_public_key: PublicKey,
        local_identity: Arc<Keypair>,
        role: Role,
        protocol: ProtocolToken,
    ) -> Self {
        let (event_sender, event_receiver) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                remote_public_key,
                local_identity,
                role,
                protocol: RwLock::new(protocol),
                stream: Mutex::default(),
                control: Mutex::default(),
                close_hooks: Mutex::new(Some(Vec::new())),
                finished: AtomicBool::new(false),
                closed: CancellationToken::new(),
                event_sender,
                event_receiver: Mutex::new(Some(event_receiver)),
            }),
        }
    }

    /// Process-unique identifier, for logs.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn remote_public_key(&self) -> PublicKey {
        self.inner.remote_public_key
    }

    #[must_use]
    pub fn local_identity(&self) -> &Keypair {
        &self.inner.local_identity
    }

    #[must_use]
    pub fn local_public_key(&self) -> PublicKey {
        self.inner.local_identity.public_key()
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    #[must_use]
    pub fn is_client(&self) -> bool {
        self.inner.role == Role::Client
    }

    #[must_use]
    pub fn is_server(&self) -> bool {
        self.inner.role == Role::Server
    }

    #[must_use]
    pub fn protocol(&self) -> ProtocolToken {
        self.inner.protocol.read().clone()
    }

    pub(crate) fn set_protocol(&self, protocol: ProtocolToken) {
        *self.inner.protocol.write() = protocol;
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        if self.is_closed() {
            ConnectionState::Closed
        } else {
            ConnectionState::Open
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    /// Hands out the connection's stream.
    ///
    /// The stream is parked here for outbound connections and for inbound
    /// connections no handler claimed. It can be taken once.
    pub fn take_stream(&self) -> Result<SocketStream, NetworkError> {
        self.inner
            .stream
            .lock()
            .take()
            .ok_or(NetworkError::SocketNotInitialized)
    }

    /// Event queue of this connection; only the first caller receives it.
    #[must_use]
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.inner.event_receiver.lock().take()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Closes the connection and waits for the transport to confirm.
    ///
    /// The connection counts as closed afterwards even when the confirmation
    /// times out. Closing an already closed connection succeeds immediately.
    pub async fn close(&self) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Ok(());
        }

        let control = self.inner.control.lock().clone();

        let Some(control) = control else {
            self.finish();
            return Ok(());
        };

        debug!(connection_id = self.inner.id, remote = %self.inner.remote_public_key, "Closing connection");

        control.request_close();

        let confirmed = timeout(CLOSE_TIMEOUT, control.closed()).await.is_ok();

        self.finish();

        if !confirmed {
            return Err(NetworkError::CloseTimeout {
                remote: self.inner.remote_public_key,
            });
        }

        Ok(())
    }

    /// Whether both handles refer to the same connection.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Binds the transport socket and starts watching it for closure.
    pub(crate) fn attach(&self, control: SocketControl, stream: Option<SocketStream>) {
        if self.is_closed() {
            control.request_close();
            return;
        }

        *self.inner.stream.lock() = stream;
        *self.inner.control.lock() = Some(control.clone());

        if control.is_closed() {
            self.finish();
            return;
        }

        let connection = Arc::downgrade(&self.inner);

        drop(spawn(async move {
            control.closed().await;

            if let Some(inner) = connection.upgrade() {
                Self { inner }.finish();
            }
        }));
    }

    /// Runs `hook` when the connection closes, or right away if it already has.
    pub(crate) fn on_close(&self, hook: impl FnOnce(&Self) + Send + 'static) {
        let mut hooks = self.inner.close_hooks.lock();

        if let Some(hooks) = hooks.as_mut() {
            hooks.push(Box::new(hook));
            return;
        }

        drop(hooks);

        hook(self);
    }

    pub(crate) fn notify(&self, event: ConnectionEvent) {
        let _ignored = self.inner.event_sender.send(event);
    }

    fn finish(&self) {
        if self.inner.finished.swap(true, Ordering::AcqRel) {
            return;
        }

        drop(self.inner.stream.lock().take());
        drop(self.inner.control.lock().take());

        let hooks = self.inner.close_hooks.lock().take().unwrap_or_default();

        for hook in hooks {
            hook(self);
        }

        self.notify(ConnectionEvent::Closed);
        self.inner.closed.cancel();

        debug!(
            connection_id = self.inner.id,
            remote = %self.inner.remote_public_key,
            role = ?self.inner.role,
            "Connection closed"
        );
    }
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote_public_key", &self.inner.remote_public_key)
            .field("role", &self.inner.role)
            .field("protocol", &*self.inner.protocol.read())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(control) = self.control.get_mut().take() {
            control.request_close();
        }
    }
}

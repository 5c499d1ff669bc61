use core::mem::take;
use std::sync::Arc;

use atek_network_primitives::identity::PublicKey;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::NetworkError;
use crate::node::{Node, WeakNode};
use crate::transport::Transport;

static GLOBAL: Lazy<Runtime> = Lazy::new(Runtime::new);

/// Owns the active transport and tracks the nodes listening through it.
///
/// At most one transport is active at a time. Cheap to clone; clones share
/// state. The process-wide instance behind [`crate::setup`] and
/// [`crate::destroy`] is [`Runtime::global`].
#[derive(Clone, Debug, Default)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

#[derive(Debug, Default)]
struct RuntimeInner {
    transport: RwLock<Option<Arc<dyn Transport>>>,
    active_nodes: Mutex<Vec<ActiveNode>>,
}

#[derive(Debug)]
struct ActiveNode {
    public_key: PublicKey,
    node: WeakNode,
}

impl Runtime {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Installs `transport`. Fails while another transport is active.
    pub fn setup(&self, transport: impl Transport) -> Result<(), NetworkError> {
        let mut active = self.inner.transport.write();

        if active.is_some() {
            return Err(NetworkError::DuplicateSetup);
        }

        info!(?transport, "Transport active");

        *active = Some(Arc::new(transport));

        Ok(())
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.transport.read().is_some()
    }

    pub fn transport(&self) -> Result<Arc<dyn Transport>, NetworkError> {
        self.inner
            .transport
            .read()
            .clone()
            .ok_or(NetworkError::TransportInactive)
    }

    /// Public keys of the nodes currently listening, in the order they
    /// started.
    #[must_use]
    pub fn active_nodes(&self) -> Vec<PublicKey> {
        self.inner
            .active_nodes
            .lock()
            .iter()
            .map(|active| active.public_key)
            .collect()
    }

    /// Closes every active node and tears the transport down. Does nothing
    /// when no transport is active.
    pub async fn destroy(&self) -> Result<(), NetworkError> {
        let transport = self.inner.transport.write().take();

        let Some(transport) = transport else {
            return Ok(());
        };

        let nodes: Vec<Node> = take(&mut *self.inner.active_nodes.lock())
            .into_iter()
            .filter_map(|active| active.node.upgrade())
            .collect();

        for node in nodes {
            if let Err(err) = node.close().await {
                warn!(public_key = %node.public_key(), %err, "Failed to close node");
            }
        }

        transport.destroy().await.map_err(NetworkError::Destroy)?;

        info!("Transport destroyed");

        Ok(())
    }

    pub(crate) fn register_active(&self, node: &Node) {
        let public_key = node.public_key();
        let mut active_nodes = self.inner.active_nodes.lock();

        if active_nodes
            .iter()
            .any(|active| active.public_key == public_key)
        {
            return;
        }

        active_nodes.push(ActiveNode {
            public_key,
            node: node.downgrade(),
        });
    }

    pub(crate) fn unregister_active(&self, public_key: &PublicKey) {
        let mut active_nodes = self.inner.active_nodes.lock();

        if let Some(index) = active_nodes
            .iter()
            .position(|active| active.public_key == *public_key)
        {
            drop(active_nodes.remove(index));
        }
    }
}

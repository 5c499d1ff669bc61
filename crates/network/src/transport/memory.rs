//! In-process transport.
//!
//! Peers find each other through a shared table of listeners keyed by public
//! key, and every connection is a pair of in-memory pipes. Clones of a
//! [`MemoryTransport`] share the same table, which makes it the transport of
//! choice for tests.

use std::collections::hash_map::{Entry, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use atek_network_primitives::identity::{Keypair, PublicKey};
use parking_lot::Mutex;
use tokio::io::duplex;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TransportError;
use crate::transport::{
    splice, Listener, PipeIo, RawSocket, SocketControl, Transport, PIPE_BUFFER_SIZE,
};

#[derive(Clone, Debug, Default)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    listeners: Mutex<HashMap<PublicKey, mpsc::UnboundedSender<RawSocket>>>,
    destroyed: CancellationToken,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_listening(&self, public_key: &PublicKey) -> bool {
        self.shared
            .listeners
            .lock()
            .get(public_key)
            .is_some_and(|sender| !sender.is_closed())
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.is_cancelled()
    }

    fn ensure_alive(&self) -> Result<(), TransportError> {
        if self.is_destroyed() {
            return Err(TransportError::Destroyed);
        }

        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        remote: PublicKey,
        identity: &Keypair,
    ) -> Result<RawSocket, TransportError> {
        self.ensure_alive()?;

        let Some(sender) = self.shared.listeners.lock().get(&remote).cloned() else {
            return Err(TransportError::PeerNotFound(remote));
        };

        let (client_io, client_inner) = duplex(PIPE_BUFFER_SIZE);
        let (server_io, server_inner) = duplex(PIPE_BUFFER_SIZE);
        let control = SocketControl::new();

        splice(
            client_inner,
            server_inner,
            control.clone(),
            self.shared.destroyed.clone(),
        );

        let inbound = RawSocket::new(
            identity.public_key(),
            PipeIo::new(server_io, control.clone()),
            control.clone(),
        );

        if sender.send(inbound).is_err() {
            control.request_close();
            return Err(TransportError::PeerNotFound(remote));
        }

        debug!(local = %identity.public_key(), %remote, "Opened in-memory connection");

        Ok(RawSocket::new(
            remote,
            PipeIo::new(client_io, control.clone()),
            control,
        ))
    }

    async fn listen(&self, identity: &Keypair) -> Result<Box<dyn Listener>, TransportError> {
        self.ensure_alive()?;

        let public_key = identity.public_key();
        let (sender, receiver) = mpsc::unbounded_channel();

        match self.shared.listeners.lock().entry(public_key) {
            Entry::Occupied(entry) if !entry.get().is_closed() => {
                return Err(TransportError::AlreadyListening(public_key));
            }
            Entry::Occupied(mut entry) => {
                let _ignored = entry.insert(sender);
            }
            Entry::Vacant(entry) => {
                let _ignored = entry.insert(sender);
            }
        }

        Ok(Box::new(MemoryListener {
            public_key,
            receiver,
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn destroy(&self) -> Result<(), TransportError> {
        self.shared.destroyed.cancel();
        self.shared.listeners.lock().clear();

        Ok(())
    }
}

#[derive(Debug)]
struct MemoryListener {
    public_key: PublicKey,
    receiver: mpsc::UnboundedReceiver<RawSocket>,
    shared: Arc<Shared>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Option<RawSocket> {
        select! {
            socket = self.receiver.recv() => socket,
            () = self.shared.destroyed.cancelled() => None,
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.receiver.close();

        let mut listeners = self.shared.listeners.lock();

        if let Entry::Occupied(entry) = listeners.entry(self.public_key) {
            if entry.get().is_closed() {
                drop(entry.remove());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use atek_network_primitives::identity::create_keypair;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_connect_without_listener() {
        let transport = MemoryTransport::new();
        let local = create_keypair(Some(&[1; 32]));
        let remote = create_keypair(Some(&[2; 32])).public_key();

        let result = transport.connect(remote, &local).await;

        assert!(matches!(result, Err(TransportError::PeerNotFound(key)) if key == remote));
    }

    #[tokio::test]
    async fn test_listen_twice_is_rejected() -> eyre::Result<()> {
        let transport = MemoryTransport::new();
        let identity = create_keypair(Some(&[1; 32]));

        let mut listener = transport.listen(&identity).await?;
        assert!(transport.is_listening(&identity.public_key()));

        let second = transport.listen(&identity).await;
        assert!(matches!(second, Err(TransportError::AlreadyListening(_))));

        listener.close().await?;
        assert!(!transport.is_listening(&identity.public_key()));

        let _listener = transport.listen(&identity).await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_connection_reaches_listener() -> eyre::Result<()> {
        let transport = MemoryTransport::new();
        let client = create_keypair(Some(&[1; 32]));
        let server = create_keypair(Some(&[2; 32]));

        let mut listener = transport.listen(&server).await?;
        let outbound = transport.connect(server.public_key(), &client).await?;
        let inbound = listener.accept().await.ok_or_else(|| eyre::eyre!("no socket"))?;

        assert_eq!(outbound.remote_public_key(), server.public_key());
        assert_eq!(inbound.remote_public_key(), client.public_key());

        let (_, mut outbound_io, outbound_control) = outbound.into_parts();
        let (_, mut inbound_io, inbound_control) = inbound.into_parts();

        outbound_io.write_all(b"hello").await?;
        let mut buf = [0; 5];
        let _ = inbound_io.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"hello");

        inbound_control.request_close();
        outbound_control.closed().await;
        assert!(!outbound_io.writable());

        Ok(())
    }

    #[tokio::test]
    async fn test_destroy_closes_everything() -> eyre::Result<()> {
        let transport = MemoryTransport::new();
        let client = create_keypair(Some(&[1; 32]));
        let server = create_keypair(Some(&[2; 32]));

        let _listener = transport.listen(&server).await?;
        let outbound = transport.connect(server.public_key(), &client).await?;

        transport.destroy().await?;

        outbound.control().closed().await;
        assert!(!transport.is_listening(&server.public_key()));
        assert!(matches!(
            transport.listen(&server).await,
            Err(TransportError::Destroyed)
        ));
        assert!(matches!(
            transport.connect(server.public_key(), &client).await,
            Err(TransportError::Destroyed)
        ));

        Ok(())
    }
}

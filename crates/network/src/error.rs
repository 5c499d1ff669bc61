use std::io;

use atek_network_primitives::identity::PublicKey;
use thiserror::Error;

pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NetworkError {
    #[error("a transport is already active in this runtime")]
    DuplicateSetup,
    #[error("no transport is active in this runtime")]
    TransportInactive,
    #[error("no transport socket is attached to this connection")]
    SocketNotInitialized,
    #[error("failed to connect to {remote}")]
    Connect {
        remote: PublicKey,
        #[source]
        source: TransportError,
    },
    #[error("failed to listen as {local}")]
    Listen {
        local: PublicKey,
        #[source]
        source: TransportError,
    },
    #[error("protocol negotiation with {remote} failed")]
    Negotiation {
        remote: PublicKey,
        #[source]
        source: io::Error,
    },
    #[error("timed out waiting for the connection to {remote} to close")]
    CloseTimeout { remote: PublicKey },
    #[error("failed to close {} connection(s)", .0.len())]
    Close(Vec<NetworkError>),
    #[error("failed to tear down the transport")]
    Destroy(#[source] TransportError),
}

/// Failures reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("transport has been destroyed")]
    Destroyed,
    #[error("no listener is reachable for peer {0}")]
    PeerNotFound(PublicKey),
    #[error("already listening as {0}")]
    AlreadyListening(PublicKey),
    #[error("peer {0} has no usable ed25519 key")]
    InvalidPublicKey(PublicKey),
    #[error("failed to open stream")]
    Dial(#[source] BoxedError),
    #[error("failed to set up transport")]
    Setup(#[source] BoxedError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

//! Connection multiplexing over a public-key addressed DHT.
//!
//! A [`Runtime`] holds the active [`Transport`](transport::Transport). Each
//! [`Node`] is one local identity on it: it dials peers by public key, accepts
//! inbound connections, routes them to protocol handlers and keeps a registry
//! of live [`Connection`]s per remote.

use atek_network_primitives::config::TransportConfig;

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod negotiate;
pub mod node;
pub mod runtime;
pub mod stream;
pub mod transport;

pub use atek_network_primitives::identity::{create_keypair, Keypair, PublicKey};
pub use atek_network_primitives::protocol::ProtocolToken;
pub use atek_network_primitives::{config, identity, protocol};
pub use connection::{Connection, ConnectionEvent};
pub use error::NetworkError;
pub use node::{Node, NodeEvent};
pub use runtime::Runtime;
pub use stream::SocketStream;

use crate::transport::p2p::P2pTransport;

/// Starts the libp2p transport on the global runtime.
pub fn setup(config: TransportConfig) -> Result<(), NetworkError> {
    Runtime::global().setup(P2pTransport::new(config))
}

/// Tears down the global runtime's transport, closing its active nodes first.
pub async fn destroy() -> Result<(), NetworkError> {
    Runtime::global().destroy().await
}

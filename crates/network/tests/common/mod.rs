use core::future::Future;
use core::time::Duration;

use atek_network::runtime::Runtime;
use atek_network::transport::memory::MemoryTransport;
use atek_network::{create_keypair, Connection, Node, NodeEvent, SocketStream};
use eyre::{eyre, Result as EyreResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ignored = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A runtime backed by its own in-memory transport.
pub struct Harness {
    pub runtime: Runtime,
    pub transport: MemoryTransport,
}

impl Harness {
    pub fn new() -> EyreResult<Self> {
        init_tracing();

        let runtime = Runtime::new();
        let transport = MemoryTransport::new();

        runtime.setup(transport.clone())?;

        Ok(Self { runtime, transport })
    }

    pub fn node(&self, seed: u8) -> Node {
        Node::new(self.runtime.clone(), create_keypair(Some(&[seed; 32])))
    }
}

pub async fn within<F: Future>(future: F) -> EyreResult<F::Output> {
    Ok(timeout(WAIT, future).await?)
}

pub async fn next_event(events: &mut UnboundedReceiver<NodeEvent>) -> EyreResult<NodeEvent> {
    within(events.recv())
        .await?
        .ok_or_else(|| eyre!("node event queue closed"))
}

/// Waits for the next accepted connection, skipping select hand-offs.
pub async fn next_connection(events: &mut UnboundedReceiver<NodeEvent>) -> EyreResult<Connection> {
    loop {
        if let NodeEvent::Connection(connection) = next_event(events).await? {
            return Ok(connection);
        }
    }
}

pub async fn echo(mut stream: SocketStream, _connection: Connection) {
    let mut buf = [0; 4];

    if stream.read_exact(&mut buf).await.is_ok() {
        let _ignored = stream.write_all(&buf).await;
    }
}

pub async fn fallback(mut stream: SocketStream, _connection: Connection) {
    let _ignored = stream.write_all(b"fallback").await;
}

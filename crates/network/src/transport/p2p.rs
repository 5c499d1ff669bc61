//! libp2p-backed DHT transport.
//!
//! Every local identity gets its own swarm: libp2p ties a swarm to exactly one
//! key, while a single process may dial and listen under several. Peers are
//! located through Kademlia, seeded from the configured bootstrap nodes, mDNS
//! discoveries and identify reports. Connections are plain libp2p streams on
//! [`ATEK_STREAM_PROTOCOL`].

use core::fmt::{self, Debug, Formatter};
use std::collections::hash_map::HashMap;

use async_trait::async_trait;
use atek_network_primitives::config::TransportConfig;
use atek_network_primitives::identity::{Keypair, PublicKey};
use eyre::{bail, Result as EyreResult};
use futures_util::StreamExt;
use libp2p::identify::{Behaviour as IdentifyBehaviour, Config as IdentifyConfig};
use libp2p::kad::store::MemoryStore;
use libp2p::kad::{Behaviour as KadBehaviour, Config as KadConfig, Mode};
use libp2p::mdns::tokio::Behaviour as MdnsTokioBehaviour;
use libp2p::mdns::{Behaviour as MdnsBehaviour, Config as MdnsConfig};
use libp2p::multiaddr::Protocol;
use libp2p::noise::Config as NoiseConfig;
use libp2p::ping::Behaviour as PingBehaviour;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::{NetworkBehaviour, Swarm};
use libp2p::tcp::Config as TcpConfig;
use libp2p::yamux::Config as YamuxConfig;
use libp2p::{Multiaddr, Stream as P2pStream, StreamProtocol, SwarmBuilder};
use libp2p_stream::{Behaviour as StreamBehaviour, Control, IncomingStreams};
use parking_lot::Mutex;
use tokio::io::duplex;
use tokio::task::JoinHandle;
use tokio::{select, spawn};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::{
    splice, Listener, PipeIo, RawSocket, SocketControl, Transport, PIPE_BUFFER_SIZE,
};

mod events;

const PROTOCOL_VERSION: &str = concat!("/", env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const ATEK_KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/atek/kad/1.0.0");

pub const ATEK_STREAM_PROTOCOL: StreamProtocol = StreamProtocol::new("/atek/stream/0.0.1");

#[derive(NetworkBehaviour)]
struct Behaviour {
    identify: IdentifyBehaviour,
    kad: KadBehaviour<MemoryStore>,
    mdns: Toggle<MdnsTokioBehaviour>,
    ping: PingBehaviour,
    stream: StreamBehaviour,
}

pub struct P2pTransport {
    config: TransportConfig,
    swarms: Mutex<HashMap<PublicKey, SwarmHandle>>,
    shutdown: CancellationToken,
}

struct SwarmHandle {
    control: Control,
    task: JoinHandle<()>,
}

impl P2pTransport {
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            swarms: Mutex::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stream control of the swarm running as `identity`, started on first use.
    fn control(&self, identity: &Keypair) -> Result<Control, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Destroyed);
        }

        let public_key = identity.public_key();
        let mut swarms = self.swarms.lock();

        if let Some(handle) = swarms.get(&public_key) {
            return Ok(handle.control.clone());
        }

        // Only the first swarm takes the configured ports.
        let ephemeral = !swarms.is_empty();

        let swarm = build_swarm(&self.config, identity, ephemeral)
            .map_err(|report| TransportError::Setup(report.into()))?;

        let control = swarm.behaviour().stream.new_control();
        let event_loop = EventLoop::new(swarm, self.shutdown.clone());

        let task = spawn(event_loop.run());

        info!(%public_key, "Started swarm");

        drop(swarms.insert(
            public_key,
            SwarmHandle {
                control: control.clone(),
                task,
            },
        ));

        Ok(control)
    }
}

impl Debug for P2pTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("P2pTransport")
            .field("config", &self.config)
            .field("swarms", &self.swarms.lock().keys().collect::<Vec<_>>())
            .field("destroyed", &self.shutdown.is_cancelled())
            .finish()
    }
}

#[async_trait]
impl Transport for P2pTransport {
    async fn connect(
        &self,
        remote: PublicKey,
        identity: &Keypair,
    ) -> Result<RawSocket, TransportError> {
        let peer_id = remote
            .to_peer_id()
            .map_err(|_| TransportError::InvalidPublicKey(remote))?;

        let mut control = self.control(identity)?;

        // TODO: resolve the peer through a Kademlia closest-peers query when no
        // address is known yet, instead of relying on discovery having run.
        let stream = control
            .open_stream(peer_id, ATEK_STREAM_PROTOCOL)
            .await
            .map_err(|err| TransportError::Dial(Box::new(err)))?;

        debug!(%peer_id, "Opened stream");

        Ok(bridge(remote, stream, &self.shutdown))
    }

    async fn listen(&self, identity: &Keypair) -> Result<Box<dyn Listener>, TransportError> {
        let public_key = identity.public_key();
        let mut control = self.control(identity)?;

        let incoming = control
            .accept(ATEK_STREAM_PROTOCOL)
            .map_err(|_| TransportError::AlreadyListening(public_key))?;

        Ok(Box::new(P2pListener {
            public_key,
            incoming: Some(incoming),
            shutdown: self.shutdown.clone(),
        }))
    }

    async fn destroy(&self) -> Result<(), TransportError> {
        self.shutdown.cancel();

        let handles: Vec<_> = self.swarms.lock().drain().collect();

        for (public_key, handle) in handles {
            if let Err(err) = handle.task.await {
                warn!(%public_key, %err, "Swarm event loop failed");
            }
        }

        Ok(())
    }
}

struct P2pListener {
    public_key: PublicKey,
    incoming: Option<IncomingStreams>,
    shutdown: CancellationToken,
}

impl Debug for P2pListener {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("P2pListener")
            .field("public_key", &self.public_key)
            .field("closed", &self.incoming.is_none())
            .finish()
    }
}

#[async_trait]
impl Listener for P2pListener {
    async fn accept(&mut self) -> Option<RawSocket> {
        let incoming = self.incoming.as_mut()?;

        loop {
            let next = select! {
                next = incoming.next() => next,
                () = self.shutdown.cancelled() => None,
            };

            let (peer_id, stream) = next?;

            match PublicKey::from_peer_id(&peer_id) {
                Ok(remote) => return Some(bridge(remote, stream, &self.shutdown)),
                Err(err) => {
                    warn!(%peer_id, %err, "Rejecting stream from peer without an ed25519 key");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Dropping the incoming streams unregisters the protocol.
        drop(self.incoming.take());

        Ok(())
    }
}

fn bridge(remote: PublicKey, stream: P2pStream, shutdown: &CancellationToken) -> RawSocket {
    let (io, inner) = duplex(PIPE_BUFFER_SIZE);
    let control = SocketControl::new();

    splice(inner, stream.compat(), control.clone(), shutdown.clone());

    RawSocket::new(remote, PipeIo::new(io, control.clone()), control)
}

fn build_swarm(
    config: &TransportConfig,
    identity: &Keypair,
    ephemeral: bool,
) -> EyreResult<Swarm<Behaviour>> {
    let keypair = identity.to_libp2p();
    let peer_id = keypair.public().to_peer_id();

    let bootstrap_peers = {
        let mut peers = vec![];

        for mut addr in config.bootstrap.nodes.list.iter().cloned() {
            let Some(Protocol::P2p(peer_id)) = addr.pop() else {
                bail!("Failed to parse peer id from addr {:?}", addr);
            };

            peers.push((peer_id, addr));
        }

        peers
    };

    let mut swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(TcpConfig::default(), NoiseConfig::new, YamuxConfig::default)?
        .with_quic()
        .with_behaviour(|key| Behaviour {
            identify: IdentifyBehaviour::new(
                IdentifyConfig::new(PROTOCOL_VERSION.to_owned(), key.public())
                    .with_push_listen_addr_updates(true),
            ),
            kad: {
                let mut kad = KadBehaviour::with_config(
                    peer_id,
                    MemoryStore::new(peer_id),
                    KadConfig::new(ATEK_KAD_PROTOCOL),
                );

                kad.set_mode(Some(Mode::Server));

                let has_bootstrap_peers = !bootstrap_peers.is_empty();

                for (peer_id, addr) in bootstrap_peers {
                    let _ignored = kad.add_address(&peer_id, addr);
                }

                if has_bootstrap_peers {
                    if let Err(err) = kad.bootstrap() {
                        warn!(%err, "Failed to bootstrap Kademlia");
                    }
                }

                kad
            },
            mdns: config
                .discovery
                .mdns
                .then_some(())
                .and_then(|()| MdnsBehaviour::new(MdnsConfig::default(), peer_id).ok())
                .into(),
            ping: PingBehaviour::default(),
            stream: StreamBehaviour::new(),
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(config.idle_connection_timeout))
        .build();

    for addr in &config.swarm.listen {
        let addr = if ephemeral {
            with_ephemeral_port(addr)
        } else {
            addr.clone()
        };

        let _ignored = swarm.listen_on(addr)?;
    }

    Ok(swarm)
}

fn with_ephemeral_port(addr: &Multiaddr) -> Multiaddr {
    addr.iter()
        .map(|protocol| match protocol {
            Protocol::Tcp(_) => Protocol::Tcp(0),
            Protocol::Udp(_) => Protocol::Udp(0),
            other => other,
        })
        .collect()
}

struct EventLoop {
    swarm: Box<Swarm<Behaviour>>,
    shutdown: CancellationToken,
}

impl EventLoop {
    fn new(swarm: Swarm<Behaviour>, shutdown: CancellationToken) -> Self {
        Self {
            swarm: Box::new(swarm),
            shutdown,
        }
    }

    async fn run(mut self) {
        loop {
            select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                () = self.shutdown.cancelled() => break,
            }
        }

        debug!(local_peer_id = %self.swarm.local_peer_id(), "Swarm stopped");
    }
}

#[cfg(test)]
mod tests {
    use core::net::Ipv4Addr;

    use atek_network_primitives::config::{
        BootstrapConfig, DiscoveryConfig, SwarmConfig, DEFAULT_IDLE_CONNECTION_TIMEOUT,
    };
    use atek_network_primitives::identity::create_keypair;

    use super::*;

    fn loopback_config() -> TransportConfig {
        TransportConfig::new(
            SwarmConfig::new(vec![Multiaddr::empty()
                .with(Protocol::Ip4(Ipv4Addr::LOCALHOST))
                .with(Protocol::Tcp(0))]),
            BootstrapConfig::default(),
            DiscoveryConfig::new(false),
            DEFAULT_IDLE_CONNECTION_TIMEOUT,
        )
    }

    #[test]
    fn test_ephemeral_port_rewrites_tcp_and_udp() -> eyre::Result<()> {
        let tcp: Multiaddr = "/ip4/0.0.0.0/tcp/2428".parse()?;
        let quic: Multiaddr = "/ip4/0.0.0.0/udp/2428/quic-v1".parse()?;

        assert_eq!(with_ephemeral_port(&tcp).to_string(), "/ip4/0.0.0.0/tcp/0");
        assert_eq!(
            with_ephemeral_port(&quic).to_string(),
            "/ip4/0.0.0.0/udp/0/quic-v1"
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_one_swarm_per_identity() -> eyre::Result<()> {
        let transport = P2pTransport::new(loopback_config());
        let alice = create_keypair(Some(&[1; 32]));
        let bob = create_keypair(Some(&[2; 32]));

        let _alice = transport.control(&alice)?;
        let _alice_again = transport.control(&alice)?;
        let _bob = transport.control(&bob)?;

        assert_eq!(transport.swarms.lock().len(), 2);

        transport.destroy().await?;

        assert!(transport.swarms.lock().is_empty());
        assert!(matches!(
            transport.control(&alice),
            Err(TransportError::Destroyed)
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_listen_twice_is_rejected() -> eyre::Result<()> {
        let transport = P2pTransport::new(loopback_config());
        let identity = create_keypair(Some(&[3; 32]));

        let _listener = transport.listen(&identity).await?;

        assert!(matches!(
            transport.listen(&identity).await,
            Err(TransportError::AlreadyListening(_))
        ));

        transport.destroy().await?;

        Ok(())
    }
}

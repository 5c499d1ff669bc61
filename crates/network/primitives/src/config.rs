use core::fmt::{self, Formatter};
use core::net::Ipv4Addr;
use core::time::Duration;

use multiaddr::{Multiaddr, Protocol};
use serde::de::{Error as SerdeError, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

pub const DEFAULT_PORT: u16 = 2428;

pub const DEFAULT_IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Options handed to the DHT transport when the runtime is set up.
#[derive(Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct TransportConfig {
    #[serde(default)]
    pub swarm: SwarmConfig,

    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default = "default_idle_connection_timeout")]
    pub idle_connection_timeout: Duration,
}

impl TransportConfig {
    #[must_use]
    pub const fn new(
        swarm: SwarmConfig,
        bootstrap: BootstrapConfig,
        discovery: DiscoveryConfig,
        idle_connection_timeout: Duration,
    ) -> Self {
        Self {
            swarm,
            bootstrap,
            discovery,
            idle_connection_timeout,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            swarm: SwarmConfig::default(),
            bootstrap: BootstrapConfig::default(),
            discovery: DiscoveryConfig::default(),
            idle_connection_timeout: DEFAULT_IDLE_CONNECTION_TIMEOUT,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct SwarmConfig {
    pub listen: Vec<Multiaddr>,
}

impl SwarmConfig {
    #[must_use]
    pub const fn new(listen: Vec<Multiaddr>) -> Self {
        Self { listen }
    }
}

impl Default for SwarmConfig {
    fn default() -> Self {
        let any = Multiaddr::empty().with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED));

        Self {
            listen: vec![
                any.clone().with(Protocol::Tcp(DEFAULT_PORT)),
                any.with(Protocol::Udp(DEFAULT_PORT))
                    .with(Protocol::QuicV1),
            ],
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[non_exhaustive]
pub struct BootstrapConfig {
    #[serde(default)]
    pub nodes: BootstrapNodes,
}

impl BootstrapConfig {
    #[must_use]
    pub const fn new(nodes: BootstrapNodes) -> Self {
        Self { nodes }
    }
}

/// Known DHT entry points. Every address must end with the node's `/p2p/` id.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(transparent)]
#[non_exhaustive]
pub struct BootstrapNodes {
    #[serde(deserialize_with = "deserialize_bootstrap")]
    pub list: Vec<Multiaddr>,
}

impl BootstrapNodes {
    #[must_use]
    pub const fn new(list: Vec<Multiaddr>) -> Self {
        Self { list }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct DiscoveryConfig {
    #[serde(default = "bool_true")]
    pub mdns: bool,
}

impl DiscoveryConfig {
    #[must_use]
    pub const fn new(mdns: bool) -> Self {
        Self { mdns }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { mdns: true }
    }
}

const fn bool_true() -> bool {
    true
}

const fn default_idle_connection_timeout() -> Duration {
    DEFAULT_IDLE_CONNECTION_TIMEOUT
}

fn deserialize_bootstrap<'de, D>(deserializer: D) -> Result<Vec<Multiaddr>, D::Error>
where
    D: Deserializer<'de>,
{
    struct BootstrapVisitor;

    impl<'de> Visitor<'de> for BootstrapVisitor {
        type Value = Vec<Multiaddr>;

        fn expecting(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
            formatter.write_str("a list of multiaddresses")
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut addrs = Vec::new();

            while let Some(addr) = seq.next_element::<Multiaddr>()? {
                let Some(Protocol::P2p(_)) = addr.iter().last() else {
                    return Err(SerdeError::custom(format!(
                        "bootstrap address {addr} is missing a peer ID"
                    )));
                };

                addrs.push(addr);
            }

            Ok(addrs)
        }
    }

    deserializer.deserialize_seq(BootstrapVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();

        assert_eq!(config.swarm.listen.len(), 2);
        assert_eq!(
            config.swarm.listen[0].to_string(),
            "/ip4/0.0.0.0/tcp/2428"
        );
        assert_eq!(
            config.swarm.listen[1].to_string(),
            "/ip4/0.0.0.0/udp/2428/quic-v1"
        );
        assert!(config.bootstrap.nodes.list.is_empty());
        assert!(config.discovery.mdns);
        assert_eq!(config.idle_connection_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_empty_toml_uses_defaults() -> eyre::Result<()> {
        let config: TransportConfig = toml::from_str("")?;

        assert_eq!(config.swarm.listen.len(), 2);
        assert!(config.discovery.mdns);

        Ok(())
    }

    #[test]
    fn test_parse_toml() -> eyre::Result<()> {
        let config: TransportConfig = toml::from_str(
            r#"
            bootstrap.nodes = [
                "/ip4/127.0.0.1/tcp/4001/p2p/12D3KooWMgoF9xzyeKJHtRvrYwdomheRbHPELagWZwTLmXb6bCVC",
            ]

            [swarm]
            listen = ["/ip4/127.0.0.1/tcp/0"]

            [discovery]
            mdns = false
            "#,
        )?;

        assert_eq!(config.swarm.listen.len(), 1);
        assert_eq!(config.bootstrap.nodes.list.len(), 1);
        assert!(!config.discovery.mdns);

        Ok(())
    }

    #[test]
    fn test_bootstrap_requires_peer_id() {
        let result = serde_json::from_str::<BootstrapNodes>(r#"["/ip4/127.0.0.1/tcp/4001"]"#);

        let err = result.expect_err("address without peer id must be rejected");
        assert!(
            err.to_string().contains("missing a peer ID"),
            "unexpected error: {err}"
        );
    }
}

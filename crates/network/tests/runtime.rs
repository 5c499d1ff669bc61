use atek_network::config::{BootstrapConfig, DiscoveryConfig, SwarmConfig, TransportConfig};
use atek_network::runtime::Runtime;
use atek_network::{create_keypair, destroy, setup, NetworkError, Node};
use eyre::Result as EyreResult;

mod common;

fn offline_config() -> EyreResult<TransportConfig> {
    Ok(TransportConfig::new(
        SwarmConfig::new(vec!["/ip4/127.0.0.1/tcp/0".parse()?]),
        BootstrapConfig::default(),
        DiscoveryConfig::new(false),
        atek_network::config::DEFAULT_IDLE_CONNECTION_TIMEOUT,
    ))
}

// The only test in this binary touching the global runtime.
#[tokio::test]
async fn test_global_setup_lifecycle() -> EyreResult<()> {
    common::init_tracing();

    destroy().await?;
    assert!(!Runtime::global().is_active());

    setup(offline_config()?)?;
    assert!(Runtime::global().is_active());

    assert!(matches!(
        setup(offline_config()?),
        Err(NetworkError::DuplicateSetup)
    ));

    let node = Node::with_global_runtime(create_keypair(Some(&[5; 32])));
    node.listen().await?;
    assert_eq!(Runtime::global().active_nodes(), vec![node.public_key()]);

    destroy().await?;
    assert!(!Runtime::global().is_active());
    assert!(!node.is_listening());
    assert!(Runtime::global().active_nodes().is_empty());

    setup(offline_config()?)?;
    destroy().await?;
    destroy().await?;

    Ok(())
}

#[test]
fn test_keypairs_are_deterministic_per_seed() {
    let seed = [42; 32];

    assert_eq!(
        create_keypair(Some(&seed)).to_bytes(),
        create_keypair(Some(&seed)).to_bytes()
    );
    assert_ne!(
        create_keypair(Some(&seed)).public_key(),
        create_keypair(Some(&[43; 32])).public_key()
    );
    assert_ne!(
        create_keypair(None).public_key(),
        create_keypair(None).public_key()
    );
}

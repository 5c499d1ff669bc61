//! Protocol negotiation on freshly opened connections.
//!
//! The DHT carries no protocol identifier of its own, so the default
//! [`WildcardNegotiator`] exchanges nothing and every connection resolves to
//! the wildcard token. [`PreambleNegotiator`] lets the dialer name a protocol
//! by sending a length-prefixed token before any application data.

use core::fmt::Debug;
use core::time::Duration;
use std::io;

use async_trait::async_trait;
use atek_network_primitives::protocol::{ProtocolToken, WILDCARD};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::stream::SocketStream;

/// Longest token a [`PreambleNegotiator`] sends or accepts.
pub const MAX_TOKEN_LENGTH: usize = 256;

/// How long an inbound connection may take to name its protocol.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Negotiator: Debug + Send + Sync + 'static {
    /// Announces `protocol` on an outbound stream.
    async fn propose(&self, stream: &mut SocketStream, protocol: &ProtocolToken) -> io::Result<()>;

    /// Determines the protocol of an inbound stream.
    async fn accept(&self, stream: &mut SocketStream) -> io::Result<ProtocolToken>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WildcardNegotiator;

#[async_trait]
impl Negotiator for WildcardNegotiator {
    async fn propose(&self, _stream: &mut SocketStream, _protocol: &ProtocolToken) -> io::Result<()> {
        Ok(())
    }

    async fn accept(&self, _stream: &mut SocketStream) -> io::Result<ProtocolToken> {
        Ok(WILDCARD)
    }
}

/// Big-endian `u16` length followed by the UTF-8 token. An empty token is the
/// wildcard.
#[derive(Clone, Copy, Debug, Default)]
pub struct PreambleNegotiator;

#[async_trait]
impl Negotiator for PreambleNegotiator {
    async fn propose(&self, stream: &mut SocketStream, protocol: &ProtocolToken) -> io::Result<()> {
        let token = if protocol.is_wildcard() {
            &[][..]
        } else {
            protocol.as_str().as_bytes()
        };

        let length = u16::try_from(token.len())
            .ok()
            .filter(|length| usize::from(*length) <= MAX_TOKEN_LENGTH)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("protocol token exceeds {MAX_TOKEN_LENGTH} bytes"),
                )
            })?;

        stream.write_u16(length).await?;
        stream.write_all(token).await?;
        stream.flush().await
    }

    async fn accept(&self, stream: &mut SocketStream) -> io::Result<ProtocolToken> {
        let length = usize::from(stream.read_u16().await?);

        if length > MAX_TOKEN_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("protocol token of {length} bytes exceeds {MAX_TOKEN_LENGTH}"),
            ));
        }

        if length == 0 {
            return Ok(WILDCARD);
        }

        let mut token = vec![0; length];
        let _ = stream.read_exact(&mut token).await?;

        let token =
            String::from_utf8(token).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        Ok(ProtocolToken::from(token))
    }
}

#[cfg(test)]
mod tests {
    use atek_network_primitives::identity::create_keypair;
    use tokio::io::duplex;

    use super::*;
    use crate::transport::{PipeIo, SocketControl, PIPE_BUFFER_SIZE};

    fn pair() -> (SocketStream, SocketStream) {
        let (left, right) = duplex(PIPE_BUFFER_SIZE);
        let remote = create_keypair(Some(&[9; 32])).public_key();
        let control = SocketControl::new();

        (
            SocketStream::new(remote, Box::new(PipeIo::new(left, control.clone()))),
            SocketStream::new(remote, Box::new(PipeIo::new(right, control))),
        )
    }

    #[tokio::test]
    async fn test_wildcard_exchanges_nothing() -> eyre::Result<()> {
        let (mut client, mut server) = pair();

        WildcardNegotiator
            .propose(&mut client, &ProtocolToken::from("chat/1.0"))
            .await?;
        let protocol = WildcardNegotiator.accept(&mut server).await?;

        assert!(protocol.is_wildcard());

        client.write_all(b"x").await?;
        assert_eq!(server.read_u8().await?, b'x');

        Ok(())
    }

    #[tokio::test]
    async fn test_preamble_carries_token() -> eyre::Result<()> {
        let (mut client, mut server) = pair();

        PreambleNegotiator
            .propose(&mut client, &ProtocolToken::from("chat/1.0"))
            .await?;
        client.write_all(b"after").await?;

        let protocol = PreambleNegotiator.accept(&mut server).await?;
        assert_eq!(protocol.as_str(), "chat/1.0");

        let mut rest = [0; 5];
        let _ = server.read_exact(&mut rest).await?;
        assert_eq!(&rest, b"after");

        Ok(())
    }

    #[tokio::test]
    async fn test_preamble_wildcard_is_empty() -> eyre::Result<()> {
        let (mut client, mut server) = pair();

        PreambleNegotiator.propose(&mut client, &WILDCARD).await?;

        assert!(PreambleNegotiator.accept(&mut server).await?.is_wildcard());

        Ok(())
    }

    #[tokio::test]
    async fn test_preamble_rejects_oversized_token() -> eyre::Result<()> {
        let (mut client, mut server) = pair();

        let long = ProtocolToken::from("p".repeat(MAX_TOKEN_LENGTH + 1));
        let err = PreambleNegotiator
            .propose(&mut client, &long)
            .await
            .expect_err("oversized token must be refused");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        client.write_u16(1_024).await?;
        let err = PreambleNegotiator
            .accept(&mut server)
            .await
            .expect_err("oversized preamble must be refused");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        Ok(())
    }
}

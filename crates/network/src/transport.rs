//! The boundary to the DHT transport.
//!
//! A [`Transport`] dials and accepts encrypted point-to-point connections
//! addressed by public key. Each connection surfaces as a [`RawSocket`]: a
//! byte stream that only implements the bare read/write surface, plus a
//! [`SocketControl`] through which the connection is closed and its closure
//! observed.

use core::fmt::Debug;
use core::future::pending;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::io;

use async_trait::async_trait;
use atek_network_primitives::identity::{Keypair, PublicKey};
use tokio::io::{copy, split, AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::{select, spawn};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TransportError;

pub mod memory;
pub mod p2p;

pub(crate) const PIPE_BUFFER_SIZE: usize = 64 * 1_024;

#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// Dials `remote` using `identity` as the local key.
    ///
    /// Resolves once the connection is open, or already closed; a closed
    /// connection is still returned as a socket whose control reports closure.
    async fn connect(&self, remote: PublicKey, identity: &Keypair)
        -> Result<RawSocket, TransportError>;

    /// Starts accepting connections addressed to `identity`.
    async fn listen(&self, identity: &Keypair) -> Result<Box<dyn Listener>, TransportError>;

    async fn destroy(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Listener: Debug + Send + 'static {
    /// Next inbound connection, `None` once the listener is shut down.
    async fn accept(&mut self) -> Option<RawSocket>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Byte stream of a transport connection.
///
/// Transports only provide reads, writes and shutdown; buffering control and
/// timeouts are absent, and [`writable`](Self::writable) may keep reporting
/// `true` for a while after the output side has been shut down.
pub trait RawIo: AsyncRead + AsyncWrite + Debug + Send + Unpin + 'static {
    fn writable(&self) -> bool;
}

#[derive(Debug)]
pub struct RawSocket {
    remote_public_key: PublicKey,
    io: Box<dyn RawIo>,
    control: SocketControl,
}

impl RawSocket {
    pub fn new(remote_public_key: PublicKey, io: impl RawIo, control: SocketControl) -> Self {
        Self {
            remote_public_key,
            io: Box::new(io),
            control,
        }
    }

    #[must_use]
    pub const fn remote_public_key(&self) -> PublicKey {
        self.remote_public_key
    }

    #[must_use]
    pub const fn control(&self) -> &SocketControl {
        &self.control
    }

    pub(crate) fn into_parts(self) -> (PublicKey, Box<dyn RawIo>, SocketControl) {
        (self.remote_public_key, self.io, self.control)
    }
}

/// Close request and close signal of one transport connection, shared by both
/// the transport and whoever holds the socket.
#[derive(Clone, Debug, Default)]
pub struct SocketControl {
    close_requested: CancellationToken,
    closed: CancellationToken,
}

impl SocketControl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the transport to tear the connection down.
    pub fn request_close(&self) {
        self.close_requested.cancel();
    }

    #[must_use]
    pub fn is_close_requested(&self) -> bool {
        self.close_requested.is_cancelled()
    }

    pub async fn close_requested(&self) {
        self.close_requested.cancelled().await;
    }

    /// Reports that the connection is gone, whichever side ended it.
    pub fn mark_closed(&self) {
        self.closed.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

/// Local end of a [`splice`]d connection.
#[derive(Debug)]
pub struct PipeIo {
    io: DuplexStream,
    control: SocketControl,
}

impl PipeIo {
    pub(crate) const fn new(io: DuplexStream, control: SocketControl) -> Self {
        Self { io, control }
    }
}

impl RawIo for PipeIo {
    // Tracks the connection, not the local shutdown.
    fn writable(&self) -> bool {
        !self.control.is_closed()
    }
}

impl AsyncRead for PipeIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Moves bytes between the local end `a` and the transport end `b`.
///
/// The local end shutting down its output only half-closes `b`. The connection
/// ends when `b` reaches EOF or fails, either side asks for it to close, or
/// `stop` fires. Both ends are shut down and the control marked closed
/// afterwards.
pub(crate) fn splice<A, B>(a: A, b: B, control: SocketControl, stop: CancellationToken)
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    drop(spawn(async move {
        let (mut a_read, mut a_write) = split(a);
        let (mut b_read, mut b_write) = split(b);

        let outbound = async {
            copy(&mut a_read, &mut b_write).await?;
            b_write.shutdown().await?;

            pending::<io::Result<u64>>().await
        };

        select! {
            result = copy(&mut b_read, &mut a_write) => {
                if let Err(err) = result {
                    debug!(%err, "Socket pipe ended with an error");
                }
            }
            result = outbound => {
                if let Err(err) = result {
                    debug!(%err, "Socket pipe ended with an error");
                }
            }
            () = control.close_requested() => {}
            () = stop.cancelled() => {}
        }

        let mut a = a_read.unsplit(a_write);
        let mut b = b_read.unsplit(b_write);

        let _ignored = a.shutdown().await;
        let _ignored = b.shutdown().await;
        drop((a, b));

        control.mark_closed();
    }));
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt};

    use super::*;

    #[tokio::test]
    async fn test_splice_carries_bytes_both_ways() -> eyre::Result<()> {
        let (mut left, left_inner) = duplex(PIPE_BUFFER_SIZE);
        let (mut right, right_inner) = duplex(PIPE_BUFFER_SIZE);
        let control = SocketControl::new();

        splice(left_inner, right_inner, control.clone(), CancellationToken::new());

        left.write_all(b"ping").await?;
        let mut buf = [0; 4];
        let _ = right.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"ping");

        right.write_all(b"pong").await?;
        let _ = left.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"pong");

        assert!(!control.is_closed());

        Ok(())
    }

    #[tokio::test]
    async fn test_close_request_tears_down_both_ends() -> eyre::Result<()> {
        let (mut left, left_inner) = duplex(PIPE_BUFFER_SIZE);
        let (_right, right_inner) = duplex(PIPE_BUFFER_SIZE);
        let control = SocketControl::new();

        splice(left_inner, right_inner, control.clone(), CancellationToken::new());

        control.request_close();
        control.closed().await;

        let mut buf = Vec::new();
        let read = left.read_to_end(&mut buf).await?;
        assert_eq!(read, 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_transport_eof_closes_connection() -> eyre::Result<()> {
        let (mut left, left_inner) = duplex(PIPE_BUFFER_SIZE);
        let (mut right, right_inner) = duplex(PIPE_BUFFER_SIZE);
        let control = SocketControl::new();

        splice(left_inner, right_inner, control.clone(), CancellationToken::new());

        right.write_all(b"bye").await?;
        drop(right);

        control.closed().await;

        let mut buf = Vec::new();
        let _ = left.read_to_end(&mut buf).await?;
        assert_eq!(buf, b"bye");

        Ok(())
    }

    #[tokio::test]
    async fn test_local_shutdown_only_half_closes() -> eyre::Result<()> {
        let (mut left, left_inner) = duplex(PIPE_BUFFER_SIZE);
        let (mut right, right_inner) = duplex(PIPE_BUFFER_SIZE);
        let control = SocketControl::new();

        splice(left_inner, right_inner, control.clone(), CancellationToken::new());

        left.write_all(b"last").await?;
        left.shutdown().await?;

        let mut buf = Vec::new();
        let _ = right.read_to_end(&mut buf).await?;
        assert_eq!(buf, b"last");
        assert!(!control.is_closed());

        right.write_all(b"reply").await?;
        let mut reply = [0; 5];
        let _ = left.read_exact(&mut reply).await?;
        assert_eq!(&reply, b"reply");

        drop(right);
        control.closed().await;

        Ok(())
    }

    #[tokio::test]
    async fn test_pipe_io_writable_follows_connection() {
        let (io, _peer) = duplex(PIPE_BUFFER_SIZE);
        let control = SocketControl::new();
        let pipe = PipeIo::new(io, control.clone());

        assert!(pipe.writable());
        control.mark_closed();
        assert!(!pipe.writable());
    }
}

//! Stream-interface adapter over transport sockets.

use core::fmt::{self, Debug, Formatter};
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use std::io;

use atek_network_primitives::identity::PublicKey;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::transport::RawIo;

/// A transport socket presented as a full duplex stream.
///
/// Buffering hints and idle timeouts have no meaning for DHT sockets, so
/// [`cork`](Self::cork), [`uncork`](Self::uncork) and
/// [`set_timeout`](Self::set_timeout) are accepted and ignored. Writability
/// is tracked locally: once the output side has been shut down the stream
/// reports itself unwritable, regardless of what the transport says.
pub struct SocketStream {
    remote_public_key: PublicKey,
    io: Box<dyn RawIo>,
    ended: bool,
}

impl SocketStream {
    pub(crate) fn new(remote_public_key: PublicKey, io: Box<dyn RawIo>) -> Self {
        Self {
            remote_public_key,
            io,
            ended: false,
        }
    }

    #[must_use]
    pub const fn remote_public_key(&self) -> PublicKey {
        self.remote_public_key
    }

    pub fn cork(&mut self) {}

    pub fn uncork(&mut self) {}

    pub fn set_timeout(&mut self, _timeout: Option<Duration>) {}

    #[must_use]
    pub fn is_writable(&self) -> bool {
        !self.ended && self.io.writable()
    }

    /// Whether the output side has been shut down.
    #[must_use]
    pub const fn is_ended(&self) -> bool {
        self.ended
    }
}

impl Debug for SocketStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketStream")
            .field("remote_public_key", &self.remote_public_key)
            .field("ended", &self.ended)
            .field("writable", &self.is_writable())
            .finish()
    }
}

impl AsyncRead for SocketStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for SocketStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.ended {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after end",
            )));
        }

        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.ended = true;

        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

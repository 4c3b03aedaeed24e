pub mod framing;

use async_trait::async_trait;
use bytes::Bytes;
use std::io;

/// A connected byte transport.
///
/// Sends are message-granular: each call is delivered whole and in order.
/// Receives are stream-granular: the reader asks for an exact number of bytes
/// regardless of how the sender split them.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a buffer to the peer.
    async fn send(&self, buf: Bytes) -> io::Result<()>;

    /// Send several buffers as one message without copying them together.
    async fn send_vectored(&self, bufs: &[Bytes]) -> io::Result<()>;

    /// Receive exactly `size` bytes, waiting until they have arrived.
    async fn recv(&self, size: usize) -> io::Result<Bytes>;
}

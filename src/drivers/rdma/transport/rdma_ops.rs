//! RDMA READ/WRITE operations.
//!
//! One-sided transfers against a buffer the peer registered and described to
//! us. The peer's CPU is not involved; completion only tells us our side is done.

use super::negotiate::NegotiatedParams;
use super::Shared;
use crate::drivers::rdma::buffer::RegionBuf;
use crate::drivers::rdma::remote_buf::BufferDescriptor;
use crate::error::{Error, Result, Stage};
use bytes::{Bytes, BytesMut};
use tracing::trace;

/// Validate a remote buffer and local length for an RDMA operation.
#[inline]
fn validate_rdma_buffers(
    remote: &BufferDescriptor,
    local_len: usize,
    params: &NegotiatedParams,
    op_name: &str,
) -> Result<()> {
    if !remote.is_valid() {
        return Err(Error::InvalidInput(format!("{op_name}: invalid remote buffer")));
    }
    if local_len == 0 {
        return Err(Error::InvalidInput(format!("{op_name}: empty transfer")));
    }
    if local_len > remote.len() as usize {
        return Err(Error::InvalidInput(format!(
            "{op_name}: {local_len} bytes exceed remote buffer ({})",
            remote.len()
        )));
    }
    if local_len > params.max_readwrite_size as usize {
        return Err(Error::InvalidInput(format!(
            "{op_name}: {local_len} bytes exceed negotiated limit {}",
            params.max_readwrite_size
        )));
    }
    Ok(())
}

impl Shared {
    /// Write `data` into the peer's buffer.
    pub(crate) async fn rdma_write(&self, remote: &BufferDescriptor, data: Bytes) -> Result<()> {
        let params = *self.ready_params()?;
        validate_rdma_buffers(remote, data.len(), &params, "RDMA WRITE")?;

        let _permit = self.rdma_slots.acquire().await.map_err(|_| Error::NotConnected)?;
        let wr_id = self.next_wr_id();
        let rx = self.expect_op(wr_id);
        if let Err(e) = self.qp.post_rdma_write(wr_id, remote, &data) {
            self.op_waiters.remove(&wr_id);
            return Err(self.one_sided_failed(Error::from_provider(Stage::Io, e)));
        }
        self.await_op(rx).await.map_err(|e| self.one_sided_failed(e))?;
        trace!("RDMA WRITE of {} bytes to {:#x}", data.len(), remote.offset());
        Ok(())
    }

    /// Read the whole of the peer's buffer.
    pub(crate) async fn rdma_read(&self, remote: &BufferDescriptor) -> Result<Bytes> {
        let params = *self.ready_params()?;
        let len = remote.len() as usize;
        validate_rdma_buffers(remote, len, &params, "RDMA READ")?;

        let _permit = self.rdma_slots.acquire().await.map_err(|_| Error::NotConnected)?;
        let local = RegionBuf::new(BytesMut::with_capacity(len));
        let wr_id = self.next_wr_id();
        let rx = self.expect_op(wr_id);
        if let Err(e) = self.qp.post_rdma_read(wr_id, remote, &local) {
            self.op_waiters.remove(&wr_id);
            return Err(self.one_sided_failed(Error::from_provider(Stage::Io, e)));
        }
        self.await_op(rx).await.map_err(|e| self.one_sided_failed(e))?;

        let data = local.take();
        if data.len() != len {
            return Err(Error::Transport(format!("RDMA READ returned {} of {len} bytes", data.len())));
        }
        trace!("RDMA READ of {len} bytes from {:#x}", remote.offset());
        Ok(data.freeze())
    }

    /// A failed one-sided operation leaves the queue pair in error.
    fn one_sided_failed(&self, err: Error) -> Error {
        if !err.is_retryable() {
            self.request_disconnect("one-sided operation failed");
        }
        err
    }
}

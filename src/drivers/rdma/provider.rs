//! RDMA capability provider interface.
//!
//! The transport never talks to hardware directly. A provider hands it an
//! established [`QueuePair`] plus a channel of [`ProviderEvent`]s; completions
//! and connection-manager events arrive on that channel and are processed by
//! the connection's dispatcher task. Posting methods never block.

use crate::drivers::rdma::buffer::{RecvBuffer, RegionBuf};
use crate::drivers::rdma::remote_buf::BufferDescriptor;
use crate::error::ProviderError;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

/// Work request identifier, unique per connection.
pub type WrId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    /// The work request was flushed because the queue pair went down.
    Flushed,
    LocalLengthError,
    RemoteAccessError,
    Fatal,
}

#[derive(Debug)]
pub enum Completion {
    Send {
        wr_id: WrId,
        status: CompletionStatus,
    },
    Recv {
        buffer: RecvBuffer,
        byte_len: usize,
        status: CompletionStatus,
        /// Set when the sender asked to invalidate one of our registrations.
        invalidated_key: Option<u32>,
    },
    /// Registration, local invalidate, or one-sided read/write.
    Op {
        wr_id: WrId,
        status: CompletionStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmEvent {
    Disconnected,
    DeviceRemoved,
    Error(ProviderError),
}

#[derive(Debug)]
pub enum ProviderEvent {
    Completion(Completion),
    Cm(CmEvent),
}

pub type EventSender = flume::Sender<ProviderEvent>;
pub type EventReceiver = flume::Receiver<ProviderEvent>;

/// RDMA read resources exchanged at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectParams {
    pub responder_resources: u8,
    pub initiator_depth: u8,
}

/// What a provider returns once the link is up.
pub struct Established {
    pub qp: Arc<dyn QueuePair>,
    pub events: EventReceiver,
    /// The peer's connect parameters.
    pub peer: ConnectParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    RemoteRead,
    RemoteWrite,
}

/// Hardware memory-registration object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MrKey(pub u32);

/// One page-sized piece of a registration's scatter/gather list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub addr: u64,
    pub len: u32,
}

/// A connected reliable queue pair.
pub trait QueuePair: Send + Sync + 'static {
    /// Post a send of the concatenation of `sges`. If `invalidate` is set, the
    /// peer's registration with that key is fenced as the message is delivered.
    fn post_send(&self, wr_id: WrId, sges: &[Bytes], invalidate: Option<u32>) -> Result<(), ProviderError>;

    /// Post a receive buffer. On failure the buffer is handed back.
    fn post_recv(&self, buffer: RecvBuffer) -> Result<(), (ProviderError, RecvBuffer)>;

    /// Allocate a registration object able to describe up to `max_pages` pages.
    fn alloc_mr(&self, max_pages: u32) -> Result<MrKey, ProviderError>;

    fn dealloc_mr(&self, key: MrKey);

    /// Register `region`, described by `segments`, under `key`.
    fn post_reg_mr(
        &self,
        wr_id: WrId,
        key: MrKey,
        region: &RegionBuf,
        segments: &[Segment],
        access: Access,
    ) -> Result<(), ProviderError>;

    fn post_local_invalidate(&self, wr_id: WrId, key: MrKey) -> Result<(), ProviderError>;

    fn post_rdma_write(&self, wr_id: WrId, remote: &BufferDescriptor, data: &Bytes) -> Result<(), ProviderError>;

    /// Read `remote.len()` bytes into `local`.
    fn post_rdma_read(&self, wr_id: WrId, remote: &BufferDescriptor, local: &RegionBuf) -> Result<(), ProviderError>;

    /// Start a disconnect. Posted receives are flushed and a
    /// [`CmEvent::Disconnected`] follows. Idempotent.
    fn disconnect(&self);
}

/// Active side: resolves an address and establishes a link.
#[async_trait]
pub trait Device: Send + Sync + 'static {
    async fn connect(&self, addr: SocketAddr, params: ConnectParams) -> Result<Established, ProviderError>;
}

/// Passive side.
#[async_trait]
pub trait Listener: Send + Sync {
    fn local_addr(&self) -> SocketAddr;

    async fn accept(&self, params: ConnectParams) -> Result<Established, ProviderError>;
}

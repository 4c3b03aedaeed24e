//! RDMA connection engine.
//!
//! This module provides a credit-flow-controlled message transport over a
//! reliable RDMA queue pair:
//! - Credit-based flow control in both directions, plus a cap on in-flight sends
//! - Fragmentation of large messages and in-order reassembly on receive
//! - A memory registration pool for zero-copy one-sided transfers
//! - Idle keepalive and bounded teardown
//!
//! # Architecture
//!
//! The engine is split between caller-driven operations and a handful of
//! background tasks owned by the [`Connection`]:
//!
//! - **Dispatcher** (`completion`): drains provider events; upcalls only touch
//!   counters and queues and wake waiters
//! - **Credit worker** (`recv`): reposts receive buffers and sends credit-only packets
//! - **Idle timer** (`keepalive`): pings a quiet peer and detects stalls
//! - **Recovery worker** (`mr`): resets invalidated and errored registrations
//!
//! # Module Structure
//!
//! - `config` - Transport configuration parameters
//! - `protocol` - Wire formats
//! - `state` - Connection status machine
//! - `flow_control` - Credit gates
//! - `negotiate` - Handshake
//! - `send` / `recv` / `reassembly` - Data path
//! - `keepalive`, `rdma_ops`, `shutdown`, `types`

mod completion;
pub mod config;
mod flow_control;
mod keepalive;
pub mod negotiate;
pub mod protocol;
mod rdma_ops;
mod reassembly;
mod recv;
mod recv_pool;
mod send;
mod shutdown;
pub mod state;
mod types;

pub use config::TransportConfig;
pub use negotiate::NegotiatedParams;
pub use shutdown::TeardownResult;
pub use state::ConnectionStatus;
pub use types::{Role, StatsSnapshot};

use crate::drivers::rdma::buffer::{SendDescriptor, SendPool};
use crate::drivers::rdma::cm;
use crate::drivers::rdma::mr::{Direction, InvalidateMode, MrHandle, MrPool};
use crate::drivers::rdma::provider::{CompletionStatus, ConnectParams, Device, Established, QueuePair, WrId};
use crate::drivers::rdma::remote_buf::BufferDescriptor;
use crate::error::{Error, Result};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use flow_control::CreditGate;
use keepalive::KeepaliveState;
use reassembly::ReassemblyQueue;
use recv_pool::RecvPool;
use state::StatusCell;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};
pub(crate) use types::Stats;

/// State shared between the caller-facing [`Connection`] and its background tasks.
pub(crate) struct Shared {
    pub(crate) config: TransportConfig,
    pub(crate) role: Role,
    pub(crate) peer: ConnectParams,
    pub(crate) qp: Arc<dyn QueuePair>,
    pub(crate) status: StatusCell,
    params: OnceLock<NegotiatedParams>,

    // Send side: credits granted by the peer, and the in-flight cap.
    pub(crate) send_credits: CreditGate,
    pub(crate) send_pending: CreditGate,
    pub(crate) send_lock: tokio::sync::Mutex<()>,
    pub(crate) send_pool: SendPool,
    pub(crate) in_flight: DashMap<WrId, SendDescriptor>,

    // Receive side.
    /// Credits granted to the peer and not yet consumed by a received packet.
    pub(crate) receive_credits: AtomicU32,
    pub(crate) receive_credit_target: AtomicU32,
    /// Buffers posted since the last header went out; harvested into credits_granted.
    pub(crate) new_credits_offered: AtomicU32,
    pub(crate) posted_recvs: AtomicU32,
    pub(crate) recv_pool: RecvPool,
    pub(crate) reassembly: ReassemblyQueue,
    /// The last packet received carried neither payload nor a response request.
    pub(crate) last_recv_credit_only: AtomicBool,
    negotiation: Mutex<Option<oneshot::Sender<Bytes>>>,

    pub(crate) keepalive: KeepaliveState,
    pub(crate) refill: Notify,
    pub(crate) idle_rearm: Notify,

    pub(crate) op_waiters: DashMap<WrId, oneshot::Sender<CompletionStatus>>,
    pub(crate) mrs: MrPool,
    pub(crate) rdma_slots: Semaphore,

    next_wr_id: AtomicU64,
    pub(crate) teardown_started: AtomicBool,
    pub(crate) stats: Stats,
}

impl Shared {
    fn new(qp: Arc<dyn QueuePair>, config: TransportConfig, role: Role, peer: ConnectParams) -> Result<Self> {
        let mrs = MrPool::new(
            qp.as_ref(),
            2 * config.responder_resources as usize,
            config.max_frmr_depth,
        )?;
        Ok(Self {
            role,
            peer,
            status: StatusCell::new(),
            params: OnceLock::new(),

            send_credits: CreditGate::new(0, u16::MAX as usize),
            send_pending: CreditGate::new(
                config.send_credit_target as usize,
                config.send_credit_target as usize,
            ),
            send_lock: tokio::sync::Mutex::new(()),
            send_pool: SendPool::new(config.send_credit_target as usize, config.max_send_sge),
            in_flight: DashMap::new(),

            receive_credits: AtomicU32::new(0),
            receive_credit_target: AtomicU32::new(0),
            new_credits_offered: AtomicU32::new(0),
            posted_recvs: AtomicU32::new(0),
            recv_pool: RecvPool::new(config.receive_credit_max as usize, config.max_receive_size as usize),
            reassembly: ReassemblyQueue::new(),
            last_recv_credit_only: AtomicBool::new(false),
            negotiation: Mutex::new(None),

            keepalive: KeepaliveState::default(),
            refill: Notify::new(),
            idle_rearm: Notify::new(),

            op_waiters: DashMap::new(),
            mrs,
            rdma_slots: Semaphore::new(config.initiator_depth as usize),

            next_wr_id: AtomicU64::new(1),
            teardown_started: AtomicBool::new(false),
            stats: Stats::default(),
            qp,
            config,
        })
    }

    #[inline]
    pub(crate) fn next_wr_id(&self) -> WrId {
        self.next_wr_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn params(&self) -> Option<&NegotiatedParams> {
        self.params.get()
    }

    /// Parameters of a connection that is open for traffic.
    pub(crate) fn ready_params(&self) -> Result<&NegotiatedParams> {
        if self.status.get() != ConnectionStatus::Connected || self.status.is_negotiating() {
            return Err(Error::NotConnected);
        }
        self.params.get().ok_or(Error::NotConnected)
    }

    pub(crate) fn apply_params(&self, params: NegotiatedParams) {
        if self.params.set(params).is_err() {
            return;
        }
        self.receive_credit_target
            .store(params.receive_credit_target as u32, Ordering::Release);
        if params.initial_send_credits > 0 {
            Stats::add(&self.stats.peer_credits_granted, params.initial_send_credits as u64);
            self.send_credits.release(params.initial_send_credits as usize);
        }
        let excess = self.config.initiator_depth.saturating_sub(params.initiator_depth) as u32;
        if excess > 0 {
            if let Ok(permits) = self.rdma_slots.try_acquire_many(excess) {
                permits.forget();
            }
        }
    }

    pub(crate) fn negotiation_slot(&self) -> MutexGuard<'_, Option<oneshot::Sender<Bytes>>> {
        self.negotiation.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move the connection to `next`. Leaving the live states fails every
    /// blocked sender, registration and one-sided operation.
    pub(crate) fn transition(&self, next: ConnectionStatus) -> bool {
        let from = self.status.get();
        if !self.status.transition(next) {
            return false;
        }
        debug!("connection status {from:?} -> {next:?}");
        if !next.is_live() {
            self.send_credits.close();
            self.send_pending.close();
            self.rdma_slots.close();
            self.op_waiters.clear();
            self.refill.notify_one();
        }
        true
    }

    /// Begin an orderly disconnect. Safe to call from any path, any number of times.
    pub(crate) fn request_disconnect(&self, reason: &str) {
        if !matches!(
            self.status.get(),
            ConnectionStatus::Connecting | ConnectionStatus::Connected | ConnectionStatus::NegotiateFailed
        ) {
            return;
        }
        if self.transition(ConnectionStatus::Disconnecting) {
            info!("disconnecting: {reason}");
            self.qp.disconnect();
        }
    }
}

/// Where an initiating connection came from, kept for `reconnect`.
#[derive(Clone)]
pub(crate) struct Origin {
    pub device: Arc<dyn Device>,
    pub addr: SocketAddr,
}

/// A negotiated, credit-flow-controlled connection.
pub struct Connection {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
    origin: Option<Origin>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.shared.role)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Bring up the engine on an established link and run the handshake.
    pub(crate) async fn establish(
        established: Established,
        config: TransportConfig,
        role: Role,
        origin: Option<Origin>,
    ) -> Result<Self> {
        let Established { qp, events, peer } = established;
        let shared = match Shared::new(Arc::clone(&qp), config, role, peer) {
            Ok(shared) => Arc::new(shared),
            Err(e) => {
                qp.disconnect();
                return Err(e);
            }
        };

        let mut conn = Connection {
            tasks: vec![
                tokio::spawn(completion::run_dispatcher(Arc::clone(&shared), events)),
                tokio::spawn(recv::run_credit_worker(Arc::clone(&shared))),
                tokio::spawn(crate::drivers::rdma::mr::run_recovery_worker(Arc::clone(&shared))),
            ],
            shared,
            origin,
        };
        conn.shared.transition(ConnectionStatus::Connected);

        let negotiated = match role {
            Role::Initiator => conn.shared.negotiate_as_initiator().await,
            Role::Responder => conn.shared.negotiate_as_responder().await,
        };
        if let Err(e) = negotiated {
            info!("negotiation failed: {e}");
            conn.shared.transition(ConnectionStatus::NegotiateFailed);
            let result = conn.shared.teardown().await;
            debug!("failed connection torn down: {result:?}");
            return Err(e);
        }

        conn.tasks
            .push(tokio::spawn(keepalive::run_idle_timer(Arc::clone(&conn.shared))));
        Ok(conn)
    }

    /// Send one logical message. Fragmentation is invisible to the receiver's reads.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        self.shared.send_message(std::slice::from_ref(&data), None).await
    }

    /// Send several buffers as one logical message without copying them.
    pub async fn send_vectored(&self, bufs: &[Bytes]) -> Result<()> {
        self.shared.send_message(bufs, None).await
    }

    /// Send a message that also fences the peer's registration `token`.
    pub async fn send_with_invalidate(&self, data: Bytes, token: u32) -> Result<()> {
        self.shared
            .send_message(std::slice::from_ref(&data), Some(token))
            .await
    }

    /// Read exactly `size` bytes, waiting until enough have arrived.
    pub async fn recv(&self, size: usize) -> Result<Bytes> {
        self.shared.read(size).await
    }

    /// Register `buf` for direct access by the peer.
    pub async fn register_memory(
        &self,
        buf: BytesMut,
        direction: Direction,
        mode: InvalidateMode,
    ) -> Result<MrHandle> {
        Shared::register_memory(&self.shared, buf, direction, mode).await
    }

    /// Write `data` straight into the peer buffer described by `remote`.
    pub async fn rdma_write(&self, remote: &BufferDescriptor, data: Bytes) -> Result<()> {
        self.shared.rdma_write(remote, data).await
    }

    /// Read the whole peer buffer described by `remote`.
    pub async fn rdma_read(&self, remote: &BufferDescriptor) -> Result<Bytes> {
        self.shared.rdma_read(remote).await
    }

    /// Start disconnecting. Blocked operations fail with [`Error::NotConnected`].
    pub fn disconnect(&self) {
        self.shared.request_disconnect("requested by caller");
    }

    /// Resolves once the connection has left the connected state.
    pub async fn closed(&self) {
        self.shared.status.closed().await;
    }

    /// Tear everything down and run connect plus negotiation again.
    /// Only the initiating side can do this.
    pub async fn reconnect(&mut self) -> Result<()> {
        let origin = self
            .origin
            .clone()
            .ok_or_else(|| Error::InvalidInput("only the initiating side can reconnect".into()))?;
        info!("reconnecting to {}", origin.addr);
        let result = self.shared.teardown().await;
        debug!("previous connection torn down: {result:?}");
        self.abort_tasks();

        let fresh = cm::connect_from(origin, self.shared.config.clone()).await?;
        *self = fresh;
        Ok(())
    }

    /// Release every resource, waiting (bounded) for in-flight work to drain.
    pub async fn destroy(mut self) -> TeardownResult {
        let result = self.shared.teardown().await;
        self.abort_tasks();
        result
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.get()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.ready_params().is_ok()
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn params(&self) -> Option<NegotiatedParams> {
        self.shared.params().copied()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Send credits currently available.
    pub fn send_credits(&self) -> usize {
        self.shared.send_credits.available()
    }

    /// Credits granted to the peer and not yet used.
    pub fn receive_credits(&self) -> u32 {
        self.shared.receive_credits.load(Ordering::Acquire)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.abort_tasks();
        self.shared.request_disconnect("connection dropped");
    }
}

#[async_trait]
impl Transport for Connection {
    async fn send(&self, buf: Bytes) -> io::Result<()> {
        Connection::send(self, buf).await.map_err(Into::into)
    }

    async fn send_vectored(&self, bufs: &[Bytes]) -> io::Result<()> {
        Connection::send_vectored(self, bufs).await.map_err(Into::into)
    }

    async fn recv(&self, size: usize) -> io::Result<Bytes> {
        Connection::recv(self, size).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::protocol::{DataTransferHeader, NegotiateRequest, PROTOCOL_VERSION_1};
    use super::*;
    use crate::drivers::rdma::loopback::LoopbackFabric;
    use crate::drivers::rdma::provider::{Device, Listener};
    use std::time::Duration;

    const RAW_PARAMS: ConnectParams = ConnectParams {
        responder_resources: 4,
        initiator_depth: 4,
    };

    /// Accept on `port` while a bare provider link plays the initiator.
    async fn raw_initiator(
        fabric: &LoopbackFabric,
        port: u16,
        config: TransportConfig,
    ) -> (Established, tokio::task::JoinHandle<Result<Connection>>) {
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let listener = fabric.listen(addr).unwrap();
        let server = tokio::spawn(async move {
            let established = listener.accept(RAW_PARAMS).await.unwrap();
            Connection::establish(established, config, Role::Responder, None).await
        });
        let raw = fabric.connect(addr, RAW_PARAMS).await.unwrap();
        (raw, server)
    }

    fn request() -> Bytes {
        NegotiateRequest {
            min_version: PROTOCOL_VERSION_1,
            max_version: PROTOCOL_VERSION_1,
            credits_requested: 4,
            preferred_send_size: 1364,
            max_receive_size: 1364,
            max_fragmented_size: 1024 * 1024,
        }
        .encode()
    }

    #[tokio::test]
    async fn test_malformed_packet_is_protocol_violation() {
        let fabric = LoopbackFabric::new();
        let (raw, server) = raw_initiator(&fabric, 6001, TransportConfig::default()).await;
        raw.qp.post_send(1, &[request()], None).unwrap();
        let server = server.await.unwrap().unwrap();
        assert_eq!(server.status(), ConnectionStatus::Connected);

        // Claims 100 payload bytes but carries 4.
        let mut packet = BytesMut::new();
        DataTransferHeader::new(1, 0, 0, 100, 0).encode_into(&mut packet);
        packet.extend_from_slice(b"oops");
        raw.qp.post_send(2, &[packet.freeze()], None).unwrap();

        tokio::time::timeout(Duration::from_secs(1), server.closed())
            .await
            .expect("violation did not close the connection");
        assert_eq!(server.stats().protocol_violations, 1);
        assert_eq!(server.stats().bytes_received, 0);
        assert!(matches!(server.recv(1).await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_silent_initiator_times_out() {
        let fabric = LoopbackFabric::new();
        let config = TransportConfig::default().with_negotiate_timeout(Duration::from_millis(50));
        let (_raw, server) = raw_initiator(&fabric, 6002, config).await;

        let err = server.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Negotiation(crate::error::NegotiateError::Timeout(_))
        ));
        assert_eq!(fabric.allocated_mrs(), 0);
    }

    #[tokio::test]
    async fn test_zero_credit_request_rejected() {
        let fabric = LoopbackFabric::new();
        let (raw, server) = raw_initiator(&fabric, 6003, TransportConfig::default()).await;
        let mut req = NegotiateRequest::decode(&request()).unwrap();
        req.credits_requested = 0;
        raw.qp.post_send(1, &[req.encode()], None).unwrap();

        let err = server.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Negotiation(crate::error::NegotiateError::ZeroCreditsRequested)
        ));
    }
}

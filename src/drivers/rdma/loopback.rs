//! In-process RDMA provider.
//!
//! Both ends of every link live in this process. Sends are copied straight into
//! the peer's posted receive buffers (or queued until one is posted), memory
//! registrations live in a fabric-wide table so the peer's one-sided operations
//! and send-with-invalidate can reach them, and disconnect flushes posted
//! receives on both sides.

use crate::drivers::rdma::buffer::{RecvBuffer, RegionBuf};
use crate::drivers::rdma::provider::{
    Access, CmEvent, Completion, CompletionStatus, ConnectParams, Device, Established, EventReceiver, EventSender,
    Listener, MrKey, ProviderEvent, QueuePair, Segment, WrId,
};
use crate::drivers::rdma::remote_buf::BufferDescriptor;
use crate::error::ProviderError;
use async_trait::async_trait;
use bytes::Bytes;
use crossbeam::queue::SegQueue;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, trace};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared medium for loopback links. Cheap to clone.
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    inner: Arc<FabricInner>,
}

#[derive(Default)]
struct FabricInner {
    listeners: Mutex<FxHashMap<SocketAddr, flume::Sender<PendingConnect>>>,
    mrs: Mutex<FxHashMap<u32, MrEntry>>,
    next_index: AtomicU32,
    free_keys: SegQueue<u32>,
    blackhole: AtomicBool,
    injected: Mutex<Option<ProviderError>>,
}

struct MrEntry {
    max_pages: u32,
    registration: Option<Registration>,
}

struct Registration {
    region: RegionBuf,
    base: u64,
    len: u64,
    access: Access,
}

struct PendingConnect {
    link: Arc<Link>,
    events: EventReceiver,
    initiator: ConnectParams,
    reply: oneshot::Sender<ConnectParams>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting connections on `addr`.
    pub fn listen(&self, addr: SocketAddr) -> Result<LoopbackListener, ProviderError> {
        let mut listeners = lock(&self.inner.listeners);
        if listeners.contains_key(&addr) {
            return Err(ProviderError::Other {
                code: 98,
                message: format!("address {addr} in use"),
            });
        }
        let (tx, rx) = flume::unbounded();
        listeners.insert(addr, tx);
        debug!("loopback listener on {addr}");
        Ok(LoopbackListener {
            fabric: Arc::clone(&self.inner),
            addr,
            rx,
        })
    }

    /// While set, every send completes successfully but is never delivered.
    pub fn set_blackhole(&self, on: bool) {
        self.inner.blackhole.store(on, Ordering::Release);
    }

    /// Make the next send or registration posted on any link fail with `err`.
    pub fn fail_next_post(&self, err: ProviderError) {
        *lock(&self.inner.injected) = Some(err);
    }

    /// Number of registrations currently reachable by remote access.
    pub fn live_registrations(&self) -> usize {
        lock(&self.inner.mrs)
            .values()
            .filter(|e| e.registration.is_some())
            .count()
    }

    /// Number of allocated registration objects.
    pub fn allocated_mrs(&self) -> usize {
        lock(&self.inner.mrs).len()
    }
}

impl FabricInner {
    fn take_injected(&self) -> Result<(), ProviderError> {
        match lock(&self.injected).take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn alloc_key(&self, max_pages: u32) -> MrKey {
        // Recycled objects keep their index and bump the low byte, so a stale
        // key never matches the new registration.
        let key = match self.free_keys.pop() {
            Some(old) => (old & !0xff) | (old.wrapping_add(1) & 0xff),
            None => (self.next_index.fetch_add(1, Ordering::Relaxed) + 1) << 8,
        };
        lock(&self.mrs).insert(
            key,
            MrEntry {
                max_pages,
                registration: None,
            },
        );
        MrKey(key)
    }

    fn dealloc_key(&self, key: MrKey) {
        if lock(&self.mrs).remove(&key.0).is_some() {
            self.free_keys.push(key.0);
        }
    }

    fn register(&self, key: MrKey, region: &RegionBuf, segments: &[Segment], access: Access) -> CompletionStatus {
        let mut mrs = lock(&self.mrs);
        let Some(entry) = mrs.get_mut(&key.0) else {
            return CompletionStatus::Fatal;
        };
        let Some(first) = segments.first() else {
            return CompletionStatus::Fatal;
        };
        if segments.len() > entry.max_pages as usize {
            return CompletionStatus::LocalLengthError;
        }
        let mut next = first.addr;
        for seg in segments {
            if seg.addr != next {
                return CompletionStatus::Fatal;
            }
            next += seg.len as u64;
        }
        let len = next - first.addr;
        if len > region.len() as u64 {
            return CompletionStatus::LocalLengthError;
        }
        entry.registration = Some(Registration {
            region: region.clone(),
            base: first.addr,
            len,
            access,
        });
        CompletionStatus::Success
    }

    fn invalidate(&self, key: u32) -> bool {
        match lock(&self.mrs).get_mut(&key) {
            Some(entry) => {
                entry.registration = None;
                true
            }
            None => false,
        }
    }

    fn remote_access(
        &self,
        remote: &BufferDescriptor,
        access: Access,
        len: usize,
        f: impl FnOnce(&mut [u8]),
    ) -> CompletionStatus {
        let mrs = lock(&self.mrs);
        let Some(reg) = mrs.get(&remote.token()).and_then(|e| e.registration.as_ref()) else {
            return CompletionStatus::RemoteAccessError;
        };
        if reg.access != access || len > remote.len() as usize {
            return CompletionStatus::RemoteAccessError;
        }
        let Some(start) = remote.offset().checked_sub(reg.base) else {
            return CompletionStatus::RemoteAccessError;
        };
        let end = start + len as u64;
        if end > reg.len {
            return CompletionStatus::RemoteAccessError;
        }
        reg.region.with(|buf| {
            if end as usize > buf.len() {
                return CompletionStatus::RemoteAccessError;
            }
            f(&mut buf[start as usize..end as usize]);
            CompletionStatus::Success
        })
    }
}

struct Link {
    fabric: Arc<FabricInner>,
    sides: [Side; 2],
}

struct Side {
    events: EventSender,
    state: Mutex<SideState>,
}

struct SideState {
    posted: VecDeque<RecvBuffer>,
    backlog: VecDeque<Inbound>,
    connected: bool,
}

struct Inbound {
    data: Vec<u8>,
    invalidated_key: Option<u32>,
}

impl Side {
    fn new(events: EventSender) -> Self {
        Self {
            events,
            state: Mutex::new(SideState {
                posted: VecDeque::new(),
                backlog: VecDeque::new(),
                connected: true,
            }),
        }
    }

    fn emit(&self, event: ProviderEvent) {
        // The engine may already be gone; nothing left to notify then.
        let _ = self.events.send(event);
    }

    /// Hand `inbound` to a posted buffer, or queue it until one is posted.
    /// Returns the status the sender observes.
    fn deliver(&self, inbound: Inbound) -> CompletionStatus {
        let mut st = lock(&self.state);
        if !st.connected {
            return CompletionStatus::Flushed;
        }
        match st.posted.pop_front() {
            Some(buffer) => {
                let (completion, sender_status) = fill(buffer, inbound);
                self.emit(ProviderEvent::Completion(completion));
                sender_status
            }
            None => {
                st.backlog.push_back(inbound);
                CompletionStatus::Success
            }
        }
    }

    fn shut_down(&self) {
        let mut st = lock(&self.state);
        if !st.connected {
            return;
        }
        st.connected = false;
        st.backlog.clear();
        for buffer in st.posted.drain(..) {
            self.emit(ProviderEvent::Completion(Completion::Recv {
                buffer,
                byte_len: 0,
                status: CompletionStatus::Flushed,
                invalidated_key: None,
            }));
        }
        self.emit(ProviderEvent::Cm(CmEvent::Disconnected));
    }
}

fn fill(mut buffer: RecvBuffer, inbound: Inbound) -> (Completion, CompletionStatus) {
    let len = inbound.data.len();
    if len > buffer.capacity() {
        let completion = Completion::Recv {
            buffer,
            byte_len: 0,
            status: CompletionStatus::LocalLengthError,
            invalidated_key: None,
        };
        return (completion, CompletionStatus::RemoteAccessError);
    }
    buffer.as_mut_slice()[..len].copy_from_slice(&inbound.data);
    let completion = Completion::Recv {
        buffer,
        byte_len: len,
        status: CompletionStatus::Success,
        invalidated_key: inbound.invalidated_key,
    };
    (completion, CompletionStatus::Success)
}

/// One end of a loopback link.
pub struct LoopbackQp {
    link: Arc<Link>,
    side: usize,
}

impl LoopbackQp {
    fn local(&self) -> &Side {
        &self.link.sides[self.side]
    }

    fn remote(&self) -> &Side {
        &self.link.sides[1 - self.side]
    }

    fn fabric(&self) -> &FabricInner {
        &self.link.fabric
    }

    fn check_connected(&self) -> Result<(), ProviderError> {
        if lock(&self.local().state).connected {
            Ok(())
        } else {
            Err(ProviderError::NotConnected)
        }
    }

    fn complete(&self, completion: Completion) {
        self.local().emit(ProviderEvent::Completion(completion));
    }
}

impl QueuePair for LoopbackQp {
    fn post_send(&self, wr_id: WrId, sges: &[Bytes], invalidate: Option<u32>) -> Result<(), ProviderError> {
        self.fabric().take_injected()?;
        self.check_connected()?;

        if self.fabric().blackhole.load(Ordering::Acquire) {
            trace!("blackholed send wr_id={wr_id}");
            self.complete(Completion::Send {
                wr_id,
                status: CompletionStatus::Success,
            });
            return Ok(());
        }

        let mut data = Vec::with_capacity(sges.iter().map(Bytes::len).sum());
        for sge in sges {
            data.extend_from_slice(sge);
        }
        if let Some(key) = invalidate {
            if !self.fabric().invalidate(key) {
                debug!("send-with-invalidate for unknown key {key:#x}");
            }
        }
        let status = self.remote().deliver(Inbound {
            data,
            invalidated_key: invalidate,
        });
        self.complete(Completion::Send { wr_id, status });
        Ok(())
    }

    fn post_recv(&self, buffer: RecvBuffer) -> Result<(), (ProviderError, RecvBuffer)> {
        let side = self.local();
        let mut st = lock(&side.state);
        if !st.connected {
            return Err((ProviderError::NotConnected, buffer));
        }
        match st.backlog.pop_front() {
            Some(inbound) => {
                let (completion, _) = fill(buffer, inbound);
                side.emit(ProviderEvent::Completion(completion));
            }
            None => st.posted.push_back(buffer),
        }
        Ok(())
    }

    fn alloc_mr(&self, max_pages: u32) -> Result<MrKey, ProviderError> {
        Ok(self.fabric().alloc_key(max_pages))
    }

    fn dealloc_mr(&self, key: MrKey) {
        self.fabric().dealloc_key(key);
    }

    fn post_reg_mr(
        &self,
        wr_id: WrId,
        key: MrKey,
        region: &RegionBuf,
        segments: &[Segment],
        access: Access,
    ) -> Result<(), ProviderError> {
        self.fabric().take_injected()?;
        self.check_connected()?;
        let status = self.fabric().register(key, region, segments, access);
        self.complete(Completion::Op { wr_id, status });
        Ok(())
    }

    fn post_local_invalidate(&self, wr_id: WrId, key: MrKey) -> Result<(), ProviderError> {
        self.check_connected()?;
        let status = if self.fabric().invalidate(key.0) {
            CompletionStatus::Success
        } else {
            CompletionStatus::Fatal
        };
        self.complete(Completion::Op { wr_id, status });
        Ok(())
    }

    fn post_rdma_write(&self, wr_id: WrId, remote: &BufferDescriptor, data: &Bytes) -> Result<(), ProviderError> {
        self.check_connected()?;
        let status = self
            .fabric()
            .remote_access(remote, Access::RemoteWrite, data.len(), |dst| dst.copy_from_slice(data));
        self.complete(Completion::Op { wr_id, status });
        Ok(())
    }

    fn post_rdma_read(&self, wr_id: WrId, remote: &BufferDescriptor, local: &RegionBuf) -> Result<(), ProviderError> {
        self.check_connected()?;
        let len = remote.len() as usize;
        let status = self.fabric().remote_access(remote, Access::RemoteRead, len, |src| {
            local.with(|dst| {
                dst.clear();
                dst.extend_from_slice(src);
            })
        });
        self.complete(Completion::Op { wr_id, status });
        Ok(())
    }

    fn disconnect(&self) {
        for side in &self.link.sides {
            side.shut_down();
        }
    }
}

#[async_trait]
impl Device for LoopbackFabric {
    async fn connect(&self, addr: SocketAddr, params: ConnectParams) -> Result<Established, ProviderError> {
        let listener = lock(&self.inner.listeners)
            .get(&addr)
            .cloned()
            .ok_or(ProviderError::Unreachable)?;

        let (tx0, rx0) = flume::unbounded();
        let (tx1, rx1) = flume::unbounded();
        let link = Arc::new(Link {
            fabric: Arc::clone(&self.inner),
            sides: [Side::new(tx0), Side::new(tx1)],
        });

        let (reply_tx, reply_rx) = oneshot::channel();
        listener
            .send_async(PendingConnect {
                link: Arc::clone(&link),
                events: rx1,
                initiator: params,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ProviderError::Rejected)?;

        let peer = reply_rx.await.map_err(|_| ProviderError::Rejected)?;
        Ok(Established {
            qp: Arc::new(LoopbackQp { link, side: 0 }),
            events: rx0,
            peer,
        })
    }
}

/// Passive end registered on a [`LoopbackFabric`].
pub struct LoopbackListener {
    fabric: Arc<FabricInner>,
    addr: SocketAddr,
    rx: flume::Receiver<PendingConnect>,
}

#[async_trait]
impl Listener for LoopbackListener {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn accept(&self, params: ConnectParams) -> Result<Established, ProviderError> {
        loop {
            let pending = self.rx.recv_async().await.map_err(|_| ProviderError::Other {
                code: -1,
                message: "listener closed".into(),
            })?;
            if pending.reply.send(params).is_err() {
                debug!("initiator abandoned connect to {}", self.addr);
                continue;
            }
            return Ok(Established {
                qp: Arc::new(LoopbackQp {
                    link: pending.link,
                    side: 1,
                }),
                events: pending.events,
                peer: pending.initiator,
            });
        }
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        lock(&self.fabric.listeners).remove(&self.addr);
    }
}

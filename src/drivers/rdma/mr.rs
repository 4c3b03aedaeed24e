//! Memory registration pool.
//!
//! A fixed set of hardware registration objects is allocated when the
//! connection is set up. A caller takes one, describes its buffer to the
//! hardware with it, passes the resulting [`BufferDescriptor`] to the peer, and
//! gives it back with [`MrHandle::deregister`]. Objects the peer fenced, objects
//! whose registration failed, and objects whose handle was dropped while
//! registered are reset by a background recovery worker before they are handed
//! out again.

use crate::drivers::rdma::buffer::RegionBuf;
use crate::drivers::rdma::provider::{Access, MrKey, QueuePair, Segment};
use crate::drivers::rdma::remote_buf::BufferDescriptor;
use crate::drivers::rdma::transport::state::StatusCell;
use crate::drivers::rdma::transport::{Shared, Stats};
use crate::error::{Error, Result, Stage};
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Lifecycle of one registration object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MrState {
    /// Free for the next caller.
    Ready,
    /// Describes a caller buffer the peer may access.
    Registered,
    /// The peer fenced it with send-with-invalidate.
    Invalidated,
    /// Needs a reset by the recovery worker.
    Error,
}

/// Which one-sided operation the peer will perform on the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The peer reads from our buffer.
    ToPeer,
    /// The peer writes into our buffer.
    FromPeer,
}

impl Direction {
    fn access(self) -> Access {
        match self {
            Direction::ToPeer => Access::RemoteRead,
            Direction::FromPeer => Access::RemoteWrite,
        }
    }
}

/// Who fences the registration once the peer is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateMode {
    /// `deregister` posts a local invalidate and waits for it.
    Local,
    /// The peer invalidates it with send-with-invalidate. If that has not
    /// happened by the time of `deregister`, a local invalidate is posted.
    Remote,
}

struct Slot {
    key: MrKey,
    state: MrState,
    retired: bool,
}

struct Slots {
    slots: Vec<Slot>,
    by_key: FxHashMap<u32, usize>,
}

pub(crate) struct MrPool {
    inner: Mutex<Slots>,
    ready: Notify,
    /// Objects not in the ready state, recovery included.
    in_use: AtomicUsize,
    recovery_tx: flume::Sender<usize>,
    recovery_rx: flume::Receiver<usize>,
    max_pages: u32,
}

impl MrPool {
    /// Allocate `count` registration objects able to describe `max_pages` pages each.
    pub fn new(qp: &dyn QueuePair, count: usize, max_pages: u32) -> Result<Self> {
        let mut slots = Vec::with_capacity(count);
        let mut by_key = FxHashMap::default();
        for index in 0..count {
            match qp.alloc_mr(max_pages) {
                Ok(key) => {
                    by_key.insert(key.0, index);
                    slots.push(Slot {
                        key,
                        state: MrState::Ready,
                        retired: false,
                    });
                }
                Err(e) => {
                    for slot in &slots {
                        qp.dealloc_mr(slot.key);
                    }
                    return Err(Error::from_provider(Stage::Setup, e));
                }
            }
        }
        let (recovery_tx, recovery_rx) = flume::unbounded();
        debug!("allocated {count} registration objects of {max_pages} pages");
        Ok(Self {
            inner: Mutex::new(Slots { slots, by_key }),
            ready: Notify::new(),
            in_use: AtomicUsize::new(0),
            recovery_tx,
            recovery_rx,
            max_pages,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_take(&self) -> Option<(usize, MrKey)> {
        let mut inner = self.lock();
        let index = inner
            .slots
            .iter()
            .position(|s| s.state == MrState::Ready && !s.retired)?;
        let slot = &mut inner.slots[index];
        slot.state = MrState::Registered;
        self.in_use.fetch_add(1, Ordering::AcqRel);
        Some((index, slot.key))
    }

    /// Take a ready object, parking until one is released or the link goes down.
    async fn take(&self, status: &StatusCell) -> Result<(usize, MrKey)> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !status.get().is_live() {
                return Err(Error::NotConnected);
            }
            if let Some(taken) = self.try_take() {
                return Ok(taken);
            }
            tokio::select! {
                _ = notified => {}
                _ = status.closed() => return Err(Error::NotConnected),
            }
        }
    }

    fn set_ready(&self, index: usize, key: Option<MrKey>) {
        {
            let mut inner = self.lock();
            if let Some(new_key) = key {
                let old = inner.slots[index].key;
                inner.by_key.remove(&old.0);
                inner.by_key.insert(new_key.0, index);
                inner.slots[index].key = new_key;
            }
            inner.slots[index].state = MrState::Ready;
        }
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        self.ready.notify_waiters();
    }

    /// Hand a failed object to the recovery worker.
    fn fail(&self, index: usize) {
        self.lock().slots[index].state = MrState::Error;
        self.schedule_reset(index);
    }

    fn schedule_reset(&self, index: usize) {
        // The receiver lives in `self`; the send cannot fail.
        let _ = self.recovery_tx.send(index);
    }

    fn guard(&self, index: usize) -> TakenSlot<'_> {
        TakenSlot {
            pool: self,
            index,
            armed: true,
        }
    }

    fn retire(&self, index: usize) {
        self.lock().slots[index].retired = true;
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }

    /// The peer fenced the registration under `key`.
    pub fn mark_invalidated(&self, key: u32) {
        let mut inner = self.lock();
        let Some(&index) = inner.by_key.get(&key) else {
            debug!("invalidate for unknown key {key:#x}");
            return;
        };
        let slot = &mut inner.slots[index];
        if slot.state == MrState::Registered {
            slot.state = MrState::Invalidated;
        }
    }

    fn state(&self, index: usize) -> MrState {
        self.lock().slots[index].state
    }

    /// State and key of an object awaiting recovery, unless it was retired meanwhile.
    fn recovery_target(&self, index: usize) -> Option<(MrState, MrKey)> {
        let inner = self.lock();
        let slot = &inner.slots[index];
        (!slot.retired).then_some((slot.state, slot.key))
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Retire every object, returning the keys to free.
    pub fn drain_keys(&self) -> Vec<MrKey> {
        let mut inner = self.lock();
        inner.by_key.clear();
        inner
            .slots
            .iter_mut()
            .filter(|s| !s.retired)
            .map(|s| {
                s.retired = true;
                s.key
            })
            .collect()
    }
}

/// An object taken from the pool that has no handle yet.
///
/// Dropped while armed, for instance when the registering future is
/// cancelled, it hands the object to recovery.
struct TakenSlot<'a> {
    pool: &'a MrPool,
    index: usize,
    armed: bool,
}

impl TakenSlot<'_> {
    fn disarm(mut self) -> usize {
        self.armed = false;
        self.index
    }
}

impl Drop for TakenSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("registration object {} handed to recovery", self.index);
            self.pool.fail(self.index);
        }
    }
}

/// A buffer registered for direct access by the peer.
///
/// Call [`MrHandle::deregister`] once the peer is done to get the buffer back.
/// Dropping the handle instead fences the registration through recovery, and
/// the buffer is lost.
pub struct MrHandle {
    shared: Arc<Shared>,
    slot: usize,
    key: MrKey,
    region: RegionBuf,
    descriptor: BufferDescriptor,
    mode: InvalidateMode,
    done: bool,
}

impl std::fmt::Debug for MrHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MrHandle")
            .field("key", &self.key)
            .field("descriptor", &self.descriptor)
            .field("mode", &self.mode)
            .finish()
    }
}

impl MrHandle {
    /// What the peer needs to address the buffer.
    #[inline]
    pub fn descriptor(&self) -> BufferDescriptor {
        self.descriptor
    }

    #[inline]
    pub fn token(&self) -> u32 {
        self.key.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.descriptor.len() as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> MrState {
        self.shared.mrs.state(self.slot)
    }

    /// Fence the registration and return the buffer.
    ///
    /// A registration the peer already fenced returns at once; its reset is
    /// left to the recovery worker.
    pub async fn deregister(mut self) -> Result<BytesMut> {
        let mrs = &self.shared.mrs;
        if self.mode == InvalidateMode::Remote && mrs.state(self.slot) == MrState::Invalidated {
            self.done = true;
            mrs.schedule_reset(self.slot);
            return Ok(self.region.take());
        }
        let result = self.shared.invalidate_registration(self.key).await;
        self.done = true;
        match result {
            Ok(()) => {
                self.shared.mrs.set_ready(self.slot, None);
                Ok(self.region.take())
            }
            Err(e) => {
                self.shared.mrs.fail(self.slot);
                Err(e)
            }
        }
    }
}

impl Drop for MrHandle {
    fn drop(&mut self) {
        if !self.done {
            debug!("registration {:#x} dropped without deregister", self.key.0);
            self.shared.mrs.fail(self.slot);
        }
    }
}

fn segments(base: u64, len: usize, page: usize) -> Vec<Segment> {
    (0..len.div_ceil(page))
        .map(|i| {
            let start = i * page;
            Segment {
                addr: base + start as u64,
                len: (len - start).min(page) as u32,
            }
        })
        .collect()
}

impl Shared {
    /// Register `buf` so the peer can read or write it directly.
    pub(crate) async fn register_memory(
        self: &Arc<Self>,
        buf: BytesMut,
        direction: Direction,
        mode: InvalidateMode,
    ) -> Result<MrHandle> {
        let params = *self.ready_params()?;
        let len = buf.len();
        if len == 0 {
            return Err(Error::InvalidInput("cannot register an empty buffer".into()));
        }
        if len > params.max_readwrite_size as usize {
            return Err(Error::InvalidInput(format!(
                "registration of {len} bytes exceeds {}",
                params.max_readwrite_size
            )));
        }
        let page = self.config.page_size as usize;
        let pages = len.div_ceil(page);
        if pages > params.max_frmr_depth as usize {
            return Err(Error::InvalidInput(format!(
                "registration spans {pages} pages, limit {}",
                params.max_frmr_depth
            )));
        }

        let (slot, key) = self.mrs.take(&self.status).await?;
        let taken = self.mrs.guard(slot);
        let region = RegionBuf::new(buf);
        let base = u64::from(key.0) << 32;
        let segments = segments(base, len, page);

        let wr_id = self.next_wr_id();
        let rx = self.expect_op(wr_id);
        let result = match self.qp.post_reg_mr(wr_id, key, &region, &segments, direction.access()) {
            Ok(()) => self.await_op(rx).await,
            Err(e) => {
                self.op_waiters.remove(&wr_id);
                Err(Error::from_provider(Stage::Io, e))
            }
        };
        if let Err(e) = result {
            warn!("registration failed: {e}");
            if !e.is_retryable() {
                self.request_disconnect("registration failed");
            }
            return Err(e);
        }

        debug!("registered {len} bytes under {:#x}", key.0);
        Ok(MrHandle {
            shared: Arc::clone(self),
            slot: taken.disarm(),
            key,
            region,
            descriptor: BufferDescriptor::new(base, key.0, len as u32),
            mode,
            done: false,
        })
    }

    /// Post a local invalidate for `key` and wait for it.
    async fn invalidate_registration(&self, key: MrKey) -> Result<()> {
        let wr_id = self.next_wr_id();
        let rx = self.expect_op(wr_id);
        if let Err(e) = self.qp.post_local_invalidate(wr_id, key) {
            self.op_waiters.remove(&wr_id);
            return Err(Error::from_provider(Stage::Io, e));
        }
        let result = self.await_op(rx).await;
        if let Err(e) = &result {
            if !matches!(e, Error::NotConnected) {
                self.request_disconnect("local invalidate failed");
            }
        }
        result
    }

    /// Return a fenced object to the pool, or rebuild an errored one with a
    /// fresh hardware key.
    fn recover_registration(&self, slot: usize) {
        let old = match self.mrs.recovery_target(slot) {
            Some((MrState::Invalidated, _)) => {
                self.mrs.set_ready(slot, None);
                return;
            }
            Some((MrState::Error, key)) => key,
            _ => return,
        };
        self.qp.dealloc_mr(old);
        match self.qp.alloc_mr(self.mrs.max_pages) {
            Ok(key) => {
                self.mrs.set_ready(slot, Some(key));
                Stats::add(&self.stats.mr_recoveries, 1);
                debug!("registration object {slot} recovered as {:#x}", key.0);
            }
            Err(e) => {
                warn!("registration object {slot} lost: {e}");
                self.mrs.retire(slot);
                self.request_disconnect("registration recovery failed");
            }
        }
    }
}

/// Reset objects handed over by [`MrPool::fail`].
pub(crate) async fn run_recovery_worker(shared: Arc<Shared>) {
    let rx = shared.mrs.recovery_rx.clone();
    while let Ok(slot) = rx.recv_async().await {
        shared.recover_registration(slot);
    }
    info!("registration recovery stopped");
}

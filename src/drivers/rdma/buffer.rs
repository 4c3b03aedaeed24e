use bytes::{Bytes, BytesMut};
use std::sync::{Arc, Mutex, MutexGuard};

/// One receive buffer. Owned by exactly one of: the free pool, the provider
/// (posted), or the reassembly queue.
#[derive(Debug)]
pub struct RecvBuffer {
    id: u32,
    data: BytesMut,
}

impl RecvBuffer {
    pub(crate) fn new(id: u32, size: usize) -> Self {
        Self {
            id,
            data: BytesMut::zeroed(size),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Header plus scatter/gather entries of one posted send. Payload entries are
/// slices of caller memory and stay referenced until the send completes.
#[derive(Debug, Default)]
pub struct SendDescriptor {
    pub(crate) sges: Vec<Bytes>,
}

impl SendDescriptor {
    fn with_capacity(sge: usize) -> Self {
        Self {
            sges: Vec::with_capacity(sge),
        }
    }

    pub fn sges(&self) -> &[Bytes] {
        &self.sges
    }

    /// Total bytes on the wire.
    pub fn len(&self) -> usize {
        self.sges.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fixed set of send descriptors, allocated at setup.
pub(crate) struct SendPool {
    free: Mutex<Vec<SendDescriptor>>,
}

impl SendPool {
    pub fn new(count: usize, max_sge: usize) -> Self {
        let free = (0..count).map(|_| SendDescriptor::with_capacity(max_sge)).collect();
        Self {
            free: Mutex::new(free),
        }
    }

    pub fn take(&self) -> Option<SendDescriptor> {
        lock(&self.free).pop()
    }

    pub fn put(&self, mut desc: SendDescriptor) {
        desc.sges.clear();
        lock(&self.free).push(desc);
    }
}

/// Caller memory described to the provider for the lifetime of one registration
/// or one-sided read.
#[derive(Clone, Debug)]
pub struct RegionBuf(Arc<Mutex<BytesMut>>);

impl RegionBuf {
    pub fn new(buf: BytesMut) -> Self {
        Self(Arc::new(Mutex::new(buf)))
    }

    pub fn len(&self) -> usize {
        lock(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` with exclusive access to the memory.
    pub fn with<R>(&self, f: impl FnOnce(&mut BytesMut) -> R) -> R {
        f(&mut lock(&self.0))
    }

    /// Move the memory out, leaving an empty region behind. Any later remote
    /// access through a stale registration then fails its bounds check.
    pub fn take(&self) -> BytesMut {
        std::mem::take(&mut *lock(&self.0))
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recv_buffer_is_full_size() {
        let mut buf = RecvBuffer::new(7, 64);
        assert_eq!(buf.id(), 7);
        assert_eq!(buf.capacity(), 64);
        buf.as_mut_slice()[..3].copy_from_slice(b"abc");
        assert_eq!(&buf.as_slice()[..3], b"abc");
    }

    #[test]
    fn test_send_pool_recycles() {
        let pool = SendPool::new(1, 4);
        let mut desc = pool.take().unwrap();
        assert!(pool.take().is_none());
        desc.sges.push(Bytes::from_static(b"hdr"));
        assert_eq!(desc.len(), 3);
        pool.put(desc);
        let desc = pool.take().unwrap();
        assert!(desc.is_empty());
    }

    #[test]
    fn test_region_take_leaves_empty() {
        let region = RegionBuf::new(BytesMut::from(&b"payload"[..]));
        let alias = region.clone();
        assert_eq!(alias.len(), 7);
        let data = region.take();
        assert_eq!(&data[..], b"payload");
        assert!(alias.is_empty());
    }
}

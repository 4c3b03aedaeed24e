use crate::drivers::rdma::buffer::RecvBuffer;
use std::sync::{Mutex, MutexGuard};

/// Free list of receive buffers, pre-allocated at connection setup.
///
/// The pool lock is the only place buffers change home; callers move a buffer
/// out with [`RecvPool::get`] and back with [`RecvPool::put`].
pub(crate) struct RecvPool {
    free: Mutex<Vec<RecvBuffer>>,
    capacity: usize,
}

impl RecvPool {
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let free = (0..count).map(|i| RecvBuffer::new(i as u32, buffer_size)).collect();
        Self {
            free: Mutex::new(free),
            capacity: count,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RecvBuffer>> {
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self) -> Option<RecvBuffer> {
        self.lock().pop()
    }

    pub fn put(&self, buf: RecvBuffer) {
        self.lock().push(buf);
    }

    pub fn free_count(&self) -> usize {
        self.lock().len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn all_returned(&self) -> bool {
        self.free_count() == self.capacity
    }
}

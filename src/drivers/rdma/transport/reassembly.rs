//! Ordered reassembly of received fragments and the read API.
//!
//! Fragments are kept strictly in arrival order. A read copies across
//! fragment boundaries, so a logical message split over several packets reads
//! back as one contiguous byte sequence.

use super::negotiate::NegotiatedParams;
use super::protocol::{DataTransferHeader, DATA_HEADER_SIZE};
use super::Shared;
use crate::drivers::rdma::buffer::RecvBuffer;
use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::trace;

struct Entry {
    buffer: RecvBuffer,
    /// Next unread byte within the buffer.
    offset: usize,
    end: usize,
}

impl Entry {
    #[inline]
    fn unread(&self) -> usize {
        self.end - self.offset
    }
}

struct Inner {
    entries: VecDeque<Entry>,
    queued_bytes: usize,
    /// The next pushed fragment starts a new logical message.
    expect_first: bool,
}

pub(crate) struct ReassemblyQueue {
    inner: Mutex<Inner>,
    /// Published after the entry is linked; lets readers skip the lock when short.
    queued: AtomicUsize,
    data_ready: Notify,
}

impl ReassemblyQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                queued_bytes: 0,
                expect_first: true,
            }),
            queued: AtomicUsize::new(0),
            data_ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a validated packet carrying payload.
    pub fn push(&self, buffer: RecvBuffer, header: &DataTransferHeader) {
        let offset = header.data_offset as usize;
        let end = offset + header.data_length as usize;
        {
            let mut inner = self.lock();
            let first = inner.expect_first;
            inner.expect_first = header.remaining_data_length == 0;
            trace!(
                "queued fragment len={} remaining={} first={first}",
                header.data_length,
                header.remaining_data_length
            );
            inner.entries.push_back(Entry { buffer, offset, end });
            inner.queued_bytes += end - offset;
            self.queued.store(inner.queued_bytes, Ordering::Release);
        }
        self.data_ready.notify_waiters();
    }

    /// Copy exactly `size` bytes into `out` if that many are queued. Fully
    /// consumed buffers are moved to `done`.
    pub fn try_read(&self, size: usize, out: &mut BytesMut, done: &mut Vec<RecvBuffer>) -> bool {
        if self.queued.load(Ordering::Acquire) < size {
            return false;
        }
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.queued_bytes < size {
            return false;
        }

        let mut want = size;
        while want > 0 {
            let Some(head) = inner.entries.front_mut() else {
                break;
            };
            let n = head.unread().min(want);
            out.extend_from_slice(&head.buffer.as_slice()[head.offset..head.offset + n]);
            head.offset += n;
            want -= n;
            if head.unread() == 0 {
                if let Some(entry) = inner.entries.pop_front() {
                    done.push(entry.buffer);
                }
            }
        }
        inner.queued_bytes -= size;
        self.queued.store(inner.queued_bytes, Ordering::Release);
        true
    }

    /// Unlink every entry, returning the buffers.
    pub fn drain(&self) -> Vec<RecvBuffer> {
        let mut inner = self.lock();
        inner.queued_bytes = 0;
        inner.expect_first = true;
        self.queued.store(0, Ordering::Release);
        inner.entries.drain(..).map(|e| e.buffer).collect()
    }

    #[inline]
    pub fn queued_bytes(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

/// Most payload the queue can ever hold at once: every receive buffer filled
/// with the largest fragment the peer sends. A read beyond it could only end
/// by disconnect.
fn read_ceiling(params: &NegotiatedParams, receive_credit_max: u16) -> usize {
    receive_credit_max as usize * (params.peer_max_send_size as usize).saturating_sub(DATA_HEADER_SIZE)
}

impl Shared {
    /// Read exactly `size` bytes, parking until they have arrived or the link goes down.
    pub(crate) async fn read(&self, size: usize) -> Result<Bytes> {
        let ceiling = read_ceiling(self.ready_params()?, self.config.receive_credit_max);
        if size > ceiling {
            return Err(Error::InvalidInput(format!(
                "read of {size} bytes exceeds what can be queued ({ceiling})"
            )));
        }
        if size == 0 {
            return Ok(Bytes::new());
        }

        let mut out = BytesMut::with_capacity(size);
        let mut done = Vec::new();
        loop {
            let notified = self.reassembly.data_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.reassembly.try_read(size, &mut out, &mut done) {
                for buffer in done {
                    self.return_recv_buffer(buffer);
                }
                return Ok(out.freeze());
            }

            tokio::select! {
                _ = notified => {}
                _ = self.status.closed() => return Err(Error::NotConnected),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(id: u32, payload: &[u8], remaining: u32) -> (RecvBuffer, DataTransferHeader) {
        let header = DataTransferHeader::new(1, 0, 0, payload.len() as u32, remaining);
        let mut buffer = RecvBuffer::new(id, 128);
        let mut hdr = BytesMut::new();
        header.encode_into(&mut hdr);
        buffer.as_mut_slice()[..hdr.len()].copy_from_slice(&hdr);
        let start = header.data_offset as usize;
        buffer.as_mut_slice()[start..start + payload.len()].copy_from_slice(payload);
        (buffer, header)
    }

    #[test]
    fn test_reads_span_fragments_in_order() {
        let queue = ReassemblyQueue::new();
        let (b1, h1) = fragment(0, b"hello ", 5);
        let (b2, h2) = fragment(1, b"world", 0);
        queue.push(b1, &h1);
        queue.push(b2, &h2);
        assert_eq!(queue.queued_bytes(), 11);

        let mut out = BytesMut::new();
        let mut done = Vec::new();
        assert!(!queue.try_read(12, &mut out, &mut done));
        assert!(queue.try_read(8, &mut out, &mut done));
        assert_eq!(&out[..], b"hello wo");
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id(), 0);

        out.clear();
        assert!(queue.try_read(3, &mut out, &mut done));
        assert_eq!(&out[..], b"rld");
        assert_eq!(done.len(), 2);
        assert_eq!(queue.queued_bytes(), 0);
    }

    #[test]
    fn test_drain_returns_partially_read_buffers() {
        let queue = ReassemblyQueue::new();
        let (b1, h1) = fragment(7, b"abcdef", 0);
        queue.push(b1, &h1);

        let mut out = BytesMut::new();
        let mut done = Vec::new();
        assert!(queue.try_read(2, &mut out, &mut done));
        assert!(done.is_empty());

        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id(), 7);
        assert_eq!(queue.queued_bytes(), 0);
    }
}

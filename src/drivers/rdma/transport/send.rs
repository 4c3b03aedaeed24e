//! Send path: credit reservation, fragmentation and posting.

use super::flow_control::Credit;
use super::protocol::{DataTransferHeader, DATA_HEADER_SIZE};
use super::types::Stats;
use super::Shared;
use crate::drivers::rdma::buffer::SendDescriptor;
use crate::drivers::rdma::provider::{CompletionStatus, WrId};
use crate::error::{Error, ProviderError, Result, Stage};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::Ordering;
use tracing::{debug, trace, warn};

/// Walks caller buffers, handing out fragment-sized slices without copying.
pub(crate) struct PayloadCursor<'a> {
    bufs: &'a [Bytes],
    index: usize,
    offset: usize,
    remaining: usize,
}

impl<'a> PayloadCursor<'a> {
    pub fn new(bufs: &'a [Bytes]) -> Self {
        Self {
            bufs,
            index: 0,
            offset: 0,
            remaining: bufs.iter().map(Bytes::len).sum(),
        }
    }

    /// Bytes not yet handed out.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Push up to `max_payload` bytes, in at most `max_segments` slices, onto `out`.
    pub fn next_fragment(&mut self, max_payload: usize, max_segments: usize, out: &mut Vec<Bytes>) -> usize {
        let mut taken = 0;
        let mut segments = 0;
        while taken < max_payload && segments < max_segments {
            let Some(buf) = self.bufs.get(self.index) else {
                break;
            };
            let avail = buf.len() - self.offset;
            if avail == 0 {
                self.index += 1;
                self.offset = 0;
                continue;
            }
            let n = avail.min(max_payload - taken);
            out.push(buf.slice(self.offset..self.offset + n));
            self.offset += n;
            taken += n;
            segments += 1;
        }
        self.remaining -= taken;
        taken
    }
}

/// Disconnects if a message is abandoned after some of its fragments went out;
/// the peer would otherwise splice the next message onto the partial one.
struct MessageGuard<'a> {
    shared: &'a Shared,
    posted: usize,
    complete: bool,
}

impl Drop for MessageGuard<'_> {
    fn drop(&mut self) {
        if !self.complete && self.posted > 0 {
            warn!("message abandoned after {} fragments", self.posted);
            self.shared.request_disconnect("partial message on the wire");
        }
    }
}

impl Shared {
    /// Take every credit offered since the last header, up to what the field holds.
    fn harvest_credits(&self) -> u16 {
        let offered = self.new_credits_offered.swap(0, Ordering::AcqRel);
        let granted = offered.min(u16::MAX as u32);
        if offered > granted {
            self.new_credits_offered.fetch_add(offered - granted, Ordering::AcqRel);
        }
        granted as u16
    }

    /// Hand `desc` to the provider. The descriptor is tracked until its
    /// completion; on failure it goes straight back to the pool.
    fn post_descriptor(&self, desc: SendDescriptor, invalidate: Option<u32>) -> std::result::Result<(), ProviderError> {
        let wr_id = self.next_wr_id();
        let sges = desc.sges.clone();
        // Tracked first: the completion can race the return of post_send.
        self.in_flight.insert(wr_id, desc);
        let res = self.qp.post_send(wr_id, &sges, invalidate);
        if res.is_err() {
            if let Some((_, desc)) = self.in_flight.remove(&wr_id) {
                self.send_pool.put(desc);
            }
        }
        res
    }

    /// Build and post one data transfer packet with the reservations already held.
    /// Every reservation is rolled back if the post fails.
    pub(crate) fn post_with(
        &self,
        credit: Credit,
        pending: Credit,
        flags: u16,
        payload: &[Bytes],
        remaining: u32,
        invalidate: Option<u32>,
    ) -> Result<()> {
        let mut desc = self
            .send_pool
            .take()
            .ok_or_else(|| Error::Resource("no free send descriptor".into()))?;

        let granted = self.harvest_credits();
        let data_length: usize = payload.iter().map(Bytes::len).sum();
        let header = DataTransferHeader::new(
            self.config.send_credit_target,
            granted,
            flags,
            data_length as u32,
            remaining,
        );
        let mut hdr = BytesMut::with_capacity(header.wire_len());
        header.encode_into(&mut hdr);
        desc.sges.push(hdr.freeze());
        desc.sges.extend(payload.iter().cloned());
        self.receive_credits.fetch_add(granted as u32, Ordering::AcqRel);

        match self.post_descriptor(desc, invalidate) {
            Ok(()) => {
                credit.consume();
                pending.consume();
                Stats::add(&self.stats.send_credits_consumed, 1);
                Stats::add(&self.stats.packets_sent, 1);
                Stats::add(&self.stats.bytes_sent, data_length as u64);
                if data_length == 0 {
                    Stats::add(&self.stats.credit_packets_sent, 1);
                }
                self.keepalive.response_sent();
                self.idle_rearm.notify_one();
                trace!("posted packet len={data_length} remaining={remaining} granted={granted}");
                Ok(())
            }
            Err(e) => {
                // Dropping `credit` and `pending` returns both reservations.
                let _ = self
                    .receive_credits
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| Some(r.saturating_sub(granted as u32)));
                self.new_credits_offered.fetch_add(granted as u32, Ordering::AcqRel);
                let err = Error::from_provider(Stage::Io, e);
                if !err.is_retryable() {
                    self.request_disconnect("send post failed");
                }
                debug!("send post failed: {err}");
                Err(err)
            }
        }
    }

    /// Wait for a send credit and an in-flight slot, then post.
    async fn post_packet(&self, flags: u16, payload: &[Bytes], remaining: u32, invalidate: Option<u32>) -> Result<()> {
        let credit = self.send_credits.acquire().await.map_err(|_| Error::NotConnected)?;
        let pending = self.send_pending.acquire().await.map_err(|_| Error::NotConnected)?;
        self.post_with(credit, pending, flags, payload, remaining, invalidate)
    }

    /// Packet with no payload: a credit grant, a keepalive, or its response.
    pub(crate) async fn post_empty(&self, flags: u16) -> Result<()> {
        self.post_packet(flags, &[], 0, None).await
    }

    /// Post a negotiation packet. It needs an in-flight slot but no credit.
    pub(crate) async fn post_handshake(&self, packet: Bytes) -> Result<()> {
        let pending = self.send_pending.acquire().await.map_err(|_| Error::NotConnected)?;
        let mut desc = self
            .send_pool
            .take()
            .ok_or_else(|| Error::Resource("no free send descriptor".into()))?;
        desc.sges.push(packet);
        self.post_descriptor(desc, None)
            .map_err(|e| Error::from_provider(Stage::Setup, e))?;
        pending.consume();
        Ok(())
    }

    /// Send one logical message, fragmenting it as needed. Messages are
    /// serialized so fragments of two messages never interleave.
    pub(crate) async fn send_message(&self, bufs: &[Bytes], invalidate: Option<u32>) -> Result<()> {
        let params = *self.ready_params()?;
        let total: usize = bufs.iter().map(Bytes::len).sum();
        if total == 0 {
            return Err(Error::InvalidInput("empty message".into()));
        }
        if total > params.max_fragmented_send_size as usize {
            return Err(Error::InvalidInput(format!(
                "message of {total} bytes exceeds peer limit {}",
                params.max_fragmented_send_size
            )));
        }
        let max_payload = (params.max_send_size as usize).saturating_sub(DATA_HEADER_SIZE);
        if max_payload == 0 {
            return Err(Error::InvalidInput("negotiated send size leaves no room for payload".into()));
        }
        let max_segments = self.config.max_send_sge - 1;

        let _serial = self.send_lock.lock().await;
        let mut guard = MessageGuard {
            shared: self,
            posted: 0,
            complete: false,
        };
        let mut cursor = PayloadCursor::new(bufs);
        let mut fragment = Vec::with_capacity(max_segments);
        while cursor.remaining() > 0 {
            fragment.clear();
            cursor.next_fragment(max_payload, max_segments, &mut fragment);
            let remaining = cursor.remaining() as u32;
            let fence = if remaining == 0 { invalidate } else { None };
            self.post_packet(0, &fragment, remaining, fence).await?;
            guard.posted += 1;
        }
        guard.complete = true;
        trace!("sent message of {total} bytes in {} packets", guard.posted);
        Ok(())
    }

    pub(crate) fn on_send_complete(&self, wr_id: WrId, status: CompletionStatus) {
        let Some((_, desc)) = self.in_flight.remove(&wr_id) else {
            debug!("send completion for unknown wr_id={wr_id}");
            return;
        };
        self.send_pool.put(desc);
        self.send_pending.release(1);

        match status {
            CompletionStatus::Success | CompletionStatus::Flushed => {}
            other => {
                warn!("send wr_id={wr_id} failed: {other:?}");
                self.request_disconnect("send completion failed");
            }
        }
        // A grant parked for want of an in-flight slot can go now.
        if self.new_credits_offered.load(Ordering::Acquire) > 0 || self.keepalive.is_response_owed() {
            self.refill.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragments(bufs: &[Bytes], max_payload: usize, max_segments: usize) -> Vec<(usize, usize, usize)> {
        let mut cursor = PayloadCursor::new(bufs);
        let mut out = Vec::new();
        let mut result = Vec::new();
        while cursor.remaining() > 0 {
            out.clear();
            let n = cursor.next_fragment(max_payload, max_segments, &mut out);
            result.push((n, out.len(), cursor.remaining()));
        }
        result
    }

    #[test]
    fn test_fragment_sizes_and_remaining() {
        let data = Bytes::from(vec![7u8; 5000]);
        let frags = fragments(&[data], 1364 - DATA_HEADER_SIZE, 5);
        let sizes: Vec<usize> = frags.iter().map(|f| f.0).collect();
        let remaining: Vec<usize> = frags.iter().map(|f| f.2).collect();
        assert_eq!(sizes, vec![1340, 1340, 1340, 980]);
        assert_eq!(remaining, vec![3660, 2320, 980, 0]);
    }

    #[test]
    fn test_fragments_cross_buffer_boundaries() {
        let bufs = [
            Bytes::from_static(b"abc"),
            Bytes::new(),
            Bytes::from_static(b"defgh"),
            Bytes::from_static(b"ij"),
        ];
        let mut cursor = PayloadCursor::new(&bufs);
        let mut out = Vec::new();
        assert_eq!(cursor.next_fragment(4, 5, &mut out), 4);
        assert_eq!(out, vec![Bytes::from_static(b"abc"), Bytes::from_static(b"d")]);

        out.clear();
        assert_eq!(cursor.next_fragment(100, 5, &mut out), 6);
        assert_eq!(out, vec![Bytes::from_static(b"efgh"), Bytes::from_static(b"ij")]);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_segment_limit_shortens_fragment() {
        let bufs: Vec<Bytes> = (0..4).map(|_| Bytes::from_static(b"xy")).collect();
        let frags = fragments(&bufs, 100, 3);
        assert_eq!(frags, vec![(6, 3, 2), (2, 1, 0)]);
    }
}

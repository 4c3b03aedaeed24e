//! Receive path and the credit worker.
//!
//! Completions are handled on the dispatcher task and never block: they
//! validate the packet, update credit counters, queue payload and wake the
//! credit worker. Reposting buffers and sending credit-only packets happens on
//! the worker.

use super::protocol::validate_data_packet;
use super::types::Stats;
use super::Shared;
use crate::drivers::rdma::buffer::RecvBuffer;
use crate::drivers::rdma::provider::CompletionStatus;
use crate::error::{Error, Stage};
use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace, warn};

impl Shared {
    /// Put a buffer back in the free pool; the worker may repost it.
    pub(crate) fn return_recv_buffer(&self, buffer: RecvBuffer) {
        self.recv_pool.put(buffer);
        self.refill.notify_one();
    }

    pub(crate) fn on_recv_complete(
        &self,
        buffer: RecvBuffer,
        byte_len: usize,
        status: CompletionStatus,
        invalidated_key: Option<u32>,
    ) {
        let _ = self
            .posted_recvs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        if status != CompletionStatus::Success {
            if status != CompletionStatus::Flushed {
                warn!("receive completion failed: {status:?}");
                self.request_disconnect("receive completion failed");
            }
            self.return_recv_buffer(buffer);
            return;
        }

        if let Some(key) = invalidated_key {
            self.mrs.mark_invalidated(key);
        }

        let len = byte_len.min(buffer.capacity());
        if let Some(tx) = self.negotiation_slot().take() {
            let _ = tx.send(Bytes::copy_from_slice(&buffer.as_slice()[..len]));
            self.return_recv_buffer(buffer);
            return;
        }

        let Some(params) = self.params() else {
            debug!("dropping packet received outside of a negotiated connection");
            self.return_recv_buffer(buffer);
            return;
        };
        let header = match validate_data_packet(&buffer.as_slice()[..len], params.max_fragmented_recv_size) {
            Ok(header) => header,
            Err(e) => {
                Stats::add(&self.stats.protocol_violations, 1);
                warn!("{e}");
                self.return_recv_buffer(buffer);
                self.request_disconnect("protocol violation");
                return;
            }
        };

        Stats::add(&self.stats.packets_received, 1);
        Stats::add(&self.stats.bytes_received, header.data_length as u64);
        let _ = self
            .receive_credits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1));

        let target = header.credits_requested.clamp(1, self.config.receive_credit_max.max(1)) as u32;
        let previous = self.receive_credit_target.swap(target, Ordering::AcqRel);
        if target != previous {
            trace!("peer receive target {previous} -> {target}");
        }

        if header.credits_granted > 0 {
            Stats::add(&self.stats.peer_credits_granted, header.credits_granted as u64);
            self.send_credits.release(header.credits_granted as usize);
        }

        self.keepalive.peer_heard();
        let response_requested = header.response_requested();
        if response_requested {
            self.keepalive.owe_response();
        }
        self.last_recv_credit_only
            .store(header.data_length == 0 && !response_requested, Ordering::Release);

        if header.data_length == 0 {
            self.return_recv_buffer(buffer);
        } else {
            self.reassembly.push(buffer, &header);
            self.refill.notify_one();
        }
    }

    /// Keep `receive_credit_target` buffers posted. Each new post is a credit
    /// to offer the peer in the next header.
    fn replenish(&self) {
        let target = self.receive_credit_target.load(Ordering::Acquire);
        while self.posted_recvs.load(Ordering::Acquire) < target {
            let Some(buffer) = self.recv_pool.get() else {
                break;
            };
            self.posted_recvs.fetch_add(1, Ordering::AcqRel);
            if let Err((e, buffer)) = self.qp.post_recv(buffer) {
                self.posted_recvs.fetch_sub(1, Ordering::AcqRel);
                self.recv_pool.put(buffer);
                let err = Error::from_provider(Stage::Io, e);
                if err.is_retryable() {
                    debug!("receive post deferred: {err}");
                } else {
                    self.request_disconnect("receive post failed");
                }
                break;
            }
            self.new_credits_offered.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Whether offered credits (or an owed keepalive response) should go out
    /// on their own instead of waiting for the next data packet.
    fn grant_due(&self) -> bool {
        if self.keepalive.is_response_owed() {
            return true;
        }
        if self.new_credits_offered.load(Ordering::Acquire) == 0 {
            return false;
        }
        let granted = self.receive_credits.load(Ordering::Acquire);
        let target = self.receive_credit_target.load(Ordering::Acquire);
        // A peer at zero credits is stuck unless it just spent its last one on a bare grant.
        granted + 1 < target || (granted == 0 && !self.last_recv_credit_only.load(Ordering::Acquire))
    }

    fn flush_credits(&self) {
        if !self.grant_due() {
            return;
        }
        let Some(credit) = self.send_credits.try_acquire() else {
            trace!("credit grant waiting for a send credit");
            return;
        };
        let Some(pending) = self.send_pending.try_acquire() else {
            trace!("credit grant waiting for an in-flight slot");
            return;
        };
        if let Err(e) = self.post_with(credit, pending, 0, &[], 0, None) {
            debug!("credit packet not sent: {e}");
        }
    }
}

/// Repost receive buffers and send credit-only packets whenever woken.
pub(crate) async fn run_credit_worker(shared: Arc<Shared>) {
    loop {
        tokio::select! {
            _ = shared.refill.notified() => {}
            _ = shared.status.closed() => return,
        }
        if shared.ready_params().is_err() {
            continue;
        }
        shared.replenish();
        shared.flush_credits();
    }
}

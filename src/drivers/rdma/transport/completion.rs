//! Provider event dispatch.
//!
//! One task per connection drains the provider's event channel. Handlers only
//! touch counters and queues and wake waiters; anything that may block is left
//! to the credit worker, the recovery worker or the caller.

use super::state::ConnectionStatus;
use super::Shared;
use crate::drivers::rdma::provider::{CmEvent, Completion, CompletionStatus, EventReceiver, ProviderEvent, WrId};
use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

impl Shared {
    /// Register interest in the completion of `wr_id` before posting it.
    pub(crate) fn expect_op(&self, wr_id: WrId) -> oneshot::Receiver<CompletionStatus> {
        let (tx, rx) = oneshot::channel();
        self.op_waiters.insert(wr_id, tx);
        rx
    }

    /// Wait for a registration, invalidate, read or write to complete.
    pub(crate) async fn await_op(&self, rx: oneshot::Receiver<CompletionStatus>) -> Result<()> {
        let status = tokio::select! {
            res = rx => res,
            _ = self.status.closed() => return Err(Error::NotConnected),
        };
        match status {
            Ok(CompletionStatus::Success) => Ok(()),
            Ok(CompletionStatus::Flushed) | Err(_) => Err(Error::NotConnected),
            Ok(other) => Err(Error::Transport(format!("work request failed: {other:?}"))),
        }
    }

    fn on_op_complete(&self, wr_id: WrId, status: CompletionStatus) {
        match self.op_waiters.remove(&wr_id) {
            Some((_, tx)) => {
                let _ = tx.send(status);
            }
            None => trace!("completion wr_id={wr_id} has no waiter"),
        }
    }

    fn on_disconnected(&self) {
        let from = self.status.get();
        if self.transition(ConnectionStatus::Disconnected) {
            info!("link down (was {from:?})");
        }
    }

    pub(crate) fn handle_event(&self, event: ProviderEvent) {
        match event {
            ProviderEvent::Completion(Completion::Send { wr_id, status }) => self.on_send_complete(wr_id, status),
            ProviderEvent::Completion(Completion::Recv {
                buffer,
                byte_len,
                status,
                invalidated_key,
            }) => self.on_recv_complete(buffer, byte_len, status, invalidated_key),
            ProviderEvent::Completion(Completion::Op { wr_id, status }) => self.on_op_complete(wr_id, status),
            ProviderEvent::Cm(CmEvent::Disconnected) => self.on_disconnected(),
            ProviderEvent::Cm(CmEvent::DeviceRemoved) => {
                warn!("device removed");
                self.request_disconnect("device removed");
                self.on_disconnected();
            }
            ProviderEvent::Cm(CmEvent::Error(e)) => {
                warn!("connection manager error: {e}");
                self.request_disconnect("connection manager error");
            }
        }
    }
}

/// Drain provider events until the provider drops its end of the channel.
pub(crate) async fn run_dispatcher(shared: Arc<Shared>, events: EventReceiver) {
    while let Ok(event) = events.recv_async().await {
        shared.handle_event(event);
    }
    debug!("provider event channel closed");
    shared.on_disconnected();
}

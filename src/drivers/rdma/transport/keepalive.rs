//! Idle keepalive.

use super::protocol::FLAG_RESPONSE_REQUESTED;
use super::types::Stats;
use super::Shared;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub(crate) struct KeepaliveState {
    /// A keepalive went out and nothing has been heard from the peer since.
    awaiting_response: AtomicBool,
    /// The peer asked for a response we have not sent yet.
    response_owed: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdleAction {
    Ping,
    Stalled,
}

impl KeepaliveState {
    /// The idle timer fired.
    pub fn on_timer(&self) -> IdleAction {
        if self.awaiting_response.swap(true, Ordering::AcqRel) {
            IdleAction::Stalled
        } else {
            IdleAction::Ping
        }
    }

    /// Any packet from the peer answers an outstanding keepalive.
    pub fn peer_heard(&self) {
        self.awaiting_response.store(false, Ordering::Release);
    }

    pub fn owe_response(&self) {
        self.response_owed.store(true, Ordering::Release);
    }

    /// Any packet we post answers the peer's request.
    pub fn response_sent(&self) {
        self.response_owed.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_response_owed(&self) -> bool {
        self.response_owed.load(Ordering::Acquire)
    }
}

/// Ping the peer after every `keepalive_interval` without a send.
pub(crate) async fn run_idle_timer(shared: Arc<Shared>) {
    let interval = shared.config.keepalive_interval;
    loop {
        tokio::select! {
            _ = shared.status.closed() => return,
            _ = shared.idle_rearm.notified() => continue,
            _ = tokio::time::sleep(interval) => {}
        }

        match shared.keepalive.on_timer() {
            IdleAction::Stalled => {
                warn!("peer did not answer keepalive within {interval:?}");
                shared.request_disconnect("keepalive unanswered");
                return;
            }
            IdleAction::Ping => {
                // A keepalive parked on a send credit is flow control, not a stall;
                // the peer's next grant releases it.
                match shared.post_empty(FLAG_RESPONSE_REQUESTED).await {
                    Ok(()) => {
                        Stats::add(&shared.stats.keepalives_sent, 1);
                        debug!("keepalive sent");
                    }
                    Err(e) => {
                        debug!("keepalive not sent: {e}");
                        if !e.is_retryable() {
                            shared.request_disconnect("keepalive post failed");
                            return;
                        }
                    }
                }
            }
        }
    }
}

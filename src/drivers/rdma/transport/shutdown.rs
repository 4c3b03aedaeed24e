use super::state::ConnectionStatus;
use super::Shared;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Result of a teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownResult {
    /// Every buffer and registration came back before the deadline.
    Graceful,
    /// At least one wait hit its deadline; resources were released anyway.
    Forced,
    /// Teardown was already in progress.
    AlreadyShuttingDown,
}

/// Poll `ready` every `interval` until it holds or `limit` elapses.
async fn poll_until(interval: Duration, limit: Duration, mut ready: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if ready() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

impl Shared {
    /// Release every resource of the connection.
    ///
    /// This function:
    /// 1. Requests a provider-level disconnect and waits for it to be reported
    /// 2. Waits for outstanding sends and posted receives to complete
    /// 3. Returns queued reassembly entries to the free pool
    /// 4. Waits for every receive buffer and registration to come back
    /// 5. Frees the registration objects
    ///
    /// Registration users do not hold any connection lock, so their waits poll.
    pub(crate) async fn teardown(&self) -> TeardownResult {
        if self.teardown_started.swap(true, Ordering::AcqRel) {
            return TeardownResult::AlreadyShuttingDown;
        }
        debug!("tearing down connection");
        let interval = self.config.teardown_poll_interval;
        let limit = self.config.teardown_timeout;
        let mut forced = false;

        self.request_disconnect("teardown");
        let disconnected = self
            .status
            .wait_until(|s| matches!(s, ConnectionStatus::Disconnected | ConnectionStatus::Destroyed));
        if tokio::time::timeout(self.config.disconnect_timeout, disconnected)
            .await
            .is_err()
        {
            warn!("provider did not report the disconnect in time");
            self.transition(ConnectionStatus::Disconnected);
            forced = true;
        }

        let drained = poll_until(interval, limit, || {
            self.in_flight.is_empty() && self.posted_recvs.load(Ordering::Acquire) == 0
        })
        .await;
        if !drained {
            warn!(
                "{} sends and {} receives still outstanding",
                self.in_flight.len(),
                self.posted_recvs.load(Ordering::Acquire)
            );
            forced = true;
        }

        let unread = self.reassembly.queued_bytes();
        if unread > 0 {
            debug!("discarding {unread} unread bytes");
        }
        for buffer in self.reassembly.drain() {
            self.recv_pool.put(buffer);
        }
        if !poll_until(interval, limit, || self.recv_pool.all_returned()).await {
            warn!(
                "{} of {} receive buffers never returned",
                self.recv_pool.capacity() - self.recv_pool.free_count(),
                self.recv_pool.capacity()
            );
            forced = true;
        }

        if !poll_until(interval, limit, || self.mrs.in_use() == 0).await {
            warn!("{} registrations still in use", self.mrs.in_use());
            forced = true;
        }
        for key in self.mrs.drain_keys() {
            self.qp.dealloc_mr(key);
        }

        self.transition(ConnectionStatus::Destroyed);
        debug!("connection destroyed (forced={forced})");
        if forced {
            TeardownResult::Forced
        } else {
            TeardownResult::Graceful
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_deadline() {
        let start = Instant::now();
        let ok = poll_until(Duration::from_millis(10), Duration::from_millis(55), || false).await;
        assert!(!ok);
        assert!(start.elapsed() >= Duration::from_millis(55));

        let mut calls = 0;
        let ok = poll_until(Duration::from_millis(10), Duration::from_secs(1), || {
            calls += 1;
            calls == 3
        })
        .await;
        assert!(ok);
        assert_eq!(calls, 3);
    }
}

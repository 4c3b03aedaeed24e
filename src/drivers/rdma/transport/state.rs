//! Connection lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Lifecycle of one connection. Negotiation runs while the status is
/// [`ConnectionStatus::Connected`] with the negotiating flag raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// Address/route resolution and link establishment in progress.
    Connecting,
    /// Link established; ready for traffic once negotiation is done.
    Connected,
    /// The handshake was refused or timed out.
    NegotiateFailed,
    /// A disconnect was requested and the provider has not confirmed it yet.
    Disconnecting,
    /// The link is gone; resources are still held.
    Disconnected,
    /// Every resource has been released.
    Destroyed,
}

impl ConnectionStatus {
    /// Blocking waits stay parked only while the connection is live.
    #[inline]
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionStatus::Connecting | ConnectionStatus::Connected)
    }

    pub(crate) fn can_transition(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        match (self, next) {
            (Destroyed, _) => false,
            (from, Destroyed) => from == Disconnected,
            (Disconnected, _) => false,
            (_, Disconnected) => true,
            (Connecting, Connected) => true,
            (Connected, NegotiateFailed) => true,
            (Connecting | Connected | NegotiateFailed, Disconnecting) => true,
            _ => false,
        }
    }
}

pub(crate) struct StatusCell {
    tx: watch::Sender<ConnectionStatus>,
    negotiating: AtomicBool,
}

impl StatusCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionStatus::Connecting);
        Self {
            tx,
            negotiating: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn get(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    /// Apply `next` if the state machine allows it. Returns whether the status changed.
    pub fn transition(&self, next: ConnectionStatus) -> bool {
        self.tx.send_if_modified(|current| {
            if current.can_transition(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    pub fn set_negotiating(&self, on: bool) {
        self.negotiating.store(on, Ordering::Release);
    }

    #[inline]
    pub fn is_negotiating(&self) -> bool {
        self.negotiating.load(Ordering::Acquire)
    }

    /// Resolves once the connection leaves the live states.
    pub async fn closed(&self) {
        self.wait_until(|s| !s.is_live()).await;
    }

    /// Resolves once `pred` holds for the current status.
    pub async fn wait_until(&self, pred: impl FnMut(&ConnectionStatus) -> bool) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(pred).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transitions() {
        use ConnectionStatus::*;
        assert!(Connecting.can_transition(Connected));
        assert!(Connected.can_transition(NegotiateFailed));
        assert!(NegotiateFailed.can_transition(Disconnecting));
        assert!(Connecting.can_transition(Disconnected));
        assert!(Disconnecting.can_transition(Disconnected));
        assert!(Disconnected.can_transition(Destroyed));

        assert!(!Connected.can_transition(Connecting));
        assert!(!Connected.can_transition(Destroyed));
        assert!(!Disconnected.can_transition(Connected));
        assert!(!Destroyed.can_transition(Disconnected));
    }

    #[tokio::test]
    async fn test_closed_wakes_on_disconnect() {
        let cell = std::sync::Arc::new(StatusCell::new());
        assert!(cell.transition(ConnectionStatus::Connected));
        let waiter = tokio::spawn({
            let cell = cell.clone();
            async move { cell.closed().await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());
        assert!(cell.transition(ConnectionStatus::Disconnected));
        waiter.await.unwrap();
        assert!(!cell.transition(ConnectionStatus::Connected));
    }
}

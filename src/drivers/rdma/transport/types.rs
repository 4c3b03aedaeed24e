//! Internal types used by the RDMA transport.

use std::sync::atomic::{AtomicU64, Ordering};

/// Which side of the handshake this connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent the negotiate request; may reconnect.
    Initiator,
    /// Answered the negotiate request.
    Responder,
}

/// Live counters, updated with relaxed atomics from every path.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub credit_packets_sent: AtomicU64,
    pub keepalives_sent: AtomicU64,
    pub protocol_violations: AtomicU64,
    pub mr_recoveries: AtomicU64,
    pub peer_credits_granted: AtomicU64,
    pub send_credits_consumed: AtomicU64,
}

impl Stats {
    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            packets_sent: get(&self.packets_sent),
            bytes_sent: get(&self.bytes_sent),
            packets_received: get(&self.packets_received),
            bytes_received: get(&self.bytes_received),
            credit_packets_sent: get(&self.credit_packets_sent),
            keepalives_sent: get(&self.keepalives_sent),
            protocol_violations: get(&self.protocol_violations),
            mr_recoveries: get(&self.mr_recoveries),
            peer_credits_granted: get(&self.peer_credits_granted),
            send_credits_consumed: get(&self.send_credits_consumed),
        }
    }
}

/// Point-in-time copy of a connection's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Data transfer packets posted (payload and credit-only).
    pub packets_sent: u64,
    /// Payload bytes posted.
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    /// Packets posted with no payload (credit grants, keepalives and their responses).
    pub credit_packets_sent: u64,
    pub keepalives_sent: u64,
    pub protocol_violations: u64,
    pub mr_recoveries: u64,
    /// Send credits the peer has granted in total, negotiation included.
    pub peer_credits_granted: u64,
    /// Send credits spent on posted packets.
    pub send_credits_consumed: u64,
}

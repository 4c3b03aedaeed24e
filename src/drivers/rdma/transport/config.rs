//! Transport configuration for negotiation, credits and memory registration.

use super::protocol::{DATA_HEADER_SIZE, PROTOCOL_VERSION_1};
use crate::error::{Error, Result};
use std::time::Duration;

/// Per-connection settings. Every value the transport uses as a default lives here;
/// nothing is read from process-wide state.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Protocol version offered and accepted during negotiation.
    pub protocol_version: u16,
    /// Credits requested from the peer; also caps unacknowledged in-flight sends.
    pub send_credit_target: u16,
    /// Number of receive buffers allocated; upper bound for credits granted to the peer.
    pub receive_credit_max: u16,
    /// Largest packet this side sends (header included), before negotiation clamps it.
    pub max_send_size: u32,
    /// Size of each receive buffer; advertised as our max receive size.
    pub max_receive_size: u32,
    /// Largest logical message we reassemble.
    pub max_fragmented_recv_size: u32,
    /// Largest single RDMA read/write we advertise.
    pub max_readwrite_size: u32,
    /// Payloads at or below this size travel through send/receive.
    pub rdma_readwrite_threshold: u32,
    /// Idle time after the last send before a keepalive is sent.
    pub keepalive_interval: Duration,
    /// Incoming RDMA reads we allow the peer to have outstanding.
    pub responder_resources: u8,
    /// Outgoing RDMA reads we keep outstanding.
    pub initiator_depth: u8,
    /// Pages one registration may describe.
    pub max_frmr_depth: u32,
    /// Page size used to build registration scatter/gather lists.
    pub page_size: u32,
    /// Scatter/gather entries per send work request, header included.
    pub max_send_sge: usize,
    /// Smallest max receive size accepted from a peer.
    pub min_receive_size_floor: u32,
    /// Smallest max fragmented size accepted from a peer.
    pub min_fragmented_size_floor: u32,
    /// Bound on address/route resolution plus connection establishment.
    pub connect_timeout: Duration,
    /// Bound on the negotiation exchange.
    pub negotiate_timeout: Duration,
    /// How long teardown waits for the provider to report the disconnect.
    pub disconnect_timeout: Duration,
    /// Polling period while teardown waits for registrations to be released.
    pub teardown_poll_interval: Duration,
    /// Bound on each teardown wait.
    pub teardown_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION_1,
            send_credit_target: 255,
            receive_credit_max: 255,
            max_send_size: 1364,
            max_receive_size: 1364,
            max_fragmented_recv_size: 1024 * 1024,
            max_readwrite_size: 1048512,
            rdma_readwrite_threshold: 4096,
            keepalive_interval: Duration::from_secs(120),
            responder_resources: 32,
            initiator_depth: 16,
            max_frmr_depth: 2048,
            page_size: 4096,
            max_send_sge: 6,
            min_receive_size_floor: 128,
            min_fragmented_size_floor: 128 * 1024,
            connect_timeout: Duration::from_secs(5),
            negotiate_timeout: Duration::from_secs(120),
            disconnect_timeout: Duration::from_secs(5),
            teardown_poll_interval: Duration::from_millis(10),
            teardown_timeout: Duration::from_secs(5),
        }
    }
}

impl TransportConfig {
    /// Create a new configuration with default values.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the send credit target.
    #[inline]
    pub fn with_send_credit_target(mut self, n: u16) -> Self {
        self.send_credit_target = n;
        self
    }

    /// Set the number of receive buffers.
    #[inline]
    pub fn with_receive_credit_max(mut self, n: u16) -> Self {
        self.receive_credit_max = n;
        self
    }

    /// Set the maximum packet size sent.
    #[inline]
    pub fn with_max_send_size(mut self, n: u32) -> Self {
        self.max_send_size = n;
        self
    }

    /// Set the receive buffer size.
    #[inline]
    pub fn with_max_receive_size(mut self, n: u32) -> Self {
        self.max_receive_size = n;
        self
    }

    /// Set the largest logical message accepted.
    #[inline]
    pub fn with_max_fragmented_recv_size(mut self, n: u32) -> Self {
        self.max_fragmented_recv_size = n;
        self
    }

    /// Set the advertised RDMA read/write ceiling.
    #[inline]
    pub fn with_max_readwrite_size(mut self, n: u32) -> Self {
        self.max_readwrite_size = n;
        self
    }

    /// Set the registration threshold.
    #[inline]
    pub fn with_rdma_readwrite_threshold(mut self, n: u32) -> Self {
        self.rdma_readwrite_threshold = n;
        self
    }

    /// Set the idle keepalive interval.
    #[inline]
    pub fn with_keepalive_interval(mut self, d: Duration) -> Self {
        self.keepalive_interval = d;
        self
    }

    /// Set responder resources (sizes the registration pool).
    #[inline]
    pub fn with_responder_resources(mut self, n: u8) -> Self {
        self.responder_resources = n;
        self
    }

    /// Set the initiator depth.
    #[inline]
    pub fn with_initiator_depth(mut self, n: u8) -> Self {
        self.initiator_depth = n;
        self
    }

    /// Set the pages per registration.
    #[inline]
    pub fn with_max_frmr_depth(mut self, n: u32) -> Self {
        self.max_frmr_depth = n;
        self
    }

    /// Set the negotiation floors.
    #[inline]
    pub fn with_negotiation_floors(mut self, min_receive: u32, min_fragmented: u32) -> Self {
        self.min_receive_size_floor = min_receive;
        self.min_fragmented_size_floor = min_fragmented;
        self
    }

    /// Set the connection establishment timeout.
    #[inline]
    pub fn with_connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    /// Set the negotiation timeout.
    #[inline]
    pub fn with_negotiate_timeout(mut self, d: Duration) -> Self {
        self.negotiate_timeout = d;
        self
    }

    /// Set the teardown bounds.
    #[inline]
    pub fn with_teardown_timeout(mut self, d: Duration) -> Self {
        self.teardown_timeout = d;
        self
    }

    /// Reject values the transport cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::InvalidInput(format!("config: {msg}")));
        if self.send_credit_target == 0 {
            return fail("send_credit_target must be nonzero");
        }
        if self.receive_credit_max == 0 {
            return fail("receive_credit_max must be nonzero");
        }
        if (self.max_send_size as usize) <= DATA_HEADER_SIZE {
            return fail("max_send_size must exceed the data header size");
        }
        if (self.max_receive_size as usize) <= DATA_HEADER_SIZE {
            return fail("max_receive_size must exceed the data header size");
        }
        if self.max_send_sge < 2 {
            return fail("max_send_sge must leave room for a payload entry");
        }
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return fail("page_size must be a power of two");
        }
        if self.max_frmr_depth == 0 {
            return fail("max_frmr_depth must be nonzero");
        }
        if self.responder_resources == 0 || self.initiator_depth == 0 {
            return fail("responder_resources and initiator_depth must be nonzero");
        }
        if self.keepalive_interval.is_zero() {
            return fail("keepalive_interval must be nonzero");
        }
        Ok(())
    }
}

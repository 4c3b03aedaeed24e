//! One-time handshake agreeing on version, credits and size limits.

use super::config::TransportConfig;
use super::protocol::{NegotiateRequest, NegotiateResponse, STATUS_NOT_SUPPORTED, STATUS_SUCCESS};
use super::Shared;
use crate::drivers::rdma::provider::ConnectParams;
use crate::error::{Error, NegotiateError, Result, Stage};
use bytes::Bytes;
use std::sync::atomic::Ordering;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Limits in force for the lifetime of a connection, fixed by negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedParams {
    pub version: u16,
    /// Largest packet we send, header included.
    pub max_send_size: u32,
    /// Size of our receive buffers.
    pub max_receive_size: u32,
    /// Largest packet the peer sends us, header included.
    pub peer_max_send_size: u32,
    /// Largest logical message the peer reassembles.
    pub max_fragmented_send_size: u32,
    /// Largest logical message we reassemble.
    pub max_fragmented_recv_size: u32,
    pub max_readwrite_size: u32,
    /// Pages one registration may describe.
    pub max_frmr_depth: u32,
    pub rdma_readwrite_threshold: u32,
    pub send_credit_target: u16,
    /// How many receive buffers we keep posted for the peer.
    pub receive_credit_target: u16,
    /// Send credits granted by the handshake itself.
    pub initial_send_credits: u16,
    pub responder_resources: u8,
    pub initiator_depth: u8,
}

fn readwrite_limits(config: &TransportConfig, peer_max_readwrite: u32) -> (u32, u32) {
    let depth_bytes = config.max_frmr_depth.saturating_mul(config.page_size);
    let max_readwrite = peer_max_readwrite.min(depth_bytes);
    (max_readwrite, max_readwrite / config.page_size)
}

fn read_resources(config: &TransportConfig, peer: ConnectParams) -> (u8, u8) {
    let responder = config.responder_resources.min(peer.initiator_depth).max(1);
    let initiator = config.initiator_depth.min(peer.responder_resources).max(1);
    (responder, initiator)
}

#[inline]
fn clamp_target(requested: u16, max: u16) -> u16 {
    requested.clamp(1, max.max(1))
}

/// Check a negotiate response against local limits and derive connection parameters.
pub fn validate_response(
    config: &TransportConfig,
    resp: &NegotiateResponse,
    peer: ConnectParams,
) -> std::result::Result<NegotiatedParams, NegotiateError> {
    if resp.status != STATUS_SUCCESS {
        return Err(NegotiateError::Status(resp.status));
    }
    if resp.negotiated_version != config.protocol_version {
        return Err(NegotiateError::Version {
            got: resp.negotiated_version,
            local: config.protocol_version,
        });
    }
    if resp.credits_requested == 0 {
        return Err(NegotiateError::ZeroCreditsRequested);
    }
    if resp.credits_granted == 0 {
        return Err(NegotiateError::ZeroCreditsGranted);
    }
    if resp.preferred_send_size > config.max_receive_size {
        return Err(NegotiateError::PreferredSendSize {
            peer: resp.preferred_send_size,
            local: config.max_receive_size,
        });
    }
    if resp.max_receive_size < config.min_receive_size_floor {
        return Err(NegotiateError::MaxReceiveSize {
            peer: resp.max_receive_size,
            floor: config.min_receive_size_floor,
        });
    }
    if resp.max_fragmented_size < config.min_fragmented_size_floor {
        return Err(NegotiateError::MaxFragmentedSize {
            peer: resp.max_fragmented_size,
            floor: config.min_fragmented_size_floor,
        });
    }

    let (max_readwrite_size, max_frmr_depth) = readwrite_limits(config, resp.max_readwrite_size);
    let (responder_resources, initiator_depth) = read_resources(config, peer);
    Ok(NegotiatedParams {
        version: resp.negotiated_version,
        max_send_size: config.max_send_size.min(resp.max_receive_size),
        max_receive_size: config.max_receive_size,
        peer_max_send_size: resp.preferred_send_size.min(config.max_receive_size),
        max_fragmented_send_size: resp.max_fragmented_size,
        max_fragmented_recv_size: config.max_fragmented_recv_size,
        max_readwrite_size,
        max_frmr_depth,
        rdma_readwrite_threshold: config.rdma_readwrite_threshold.min(resp.max_fragmented_size),
        send_credit_target: config.send_credit_target,
        receive_credit_target: clamp_target(resp.credits_requested, config.receive_credit_max),
        initial_send_credits: resp.credits_granted,
        responder_resources,
        initiator_depth,
    })
}

/// Check a negotiate request on the passive side.
pub fn validate_request(
    config: &TransportConfig,
    req: &NegotiateRequest,
    peer: ConnectParams,
) -> std::result::Result<NegotiatedParams, NegotiateError> {
    let version = config.protocol_version;
    if req.min_version > version || req.max_version < version {
        return Err(NegotiateError::Version {
            got: req.max_version,
            local: version,
        });
    }
    if req.credits_requested == 0 {
        return Err(NegotiateError::ZeroCreditsRequested);
    }
    if req.max_receive_size < config.min_receive_size_floor {
        return Err(NegotiateError::MaxReceiveSize {
            peer: req.max_receive_size,
            floor: config.min_receive_size_floor,
        });
    }
    if req.max_fragmented_size < config.min_fragmented_size_floor {
        return Err(NegotiateError::MaxFragmentedSize {
            peer: req.max_fragmented_size,
            floor: config.min_fragmented_size_floor,
        });
    }

    let (max_readwrite_size, max_frmr_depth) = readwrite_limits(config, config.max_readwrite_size);
    let (responder_resources, initiator_depth) = read_resources(config, peer);
    Ok(NegotiatedParams {
        version,
        max_send_size: config.max_send_size.min(req.max_receive_size),
        max_receive_size: config.max_receive_size,
        peer_max_send_size: req.preferred_send_size.min(config.max_receive_size),
        max_fragmented_send_size: req.max_fragmented_size,
        max_fragmented_recv_size: config.max_fragmented_recv_size,
        max_readwrite_size,
        max_frmr_depth,
        rdma_readwrite_threshold: config.rdma_readwrite_threshold.min(req.max_fragmented_size),
        send_credit_target: config.send_credit_target,
        receive_credit_target: clamp_target(req.credits_requested, config.receive_credit_max),
        initial_send_credits: 0,
        responder_resources,
        initiator_depth,
    })
}

impl Shared {
    /// Route the next received packet to the handshake instead of reassembly.
    fn expect_negotiation_packet(&self) -> oneshot::Receiver<Bytes> {
        let (tx, rx) = oneshot::channel();
        *self.negotiation_slot() = Some(tx);
        rx
    }

    /// Wait for the handshake packet, bounded by the negotiate timeout and the link.
    async fn await_negotiation_packet(&self, rx: oneshot::Receiver<Bytes>) -> Result<Bytes> {
        let timeout = self.config.negotiate_timeout;
        tokio::select! {
            // A rejection is often followed at once by the peer's disconnect.
            biased;
            res = tokio::time::timeout(timeout, rx) => match res {
                Ok(Ok(packet)) => Ok(packet),
                Ok(Err(_)) => Err(Error::NotConnected),
                Err(_) => Err(NegotiateError::Timeout(timeout).into()),
            },
            _ = self.status.closed() => Err(Error::NotConnected),
        }
    }

    fn post_single_recv(&self) -> Result<()> {
        let buffer = self
            .recv_pool
            .get()
            .ok_or_else(|| Error::Resource("no receive buffer for negotiation".into()))?;
        self.posted_recvs.fetch_add(1, Ordering::AcqRel);
        if let Err((e, buffer)) = self.qp.post_recv(buffer) {
            self.posted_recvs.fetch_sub(1, Ordering::AcqRel);
            self.recv_pool.put(buffer);
            return Err(Error::from_provider(Stage::Setup, e));
        }
        Ok(())
    }

    /// Active side: send the request, validate the response.
    pub(crate) async fn negotiate_as_initiator(&self) -> Result<NegotiatedParams> {
        self.status.set_negotiating(true);
        let rx = self.expect_negotiation_packet();
        self.post_single_recv()?;

        let config = &self.config;
        let req = NegotiateRequest {
            min_version: config.protocol_version,
            max_version: config.protocol_version,
            credits_requested: config.send_credit_target,
            preferred_send_size: config.max_send_size,
            max_receive_size: config.max_receive_size,
            max_fragmented_size: config.max_fragmented_recv_size,
        };
        self.post_handshake(req.encode()).await?;

        let packet = self.await_negotiation_packet(rx).await?;
        let resp = NegotiateResponse::decode(&packet).ok_or(NegotiateError::Truncated(packet.len()))?;
        let params = validate_response(config, &resp, self.peer)?;

        self.apply_params(params);
        self.status.set_negotiating(false);
        info!(
            "negotiated as initiator: max_send={} max_fragmented_send={} credits={} target={}",
            params.max_send_size, params.max_fragmented_send_size, params.initial_send_credits, params.receive_credit_target
        );
        self.refill.notify_one();
        Ok(params)
    }

    /// Passive side: receive the request, post buffers, answer with a grant.
    pub(crate) async fn negotiate_as_responder(&self) -> Result<NegotiatedParams> {
        self.status.set_negotiating(true);
        let rx = self.expect_negotiation_packet();
        self.post_single_recv()?;

        let packet = self.await_negotiation_packet(rx).await?;
        let config = &self.config;
        let req = NegotiateRequest::decode(&packet).ok_or(NegotiateError::Truncated(packet.len()))?;
        let params = match validate_request(config, &req, self.peer) {
            Ok(params) => params,
            Err(e @ NegotiateError::Version { .. }) => {
                warn!("rejecting negotiate request: {e}");
                let resp = NegotiateResponse {
                    min_version: config.protocol_version,
                    max_version: config.protocol_version,
                    negotiated_version: 0,
                    credits_requested: 0,
                    credits_granted: 0,
                    status: STATUS_NOT_SUPPORTED,
                    max_readwrite_size: 0,
                    preferred_send_size: 0,
                    max_receive_size: 0,
                    max_fragmented_size: 0,
                };
                if let Err(post_err) = self.post_handshake(resp.encode()).await {
                    debug!("failed to send rejection: {post_err}");
                }
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        self.apply_params(params);
        let posted = self.post_initial_receives(params.receive_credit_target);
        if posted == 0 {
            return Err(Error::Resource("no receive buffers could be posted".into()));
        }

        let resp = NegotiateResponse {
            min_version: config.protocol_version,
            max_version: config.protocol_version,
            negotiated_version: params.version,
            credits_requested: config.send_credit_target,
            credits_granted: posted,
            status: STATUS_SUCCESS,
            max_readwrite_size: params.max_readwrite_size,
            preferred_send_size: params.max_send_size,
            max_receive_size: config.max_receive_size,
            max_fragmented_size: config.max_fragmented_recv_size,
        };
        self.post_handshake(resp.encode()).await?;
        self.status.set_negotiating(false);
        info!(
            "negotiated as responder: max_send={} granted={} target={}",
            params.max_send_size, posted, params.receive_credit_target
        );
        Ok(params)
    }

    /// Post up to `target` receive buffers and count them as granted to the peer.
    fn post_initial_receives(&self, target: u16) -> u16 {
        let mut posted: u16 = 0;
        while posted < target {
            let Some(buffer) = self.recv_pool.get() else { break };
            self.posted_recvs.fetch_add(1, Ordering::AcqRel);
            if let Err((e, buffer)) = self.qp.post_recv(buffer) {
                self.posted_recvs.fetch_sub(1, Ordering::AcqRel);
                self.recv_pool.put(buffer);
                warn!("initial receive post failed after {posted}: {e}");
                break;
            }
            posted += 1;
        }
        self.receive_credits.store(posted as u32, Ordering::Release);
        posted
    }
}

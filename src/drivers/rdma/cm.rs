//! RDMA Connection Manager
//!
//! Async entry points that bring a provider link up and hand it to the
//! connection engine, which then negotiates.

use crate::drivers::rdma::provider::{ConnectParams, Device, Listener};
use crate::drivers::rdma::transport::{Connection, Origin, Role, TransportConfig};
use crate::error::{Error, Result, Stage};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

fn connect_params(config: &TransportConfig) -> ConnectParams {
    ConnectParams {
        responder_resources: config.responder_resources,
        initiator_depth: config.initiator_depth,
    }
}

/// Connect to `addr` through `device` and negotiate as the initiator.
///
/// Resolution and establishment are bounded by `connect_timeout`, negotiation
/// by `negotiate_timeout`.
pub async fn connect(device: Arc<dyn Device>, addr: SocketAddr, config: TransportConfig) -> Result<Connection> {
    connect_from(Origin { device, addr }, config).await
}

pub(crate) async fn connect_from(origin: Origin, config: TransportConfig) -> Result<Connection> {
    config.validate()?;
    debug!("connecting to {}", origin.addr);
    let attempt = origin.device.connect(origin.addr, connect_params(&config));
    let established = match tokio::time::timeout(config.connect_timeout, attempt).await {
        Ok(Ok(established)) => established,
        Ok(Err(e)) => return Err(Error::from_provider(Stage::Connect, e)),
        Err(_) => {
            return Err(Error::Connection(format!(
                "connect to {} timed out after {:?}",
                origin.addr, config.connect_timeout
            )))
        }
    };
    Connection::establish(established, config, Role::Initiator, Some(origin)).await
}

/// Wait for the next incoming link on `listener` and negotiate as the responder.
pub async fn accept<L: Listener + ?Sized>(listener: &L, config: TransportConfig) -> Result<Connection> {
    config.validate()?;
    let established = listener
        .accept(connect_params(&config))
        .await
        .map_err(|e| Error::from_provider(Stage::Connect, e))?;
    debug!("accepted link on {}", listener.local_addr());
    Connection::establish(established, config, Role::Responder, None).await
}

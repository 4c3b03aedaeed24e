//! Credit-flow-controlled message transport over reliable RDMA queue pairs.
//!
//! A [`Connection`] negotiates protocol version, credits and size limits with
//! its peer, then carries logical messages of up to the negotiated fragmented
//! size, splitting them into packets that fit the peer's receive buffers. Both
//! directions are flow controlled by credits the receiver grants as it posts
//! buffers. Large payloads can skip the send path entirely: register a buffer
//! with [`Connection::register_memory`] and let the peer read or write it.
//!
//! The hardware is reached through the traits in [`drivers::rdma::provider`].
//! [`LoopbackFabric`] implements them in-process.

pub mod drivers;
pub mod error;
pub mod transport;

pub use drivers::rdma::{
    accept, connect, BufferDescriptor, Connection, ConnectionStatus, Direction, InvalidateMode, LoopbackFabric,
    LoopbackListener, MrHandle, MrState, NegotiatedParams, Role, StatsSnapshot, TeardownResult, TransportConfig,
};
pub use error::{Error, Result};
pub use transport::Transport;

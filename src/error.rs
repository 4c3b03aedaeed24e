//! Error taxonomy for the transport.
//!
//! Provider-specific failures ([`ProviderError`]) never reach callers directly; they are
//! translated into one of the [`Error`] kinds by [`Error::from_provider`] at the point where
//! the provider was invoked.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by an RDMA capability provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("address resolution failed")]
    AddressResolution,

    #[error("route resolution failed")]
    RouteResolution,

    #[error("connection rejected by peer")]
    Rejected,

    #[error("peer unreachable")]
    Unreachable,

    #[error("operation timed out")]
    Timeout,

    #[error("work queue full")]
    QueueFull,

    #[error("out of memory")]
    NoMemory,

    #[error("queue pair not connected")]
    NotConnected,

    #[error("invalid work request: {0}")]
    InvalidRequest(String),

    #[error("provider error {code}: {message}")]
    Other { code: i32, message: String },
}

/// Where a provider call failed; decides which [`Error`] kind it becomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Address/route resolution and connection establishment.
    Connect,
    /// Allocation of pools and hardware objects right after establishment.
    Setup,
    /// Posting work on an established connection.
    Io,
}

/// Reasons a negotiation exchange is refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiateError {
    #[error("negotiation packet truncated: {0} bytes")]
    Truncated(usize),

    #[error("version {got:#06x} not supported (local {local:#06x})")]
    Version { got: u16, local: u16 },

    #[error("peer requested zero credits")]
    ZeroCreditsRequested,

    #[error("peer granted zero credits")]
    ZeroCreditsGranted,

    #[error("peer preferred send size {peer} exceeds local max receive size {local}")]
    PreferredSendSize { peer: u32, local: u32 },

    #[error("peer max receive size {peer} below floor {floor}")]
    MaxReceiveSize { peer: u32, floor: u32 },

    #[error("peer max fragmented size {peer} below floor {floor}")]
    MaxFragmentedSize { peer: u32, floor: u32 },

    #[error("peer reported status {0:#06x}")]
    Status(u16),

    #[error("no answer within {0:?}")]
    Timeout(Duration),
}

/// Transport error kinds.
#[derive(Error, Debug)]
pub enum Error {
    /// Resolution failure, connect reject or connect timeout.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The handshake failed; the connection was torn down.
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiateError),

    /// A post or completion failed; the connection is being torn down.
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer sent a malformed packet; handled like a transport error.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Pool exhaustion or allocation failure. Retryable.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// The connection left the connected state.
    #[error("not connected")]
    NotConnected,

    /// The caller's request can never succeed on this connection.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Translate a provider failure into the transport taxonomy.
    pub fn from_provider(stage: Stage, err: ProviderError) -> Self {
        match (stage, err) {
            (Stage::Connect, e) => Error::Connection(e.to_string()),
            (Stage::Setup, ProviderError::NotConnected) => Error::Connection("link dropped during setup".into()),
            (_, ProviderError::NoMemory) => Error::Resource("provider out of memory".into()),
            (_, ProviderError::QueueFull) => Error::Resource("provider work queue full".into()),
            (_, ProviderError::NotConnected) => Error::NotConnected,
            (_, ProviderError::InvalidRequest(msg)) => Error::InvalidInput(msg),
            (_, e) => Error::Transport(e.to_string()),
        }
    }

    /// Whether the caller may retry the same operation on the same connection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Resource(_))
    }

    /// Whether the error means the connection is gone and `reconnect` is needed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Connection(_)
                | Error::Negotiation(_)
                | Error::Transport(_)
                | Error::ProtocolViolation(_)
                | Error::NotConnected
        )
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::Connection(_) => io::ErrorKind::ConnectionRefused,
            Error::Negotiation(_) => io::ErrorKind::ConnectionAborted,
            Error::Transport(_) => io::ErrorKind::ConnectionReset,
            Error::ProtocolViolation(_) => io::ErrorKind::InvalidData,
            Error::Resource(_) => io::ErrorKind::WouldBlock,
            Error::NotConnected => io::ErrorKind::NotConnected,
            Error::InvalidInput(_) => io::ErrorKind::InvalidInput,
        };
        io::Error::new(kind, e)
    }
}

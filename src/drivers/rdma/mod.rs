pub mod buffer;
pub mod cm;
pub mod loopback;
pub mod mr;
pub mod provider;
pub mod remote_buf;
pub mod transport;

pub use cm::{accept, connect};
pub use loopback::{LoopbackFabric, LoopbackListener};
pub use mr::{Direction, InvalidateMode, MrHandle, MrState};
pub use remote_buf::BufferDescriptor;
pub use transport::{Connection, ConnectionStatus, NegotiatedParams, Role, StatsSnapshot, TeardownResult, TransportConfig};

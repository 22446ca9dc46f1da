//! Data Relay Module
//!
//! Moves bytes between an accepted client socket and its remote connection.

pub mod buffer;
pub mod endpoint;
pub mod pair;
pub mod session;

pub use buffer::RelayBuffer;
pub use endpoint::{CloseReason, EndpointState, RelayEndpoint, Side};
pub use pair::RelayPair;
pub use session::RelaySession;

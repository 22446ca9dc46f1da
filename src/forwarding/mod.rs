//! Local TCP port forwarding

pub mod listener;
pub mod stats;
pub mod target;

pub use listener::{ForwardingListener, ListenerHandle};
pub use stats::{ForwardingStats, StatsSnapshot};
pub use target::RemoteTarget;

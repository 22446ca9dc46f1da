//! RustForward Library
//!
//! Local TCP port forwarding driven by a single background I/O loop, plus a
//! Unix-socket termination channel that lets another process stop a
//! forwarder by presenting a pre-shared secret.

pub mod config;
pub mod error;
pub mod event_loop;
pub mod forwarding;
pub mod relay;
pub mod shutdown;
pub mod termination;
pub mod util;

pub use config::Config;
pub use error::ForwardError;
pub use forwarding::{ForwardingListener, ListenerHandle};
pub use shutdown::ShutdownCoordinator;
pub use termination::{send_termination, Credential, TerminationChannel};

/// Common error type for the application layer
pub type Result<T> = anyhow::Result<T>;

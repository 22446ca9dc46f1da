//! Error types returned by the forwarding core

use std::io;
use thiserror::Error;

/// Errors surfaced to callers of the forwarding core.
///
/// Failures that happen while relaying (remote unreachable, resets, control
/// protocol violations) never show up here: they are resolved on the I/O loop
/// by closing the affected connection.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// No local address/port combination could be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The remote target could not be resolved
    #[error("failed to resolve remote target {target}: {source}")]
    Resolve {
        target: String,
        #[source]
        source: io::Error,
    },

    /// The remote target resolved, but to nothing usable
    #[error("remote target {0} resolved to no addresses")]
    NoAddress(String),

    /// Termination secrets must carry at least one byte
    #[error("termination secret must not be empty")]
    EmptySecret,

    /// The I/O loop could not be started or went away mid-request
    #[error("I/O event loop unavailable: {0}")]
    EventLoop(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ForwardError {
    pub(crate) fn bind(addr: impl ToString, source: io::Error) -> Self {
        ForwardError::Bind {
            addr: addr.to_string(),
            source,
        }
    }
}

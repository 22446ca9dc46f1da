//! Secret Verifier
//!
//! Pure state machine deciding whether the bytes received on one control
//! connection spell out the termination secret. It performs no I/O.
//!
//! ```text
//! Receiving ──(acc == secret)──────────▶ Matched
//!     │──────(acc too long / not prefix)─▶ Rejected
//!     └──────(peer disconnect)───────────▶ PeerDisconnected
//! ```

use bytes::{Bytes, BytesMut};
use std::fmt;

/// Why a control connection was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// More bytes arrived than the secret holds
    Overflow { received: usize, expected: usize },
    /// The bytes so far are not a prefix of the secret
    Mismatch,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Overflow { received, expected } => {
                write!(f, "received {} bytes, secret has {}", received, expected)
            }
            Rejection::Mismatch => write!(f, "secret mismatch"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierState {
    Receiving,
    Matched,
    Rejected(Rejection),
    PeerDisconnected,
}

/// Outcome of feeding one read into the verifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Valid prefix, keep reading
    Pending,
    /// Exact match; the caller runs the shutdown cascade
    Matched,
    /// Close this control connection, nothing else
    Rejected(Rejection),
    /// Verifier already reached a terminal state
    Ignored,
}

pub struct SecretVerifier {
    expected: Bytes,
    received: BytesMut,
    state: VerifierState,
}

impl SecretVerifier {
    pub fn new(expected: impl Into<Bytes>) -> Self {
        let expected = expected.into();
        Self {
            received: BytesMut::with_capacity(expected.len()),
            expected,
            state: VerifierState::Receiving,
        }
    }

    pub fn state(&self) -> VerifierState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state != VerifierState::Receiving
    }

    /// Bytes accumulated so far
    pub fn received(&self) -> &[u8] {
        &self.received
    }

    /// Append one read's worth of bytes and re-evaluate
    pub fn feed(&mut self, data: &[u8]) -> Verdict {
        if self.is_terminal() {
            return Verdict::Ignored;
        }

        self.received.extend_from_slice(data);

        let verdict = if self.received.len() > self.expected.len() {
            Verdict::Rejected(Rejection::Overflow {
                received: self.received.len(),
                expected: self.expected.len(),
            })
        } else if !self.expected.starts_with(&self.received) {
            Verdict::Rejected(Rejection::Mismatch)
        } else if self.received.len() == self.expected.len() {
            Verdict::Matched
        } else {
            Verdict::Pending
        };

        match verdict {
            Verdict::Matched => self.state = VerifierState::Matched,
            Verdict::Rejected(rejection) => self.state = VerifierState::Rejected(rejection),
            Verdict::Pending | Verdict::Ignored => {}
        }
        verdict
    }

    /// Peer closed before a verdict; no effect beyond closing the connection
    pub fn peer_disconnected(&mut self) {
        if !self.is_terminal() {
            self.state = VerifierState::PeerDisconnected;
        }
    }
}

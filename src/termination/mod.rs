//! Out-of-band termination of a forwarding listener

pub mod channel;
pub mod credential;
pub mod verifier;

pub use channel::{default_socket_path, TerminationChannel};
pub use credential::{send_termination, Credential};
pub use verifier::{Rejection, SecretVerifier, Verdict, VerifierState};

//! Relay Session

use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// Bookkeeping for one relay pair, from accept until teardown
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub target_addr: SocketAddr,
    pub start_time: Instant,
    bytes_up: u64,
    bytes_down: u64,
}

impl RelaySession {
    /// Create a new relay session
    pub fn new(client_addr: SocketAddr, target_addr: SocketAddr) -> Self {
        let session_id = format!("relay_{}", Uuid::new_v4().simple());
        debug!(
            "Creating new relay session: {} ({} -> {})",
            session_id, client_addr, target_addr
        );

        Self {
            session_id,
            client_addr,
            target_addr,
            start_time: Instant::now(),
            bytes_up: 0,
            bytes_down: 0,
        }
    }

    /// Bytes relayed from the client towards the remote target
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up
    }

    /// Bytes relayed from the remote target back to the client
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_up + self.bytes_down
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn add_bytes_up(&mut self, bytes: u64) {
        self.bytes_up += bytes;
    }

    pub fn add_bytes_down(&mut self, bytes: u64) {
        self.bytes_down += bytes;
    }

    /// Log session statistics
    pub fn log_stats(&self) {
        info!(
            session_id = %self.session_id,
            client_addr = %self.client_addr,
            target_addr = %self.target_addr,
            duration_ms = self.duration().as_millis() as u64,
            bytes_up = self.bytes_up,
            bytes_down = self.bytes_down,
            total_bytes = self.total_bytes(),
            "Relay session completed"
        );
    }
}

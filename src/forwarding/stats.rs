//! Forwarding statistics shared between the I/O loop and listener handles

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one forwarding listener and the relay pairs it spawned.
///
/// Written only from the I/O loop thread, readable from anywhere.
#[derive(Debug, Default)]
pub struct ForwardingStats {
    accepted: AtomicU64,
    remote_connects: AtomicU64,
    failed_connects: AtomicU64,
    active_pairs: AtomicU64,
    closed_pairs: AtomicU64,
    bytes_upstream: AtomicU64,
    bytes_downstream: AtomicU64,
}

/// Point-in-time copy of [`ForwardingStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub remote_connects: u64,
    pub failed_connects: u64,
    pub active_pairs: u64,
    pub closed_pairs: u64,
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
}

impl ForwardingStats {
    pub(crate) fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connect(&self) {
        self.remote_connects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connect_failure(&self) {
        self.failed_connects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn pair_opened(&self) {
        self.active_pairs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn pair_closed(&self) {
        self.active_pairs.fetch_sub(1, Ordering::Relaxed);
        self.closed_pairs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_upstream(&self, bytes: u64) {
        self.bytes_upstream.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_downstream(&self, bytes: u64) {
        self.bytes_downstream.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Client connections accepted so far
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Outbound connections initiated towards the remote target
    pub fn remote_connects(&self) -> u64 {
        self.remote_connects.load(Ordering::Relaxed)
    }

    /// Remote connections that failed before relaying anything
    pub fn failed_connects(&self) -> u64 {
        self.failed_connects.load(Ordering::Relaxed)
    }

    /// Relay pairs with at least one endpoint still open
    pub fn active_pairs(&self) -> u64 {
        self.active_pairs.load(Ordering::Relaxed)
    }

    pub fn closed_pairs(&self) -> u64 {
        self.closed_pairs.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted(),
            remote_connects: self.remote_connects(),
            failed_connects: self.failed_connects(),
            active_pairs: self.active_pairs(),
            closed_pairs: self.closed_pairs(),
            bytes_upstream: self.bytes_upstream.load(Ordering::Relaxed),
            bytes_downstream: self.bytes_downstream.load(Ordering::Relaxed),
        }
    }
}

//! Relay Pair
//!
//! The two endpoints of one forwarded connection plus the two buffers that
//! connect them:
//!
//! ```text
//!   client ──read──▶ upstream ──write──▶ remote
//!   client ◀─write── downstream ◀─read── remote
//! ```
//!
//! Each buffer has exactly one producer and one consumer endpoint. The buddy
//! relation is a `Side` handle stored in each endpoint and cleared on both
//! sides by the first close, so the cascade runs once.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::buffer::RelayBuffer;
use super::endpoint::{CloseReason, RelayEndpoint, Side, Transfer};
use super::session::RelaySession;
use crate::forwarding::target::connect_any;
use crate::forwarding::ForwardingStats;

pub struct RelayPair {
    client: RelayEndpoint,
    remote: RelayEndpoint,
    /// client -> remote
    upstream: RelayBuffer,
    /// remote -> client
    downstream: RelayBuffer,
    scratch: Vec<u8>,
    /// Set once the remote side proved reachable
    remote_established: bool,
    /// Remote addresses not tried yet
    fallbacks: Vec<SocketAddr>,
    session: RelaySession,
    stats: Arc<ForwardingStats>,
}

impl RelayPair {
    /// Wire up a pair; both buddy handles are set before this returns
    pub fn new(
        client: TcpStream,
        remote: TcpStream,
        client_addr: SocketAddr,
        target_addr: SocketAddr,
        chunk_size: usize,
        stats: Arc<ForwardingStats>,
    ) -> Self {
        let mut client = RelayEndpoint::new(Side::Client, client);
        let mut remote = RelayEndpoint::new(Side::Remote, remote);
        client.set_buddy(Some(Side::Remote));
        remote.set_buddy(Some(Side::Client));

        stats.pair_opened();

        Self {
            client,
            remote,
            upstream: RelayBuffer::new(),
            downstream: RelayBuffer::new(),
            scratch: vec![0u8; chunk_size.max(1)],
            remote_established: false,
            fallbacks: Vec::new(),
            session: RelaySession::new(client_addr, target_addr),
            stats,
        }
    }

    /// Addresses to dial, in order, if the remote fails before it is established
    pub fn with_fallbacks(mut self, addrs: &[SocketAddr]) -> Self {
        self.fallbacks = addrs.to_vec();
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    pub fn endpoint(&self, side: Side) -> &RelayEndpoint {
        match side {
            Side::Client => &self.client,
            Side::Remote => &self.remote,
        }
    }

    fn endpoint_mut(&mut self, side: Side) -> &mut RelayEndpoint {
        match side {
            Side::Client => &mut self.client,
            Side::Remote => &mut self.remote,
        }
    }

    /// True once neither endpoint is open
    pub fn is_closed(&self) -> bool {
        !self.client.is_open() && !self.remote.is_open()
    }

    /// Drive both endpoints until the pair has torn down
    pub async fn run(mut self) {
        while !self.is_closed() {
            let client_interest = self.client.interest(&self.downstream);
            // Writability also reports when a pending connect completes
            let remote_interest = if self.remote_established {
                self.remote.interest(&self.upstream)
            } else {
                Interest::READABLE.add(Interest::WRITABLE)
            };

            let (side, readiness) = tokio::select! {
                ready = self.client.ready(client_interest) => (Side::Client, ready),
                ready = self.remote.ready(remote_interest) => (Side::Remote, ready),
            };

            self.dispatch(side, readiness);
        }
    }

    /// Run the read/write callbacks matching what the transport reported
    pub fn dispatch(&mut self, side: Side, readiness: io::Result<Ready>) {
        let ready = match readiness {
            Ok(ready) => ready,
            Err(e) => {
                self.close(side, CloseReason::Transport(e));
                return;
            }
        };

        if ready.is_readable() || ready.is_read_closed() {
            match self.read(side) {
                Transfer::Moved(n) => self.record(side, n),
                Transfer::Idle => {}
                Transfer::Close(reason) => {
                    self.close(side, reason);
                    return;
                }
            }
        }

        if ready.is_writable() || ready.is_write_closed() {
            if side == Side::Remote && !self.remote_established {
                if self.remote.peer_addr().is_some() {
                    self.remote_established = true;
                } else if let Some(e) = self.remote.take_error() {
                    self.close(side, CloseReason::Transport(e));
                    return;
                }
            }
            match self.write(side) {
                Transfer::Moved(n) => {
                    if side == Side::Remote && n > 0 {
                        self.remote_established = true;
                    }
                }
                Transfer::Idle => {}
                Transfer::Close(reason) => self.close(side, reason),
            }
        }
    }

    fn read(&mut self, side: Side) -> Transfer {
        let (endpoint, incoming) = match side {
            Side::Client => (&mut self.client, &mut self.upstream),
            Side::Remote => (&mut self.remote, &mut self.downstream),
        };
        endpoint.on_readable(incoming, &mut self.scratch)
    }

    fn write(&mut self, side: Side) -> Transfer {
        let (endpoint, outgoing) = match side {
            Side::Client => (&mut self.client, &mut self.downstream),
            Side::Remote => (&mut self.remote, &mut self.upstream),
        };
        endpoint.on_writable(outgoing)
    }

    fn flush(&mut self, side: Side) -> usize {
        let (endpoint, outgoing) = match side {
            Side::Client => (&mut self.client, &mut self.downstream),
            Side::Remote => (&mut self.remote, &mut self.upstream),
        };
        endpoint.flush_pending(outgoing)
    }

    fn record(&mut self, side: Side, bytes: usize) {
        let bytes = bytes as u64;
        match side {
            Side::Client => {
                self.session.add_bytes_up(bytes);
                self.stats.add_upstream(bytes);
            }
            Side::Remote => {
                self.remote_established = true;
                self.session.add_bytes_down(bytes);
                self.stats.add_downstream(bytes);
            }
        }
    }

    /// Close `side` and cascade to its buddy exactly once
    pub fn close(&mut self, side: Side, reason: CloseReason) {
        if side == Side::Remote
            && !self.remote_established
            && matches!(reason, CloseReason::Transport(_))
        {
            if self.redial(&reason) {
                return;
            }
            warn!(
                "Session {}: remote host {} unreachable: {}",
                self.session.session_id, self.session.target_addr, reason
            );
            self.stats.record_connect_failure();
        } else {
            debug!(
                "Session {}: connection to {} closed ({})",
                self.session.session_id, side, reason
            );
        }

        let endpoint = self.endpoint_mut(side);
        if !endpoint.close() {
            return;
        }

        if let Some(buddy) = endpoint.take_buddy() {
            self.endpoint_mut(buddy).set_buddy(None);

            let flushed = self.flush(buddy);
            if flushed > 0 {
                debug!(
                    "Session {}: flushed {} queued bytes to {} before closing",
                    self.session.session_id, flushed, buddy
                );
            }

            debug!(
                "Session {}: closing buddy connection to {} as well",
                self.session.session_id, buddy
            );
            self.endpoint_mut(buddy).close();
        }
    }

    /// Replace a remote that failed before it was established with a
    /// connection to the next untried address. Returns `false` when none is left.
    fn redial(&mut self, reason: &CloseReason) -> bool {
        if self.fallbacks.is_empty() || !self.remote.is_open() || !self.client.is_open() {
            return false;
        }

        let candidates: Vec<SocketAddr> = self.fallbacks.drain(..).collect();
        let (stream, addr, rest) = match connect_any(&candidates) {
            Ok(connecting) => connecting,
            Err(e) => {
                debug!(
                    "Session {}: no fallback address accepted a connect: {}",
                    self.session.session_id, e
                );
                return false;
            }
        };
        self.fallbacks.extend(rest.iter().copied());

        warn!(
            "Session {}: remote host {} unreachable ({}), trying {}",
            self.session.session_id, self.session.target_addr, reason, addr
        );
        self.stats.record_connect_failure();
        self.stats.record_connect();

        let mut remote = RelayEndpoint::new(Side::Remote, stream);
        remote.set_buddy(Some(Side::Client));
        self.remote = remote;
        self.session.target_addr = addr;
        true
    }
}

impl Drop for RelayPair {
    fn drop(&mut self) {
        self.client.close();
        self.remote.close();
        self.session.log_stats();
        self.stats.pair_closed();
    }
}

//! Relay Endpoint
//!
//! One live transport of a relay pair. The endpoint never owns the buffers it
//! works on: the pair hands it the buffer it reads into ("incoming") and the
//! one it sends from ("outgoing") on every callback.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::buffer::RelayBuffer;

/// Which half of a relay pair an endpoint drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Socket accepted from the local client
    Client,
    /// Socket connected to the remote target
    Remote,
}

impl Side {
    /// The opposite endpoint of the same pair
    pub fn buddy(self) -> Side {
        match self {
            Side::Client => Side::Remote,
            Side::Remote => Side::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Open,
    Closed,
}

/// Why an endpoint went to `Closed`
#[derive(Debug)]
pub enum CloseReason {
    /// Orderly shutdown by the peer (zero-byte read)
    PeerClosed,
    /// Read or write failure, including resets and failed connects
    Transport(io::Error),
    /// Closed because the buddy endpoint closed
    Buddy,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::Transport(e) => write!(f, "transport error: {}", e),
            CloseReason::Buddy => write!(f, "buddy closed"),
        }
    }
}

/// Result of one read or write callback
#[derive(Debug)]
pub enum Transfer {
    /// This many bytes moved between the transport and a buffer
    Moved(usize),
    /// Spurious readiness or nothing to do
    Idle,
    /// The endpoint must be closed
    Close(CloseReason),
}

/// Non-blocking driver for one socket of a relay pair
pub struct RelayEndpoint {
    side: Side,
    stream: Option<TcpStream>,
    state: EndpointState,
    buddy: Option<Side>,
}

impl RelayEndpoint {
    pub fn new(side: Side, stream: TcpStream) -> Self {
        Self {
            side,
            stream: Some(stream),
            state: EndpointState::Open,
            buddy: None,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == EndpointState::Open
    }

    pub fn buddy(&self) -> Option<Side> {
        self.buddy
    }

    pub(crate) fn set_buddy(&mut self, buddy: Option<Side>) {
        self.buddy = buddy;
    }

    pub(crate) fn take_buddy(&mut self) -> Option<Side> {
        self.buddy.take()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    /// Pending socket error, such as the outcome of a failed connect
    pub(crate) fn take_error(&self) -> Option<io::Error> {
        let stream = self.stream.as_ref()?;
        match stream.take_error() {
            Ok(pending) => pending,
            Err(e) => Some(e),
        }
    }

    /// Eligible to write iff there is something queued for this transport
    pub fn wants_write(&self, outgoing: &RelayBuffer) -> bool {
        self.is_open() && outgoing.is_nonempty()
    }

    /// Readiness to wait for in the next loop iteration
    pub fn interest(&self, outgoing: &RelayBuffer) -> Interest {
        if self.wants_write(outgoing) {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        }
    }

    /// Wait until the transport reports readiness for `interest`.
    ///
    /// A closed endpoint never becomes ready.
    pub async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        match &self.stream {
            Some(stream) => stream.ready(interest).await,
            None => std::future::pending().await,
        }
    }

    /// Read at most `scratch.len()` bytes into `incoming`
    pub fn on_readable(&mut self, incoming: &mut RelayBuffer, scratch: &mut [u8]) -> Transfer {
        let Some(stream) = self.stream.as_ref() else {
            return Transfer::Idle;
        };

        match stream.try_read(scratch) {
            Ok(0) => Transfer::Close(CloseReason::PeerClosed),
            Ok(n) => {
                incoming.append(&scratch[..n]);
                trace!("{} endpoint read {} bytes", self.side, n);
                Transfer::Moved(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Transfer::Idle,
            Err(e) => Transfer::Close(CloseReason::Transport(e)),
        }
    }

    /// Send as much of `outgoing` as the transport takes without blocking
    pub fn on_writable(&mut self, outgoing: &mut RelayBuffer) -> Transfer {
        if !self.wants_write(outgoing) {
            return Transfer::Idle;
        }
        let Some(stream) = self.stream.as_ref() else {
            return Transfer::Idle;
        };

        match stream.try_write(outgoing.peek_all()) {
            Ok(sent) => {
                outgoing.remove_prefix(sent);
                trace!(
                    "{} endpoint sent {} bytes, {} still queued",
                    self.side,
                    sent,
                    outgoing.len()
                );
                Transfer::Moved(sent)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Transfer::Idle,
            Err(e) => Transfer::Close(CloseReason::Transport(e)),
        }
    }

    /// One-shot, non-blocking attempt to hand queued bytes to the transport
    /// before it is released. Returns the number of bytes sent.
    pub(crate) fn flush_pending(&mut self, outgoing: &mut RelayBuffer) -> usize {
        let mut flushed = 0;
        while self.wants_write(outgoing) {
            match self.on_writable(outgoing) {
                Transfer::Moved(0) | Transfer::Idle | Transfer::Close(_) => break,
                Transfer::Moved(n) => flushed += n,
            }
        }
        flushed
    }

    /// Mark closed and release the transport. Returns `false` if already closed.
    pub fn close(&mut self) -> bool {
        if self.state == EndpointState::Closed {
            return false;
        }
        self.state = EndpointState::Closed;
        if let Some(stream) = self.stream.take() {
            debug!("Closing {} endpoint {:?}", self.side, stream.peer_addr().ok());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    #[test]
    fn test_side_buddy() {
        assert_eq!(Side::Client.buddy(), Side::Remote);
        assert_eq!(Side::Remote.buddy(), Side::Client);
        assert_eq!(Side::Client.to_string(), "client");
    }

    #[tokio::test]
    async fn test_interest_follows_outgoing_buffer() {
        let (local, _peer) = socket_pair().await;
        let endpoint = RelayEndpoint::new(Side::Client, local);
        let mut outgoing = RelayBuffer::new();

        assert!(!endpoint.wants_write(&outgoing));
        assert!(!endpoint.interest(&outgoing).is_writable());

        outgoing.append(b"pending");
        assert!(endpoint.wants_write(&outgoing));
        assert!(endpoint.interest(&outgoing).is_writable());
        assert!(endpoint.interest(&outgoing).is_readable());
    }

    #[tokio::test]
    async fn test_read_appends_to_incoming() {
        let (local, mut peer) = socket_pair().await;
        let mut endpoint = RelayEndpoint::new(Side::Client, local);
        let mut incoming = RelayBuffer::new();
        let mut scratch = [0u8; 4];

        peer.write_all(b"hello").await.unwrap();

        // Chunk size caps a single read
        let mut total = 0;
        while total < 5 {
            endpoint.ready(Interest::READABLE).await.unwrap();
            match endpoint.on_readable(&mut incoming, &mut scratch) {
                Transfer::Moved(n) => {
                    assert!(n <= 4);
                    total += n;
                }
                Transfer::Idle => continue,
                Transfer::Close(reason) => panic!("unexpected close: {}", reason),
            }
        }
        assert_eq!(incoming.peek_all(), b"hello");
    }

    #[tokio::test]
    async fn test_zero_byte_read_is_close() {
        let (local, peer) = socket_pair().await;
        let mut endpoint = RelayEndpoint::new(Side::Remote, local);
        let mut incoming = RelayBuffer::new();
        let mut scratch = [0u8; 64];

        drop(peer);

        loop {
            endpoint.ready(Interest::READABLE).await.unwrap();
            match endpoint.on_readable(&mut incoming, &mut scratch) {
                Transfer::Idle => continue,
                Transfer::Close(CloseReason::PeerClosed) => break,
                Transfer::Close(CloseReason::Transport(_)) => break,
                other => panic!("unexpected transfer: {:?}", other),
            }
        }
        assert!(!incoming.is_nonempty());
    }

    #[tokio::test]
    async fn test_write_drains_only_sent_prefix() {
        let (local, mut peer) = socket_pair().await;
        let mut endpoint = RelayEndpoint::new(Side::Client, local);
        let mut outgoing = RelayBuffer::new();
        outgoing.append(b"response bytes");

        while outgoing.is_nonempty() {
            endpoint.ready(endpoint.interest(&outgoing)).await.unwrap();
            if let Transfer::Close(reason) = endpoint.on_writable(&mut outgoing) {
                panic!("unexpected close: {}", reason);
            }
        }

        let mut received = vec![0u8; 14];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"response bytes");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (local, mut peer) = socket_pair().await;
        let mut endpoint = RelayEndpoint::new(Side::Client, local);

        assert!(endpoint.close());
        assert_eq!(endpoint.state(), EndpointState::Closed);
        assert!(!endpoint.close());

        // Transport was released, so the peer sees EOF
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_endpoint_ignores_callbacks() {
        let (local, _peer) = socket_pair().await;
        let mut endpoint = RelayEndpoint::new(Side::Client, local);
        endpoint.close();

        let mut buffer = RelayBuffer::new();
        buffer.append(b"late");
        let mut scratch = [0u8; 8];
        assert!(matches!(endpoint.on_writable(&mut buffer), Transfer::Idle));
        assert!(matches!(
            endpoint.on_readable(&mut buffer, &mut scratch),
            Transfer::Idle
        ));
        assert_eq!(buffer.peek_all(), b"late");
    }
}

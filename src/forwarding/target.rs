//! Remote target of a forwarding listener

use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::ForwardError;

/// The fixed `host:port` every accepted connection is forwarded to.
///
/// Resolved once when the listener starts. IPv4 addresses are ordered first;
/// a relay pair dials the first address and falls back to the next one while
/// its remote connection has not been established.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    host: String,
    port: u16,
    addrs: Vec<SocketAddr>,
}

impl RemoteTarget {
    pub fn resolve(host: &str, port: u16) -> Result<Self, ForwardError> {
        let mut addrs: Vec<SocketAddr> = match host.parse::<IpAddr>() {
            Ok(ip) => vec![SocketAddr::new(ip, port)],
            Err(_) => (host, port)
                .to_socket_addrs()
                .map_err(|source| ForwardError::Resolve {
                    target: format!("{}:{}", host, port),
                    source,
                })?
                .collect(),
        };

        if addrs.is_empty() {
            return Err(ForwardError::NoAddress(format!("{}:{}", host, port)));
        }

        prefer_ipv4(&mut addrs);

        debug!("Resolved remote target {}:{} to {:?}", host, port, addrs);
        Ok(Self {
            host: host.to_string(),
            port,
            addrs,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// First address tried for outbound connections
    pub fn addr(&self) -> SocketAddr {
        self.addrs[0]
    }

    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Start a non-blocking connect, trying addresses in order until one
    /// can be initiated. Also returns the address used and the untried rest.
    pub(crate) fn connect(&self) -> io::Result<(TcpStream, SocketAddr, &[SocketAddr])> {
        connect_any(&self.addrs)
    }
}

/// Stable, so resolver order is kept within each family
fn prefer_ipv4(addrs: &mut [SocketAddr]) {
    addrs.sort_by_key(|addr| !addr.is_ipv4());
}

/// Connect to the first address in `addrs` that accepts a non-blocking
/// connect. Returns the stream, its address and the addresses after it.
pub(crate) fn connect_any(
    addrs: &[SocketAddr],
) -> io::Result<(TcpStream, SocketAddr, &[SocketAddr])> {
    let mut last_error = None;
    for (i, addr) in addrs.iter().enumerate() {
        match connect_addr(*addr) {
            Ok(stream) => return Ok((stream, *addr, &addrs[i + 1..])),
            Err(e) => {
                debug!("Connect to {} failed immediately: {}", addr, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no remote address left to try")
    }))
}

/// Start a non-blocking connect. The returned stream is still connecting;
/// failure surfaces as an error on its first read or write.
fn connect_addr(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    let std_stream: std::net::TcpStream = socket.into();
    TcpStream::from_std(std_stream)
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

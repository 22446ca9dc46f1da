//! Miscellaneous helpers

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::trace;

/// Whether something accepts TCP connections on `host:port`.
///
/// Plain connect-and-close against each resolved address; `timeout` applies
/// per address.
pub fn port_is_open(host: &str, port: u16, timeout: Duration) -> bool {
    let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            trace!("Probe of {}:{} failed to resolve: {}", host, port, e);
            return false;
        }
    };

    addrs.iter().any(|addr| match TcpStream::connect_timeout(addr, timeout) {
        Ok(_) => true,
        Err(e) => {
            trace!("Probe of {} failed: {}", addr, e);
            false
        }
    })
}

//! Forwarding Listener
//!
//! Accepts local clients and pairs each one with a fresh connection to the
//! remote target. The listening socket and every relay pair it spawns are
//! tasks on the I/O loop; the `ForwardingListener` value is only a handle.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::stats::{ForwardingStats, StatsSnapshot};
use super::target::RemoteTarget;
use crate::config::ForwardingConfig;
use crate::error::ForwardError;
use crate::event_loop::{self, reactor::next_object_id, slot::ListenerSlot, ObjectId, Reactor};
use crate::relay::RelayPair;

/// Cloneable, thread-safe handle to a running forwarding listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle {
    object: ObjectId,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    pub fn object_id(&self) -> ObjectId {
        self.object
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the listening socket. Relay pairs already accepted keep running.
    /// Returns `false` if the listener was already closed.
    pub fn shutdown(&self) -> Result<bool, ForwardError> {
        let closed = event_loop::close_object(self.object)?;
        if closed {
            info!("Forwarding listener on {} shut down", self.local_addr);
        }
        Ok(closed)
    }

    /// Whether the listening socket is still accepting connections
    pub fn is_listening(&self) -> Result<bool, ForwardError> {
        let object = self.object;
        Ok(event_loop::call_existing(move |reactor| reactor.is_registered(object))?.unwrap_or(false))
    }
}

/// A running local port forwarder.
///
/// Dropping this value does not stop forwarding; call [`shutdown`](Self::shutdown).
#[derive(Debug)]
pub struct ForwardingListener {
    handle: ListenerHandle,
    remote: RemoteTarget,
    stats: Arc<ForwardingStats>,
    generation: u64,
}

impl ForwardingListener {
    /// Bind, listen and hand the listener to the I/O loop
    pub fn start(config: &ForwardingConfig) -> Result<Self, ForwardError> {
        let remote = RemoteTarget::resolve(&config.remote_host, config.remote_port)?;
        let std_listener = bind_listener(config.local_addr, config.preferred_port, config.backlog)?;
        let local_addr = std_listener.local_addr()?;

        let stats = Arc::new(ForwardingStats::default());
        let object = next_object_id();
        let chunk_size = config.chunk_size;

        let task_remote = remote.clone();
        let task_stats = Arc::clone(&stats);
        let generation = event_loop::call(move |reactor: &Rc<Reactor>| -> io::Result<u64> {
            let listener = TcpListener::from_std(std_listener)?;
            let slot = Rc::new(ListenerSlot::new(
                format!("forwarding listener {}", local_addr),
                listener,
            ));
            reactor.register(object, slot.clone());
            reactor.spawn(accept_loop(
                Rc::clone(reactor),
                object,
                local_addr,
                slot,
                task_remote,
                chunk_size,
                task_stats,
            ));
            Ok(reactor.generation())
        })??;

        info!(
            "Forwarding {} -> {} (backlog {}, chunk size {})",
            local_addr, remote, config.backlog, chunk_size
        );

        Ok(Self {
            handle: ListenerHandle { object, local_addr },
            remote,
            stats,
            generation,
        })
    }

    /// Forward `local_ip:<any port>` to `host:port` with default settings
    pub fn bind(local_ip: IpAddr, host: &str, port: u16) -> Result<Self, ForwardError> {
        let config = ForwardingConfig {
            local_addr: local_ip,
            remote_host: host.to_string(),
            remote_port: port,
            ..ForwardingConfig::default()
        };
        Self::start(&config)
    }

    /// The actual bound port (never zero)
    pub fn listening_port(&self) -> u16 {
        self.handle.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr
    }

    pub fn remote(&self) -> &RemoteTarget {
        &self.remote
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote.addr()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn handle(&self) -> ListenerHandle {
        self.handle
    }

    /// Generation of the I/O loop this listener was installed on
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_listening(&self) -> Result<bool, ForwardError> {
        self.handle.is_listening()
    }

    /// Stop accepting new connections. Safe to call repeatedly, from any
    /// thread, including from the loop itself.
    pub fn shutdown(&self) -> Result<bool, ForwardError> {
        self.handle.shutdown()
    }
}

/// Bind the preferred port if possible, otherwise let the OS pick one
fn bind_listener(
    ip: IpAddr,
    preferred_port: Option<u16>,
    backlog: u32,
) -> Result<std::net::TcpListener, ForwardError> {
    if let Some(port) = preferred_port.filter(|port| *port != 0) {
        let addr = SocketAddr::new(ip, port);
        match bind_socket(addr, backlog) {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!("Preferred address {} unavailable ({}), using any port", addr, e),
        }
    }

    let addr = SocketAddr::new(ip, 0);
    bind_socket(addr, backlog).map_err(|e| ForwardError::bind(addr, e))
}

fn bind_socket(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Errors from a client that went away between SYN and accept
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
    )
}

async fn accept_loop(
    reactor: Rc<Reactor>,
    object: ObjectId,
    local_addr: SocketAddr,
    slot: Rc<ListenerSlot<TcpListener>>,
    remote: RemoteTarget,
    chunk_size: usize,
    stats: Arc<ForwardingStats>,
) {
    while let Some(accepted) = slot.accept().await {
        match accepted {
            Ok((client, client_addr)) => {
                open_pair(&reactor, client, client_addr, &remote, chunk_size, &stats)
            }
            Err(e) if is_transient(&e) => {
                debug!("Accepted socket connection but now it's gone: {}", e);
            }
            Err(e) => {
                warn!("Failed to accept connection on {}: {}", local_addr, e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    reactor.unregister(object);
    debug!("Accept loop for {} finished", local_addr);
}

fn open_pair(
    reactor: &Rc<Reactor>,
    client: TcpStream,
    client_addr: SocketAddr,
    remote: &RemoteTarget,
    chunk_size: usize,
    stats: &Arc<ForwardingStats>,
) {
    stats.record_accept();
    debug!("Accepted connection from {}, connecting to {}", client_addr, remote);

    let (remote_stream, remote_addr, fallbacks) = match remote.connect() {
        Ok(connecting) => connecting,
        Err(e) => {
            warn!("Failed to connect to remote host {}: {}", remote, e);
            stats.record_connect_failure();
            return;
        }
    };
    stats.record_connect();

    let pair = RelayPair::new(
        client,
        remote_stream,
        client_addr,
        remote_addr,
        chunk_size,
        Arc::clone(stats),
    )
    .with_fallbacks(fallbacks);
    reactor.spawn(pair.run());
}

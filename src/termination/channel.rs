//! Termination Channel
//!
//! A Unix domain socket that lets another local process stop a forwarding
//! listener by sending the pre-shared secret. Every accepted control
//! connection gets its own verifier task. A match closes, in order: the
//! forwarding listener, this channel (socket and path), and the control
//! connection itself. Established relay pairs are not touched.

use bytes::Bytes;
use socket2::{Domain, SockAddr, Socket, Type};
use std::fs;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::credential::Credential;
use super::verifier::{SecretVerifier, Verdict};
use crate::config::{TerminationConfig, DEFAULT_BACKLOG, DEFAULT_CHUNK_SIZE};
use crate::error::ForwardError;
use crate::event_loop::reactor::{next_object_id, Closable};
use crate::event_loop::slot::ListenerSlot;
use crate::event_loop::{self, ObjectId, Reactor};
use crate::forwarding::{ForwardingListener, ListenerHandle};

/// Handle to a running termination channel
#[derive(Debug)]
pub struct TerminationChannel {
    object: ObjectId,
    socket_path: PathBuf,
    secret: Bytes,
    listener: ListenerHandle,
}

impl TerminationChannel {
    /// Listen on `path` for `secret`; a match shuts `listener` down
    pub fn start(
        path: impl AsRef<Path>,
        secret: impl Into<Vec<u8>>,
        listener: &ForwardingListener,
        backlog: u32,
        chunk_size: usize,
    ) -> Result<Self, ForwardError> {
        let secret = Bytes::from(secret.into());
        if secret.is_empty() {
            return Err(ForwardError::EmptySecret);
        }

        let socket_path = path.as_ref().to_path_buf();
        let std_listener = bind_control_socket(&socket_path, backlog)
            .map_err(|e| ForwardError::bind(socket_path.display(), e))?;

        let object = next_object_id();
        let target = listener.handle();
        let task_path = socket_path.clone();
        let task_secret = secret.clone();

        let installed = event_loop::call(move |reactor: &Rc<Reactor>| -> io::Result<()> {
            let unix_listener = match UnixListener::from_std(std_listener) {
                Ok(unix_listener) => unix_listener,
                Err(e) => {
                    remove_socket_file(&task_path);
                    return Err(e);
                }
            };
            let control = Rc::new(ControlSlot {
                slot: ListenerSlot::new(
                    format!("termination channel {}", task_path.display()),
                    unix_listener,
                ),
                path: task_path,
            });
            reactor.register(object, control.clone());
            reactor.spawn(control_loop(
                Rc::clone(reactor),
                object,
                control,
                task_secret,
                target.object_id(),
                chunk_size,
            ));
            Ok(())
        });

        match installed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(e) => {
                remove_socket_file(&socket_path);
                return Err(e);
            }
        }

        info!(
            "Termination channel listening on {} for listener {}",
            socket_path.display(),
            target.local_addr()
        );

        Ok(Self {
            object,
            socket_path,
            secret,
            listener: target,
        })
    }

    /// `start` with the default backlog and chunk size
    pub fn with_defaults(
        path: impl AsRef<Path>,
        secret: impl Into<Vec<u8>>,
        listener: &ForwardingListener,
    ) -> Result<Self, ForwardError> {
        Self::start(path, secret, listener, DEFAULT_BACKLOG, DEFAULT_CHUNK_SIZE)
    }

    /// Start from configuration, generating the path and secret when absent
    pub fn from_config(
        config: &TerminationConfig,
        listener: &ForwardingListener,
    ) -> Result<Self, ForwardError> {
        let path = config
            .socket_path
            .clone()
            .unwrap_or_else(default_socket_path);
        let secret = config
            .secret
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        Self::start(path, secret, listener, config.backlog, config.chunk_size)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// The forwarding listener this channel can shut down
    pub fn listener(&self) -> ListenerHandle {
        self.listener
    }

    /// Path and secret, for handing to another process
    pub fn credential(&self) -> Credential {
        Credential::new(self.socket_path.clone(), self.secret.to_vec())
    }

    pub fn is_listening(&self) -> Result<bool, ForwardError> {
        let object = self.object;
        Ok(event_loop::call_existing(move |reactor| reactor.is_registered(object))?.unwrap_or(false))
    }

    /// Close the control socket and remove its path. A second call is a no-op.
    pub fn shutdown(&self) -> Result<bool, ForwardError> {
        event_loop::close_object(self.object)
    }
}

/// `$TMPDIR/rustforward-<uuid>.sock`
pub fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("rustforward-{}.sock", Uuid::new_v4().simple()))
}

fn bind_control_socket(path: &Path, backlog: u32) -> io::Result<std::os::unix::net::UnixListener> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    let addr = SockAddr::unix(path)?;
    // The socket file is created with 0600 rather than chmod-ed afterwards
    with_umask(0o177, || socket.bind(&addr))?;

    // From here on the path is ours to clean up
    let configured = fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .and_then(|_| socket.listen(backlog.min(i32::MAX as u32) as i32))
        .and_then(|_| socket.set_nonblocking(true));
    if let Err(e) = configured {
        remove_socket_file(path);
        return Err(e);
    }

    Ok(std::os::unix::net::UnixListener::from(OwnedFd::from(socket)))
}

/// Run `f` with `mask` as the process umask, restoring the previous one after
fn with_umask<T>(mask: libc::mode_t, f: impl FnOnce() -> T) -> T {
    static UMASK: Mutex<()> = Mutex::new(());
    let _guard = UMASK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    let previous = unsafe { libc::umask(mask) };
    let result = f();
    unsafe { libc::umask(previous) };
    result
}

fn remove_socket_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed control socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove control socket {}: {}", path.display(), e),
    }
}

struct ControlSlot {
    slot: ListenerSlot<UnixListener>,
    path: PathBuf,
}

impl Closable for ControlSlot {
    fn close(&self) {
        if self.slot.release() {
            remove_socket_file(&self.path);
            info!("Termination channel {} closed", self.path.display());
        }
    }
}

async fn control_loop(
    reactor: Rc<Reactor>,
    object: ObjectId,
    control: Rc<ControlSlot>,
    secret: Bytes,
    listener: ObjectId,
    chunk_size: usize,
) {
    while let Some(accepted) = control.slot.accept().await {
        match accepted {
            Ok((stream, _)) => {
                debug!("Accepted control connection on {}", control.path.display());
                reactor.spawn(verify(
                    Rc::clone(&reactor),
                    stream,
                    secret.clone(),
                    listener,
                    object,
                    chunk_size,
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                debug!("Accepted socket connection but now it's gone: {}", e);
            }
            Err(e) => {
                warn!("Failed to accept control connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    reactor.unregister(object);
}

/// Read the control connection until the verifier reaches a verdict
async fn verify(
    reactor: Rc<Reactor>,
    stream: UnixStream,
    secret: Bytes,
    listener: ObjectId,
    channel: ObjectId,
    chunk_size: usize,
) {
    let mut verifier = SecretVerifier::new(secret);
    let mut scratch = vec![0u8; chunk_size.max(1)];

    loop {
        if let Err(e) = stream.readable().await {
            debug!("Control connection failed: {}", e);
            verifier.peer_disconnected();
            break;
        }

        let read = match stream.try_read(&mut scratch) {
            Ok(0) => {
                debug!("Control connection closed before the secret was complete");
                verifier.peer_disconnected();
                break;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                debug!("Control connection failed: {}", e);
                verifier.peer_disconnected();
                break;
            }
        };

        match verifier.feed(&scratch[..read]) {
            Verdict::Pending => {}
            Verdict::Matched if !reactor.is_registered(channel) => {
                debug!("Termination secret arrived after the channel was closed, ignoring");
                break;
            }
            Verdict::Matched => {
                info!("Termination secret accepted, no longer accepting new connections");
                reactor.close(listener);
                reactor.close(channel);
                break;
            }
            Verdict::Rejected(rejection) => {
                warn!("Rejected control connection: {}", rejection);
                break;
            }
            Verdict::Ignored => break,
        }
    }

    drop(stream);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bound_socket_is_owner_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("control.sock");

        let listener = bind_control_socket(&path, 5).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        drop(listener);
        remove_socket_file(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_with_umask_applies_mask_to_new_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("masked");

        with_umask(0o177, || fs::File::create(&path)).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
    }
}

//! Listening sockets owned by the loop
//!
//! A `ListenerSlot` holds a listener that can be released from outside the
//! accept task. Releasing drops the socket right away and wakes the task so
//! it can finish.

use std::cell::RefCell;
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll, Waker};
use tokio::net::{unix, TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::debug;

use super::reactor::Closable;

/// A listening socket the slot can poll for new connections
pub(crate) trait Acceptor {
    type Stream;
    type Addr;

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(Self::Stream, Self::Addr)>>;
}

impl Acceptor for TcpListener {
    type Stream = TcpStream;
    type Addr = SocketAddr;

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>> {
        TcpListener::poll_accept(self, cx)
    }
}

impl Acceptor for UnixListener {
    type Stream = UnixStream;
    type Addr = unix::SocketAddr;

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(UnixStream, unix::SocketAddr)>> {
        UnixListener::poll_accept(self, cx)
    }
}

pub(crate) struct ListenerSlot<L> {
    label: String,
    listener: RefCell<Option<L>>,
    waker: RefCell<Option<Waker>>,
}

impl<L: Acceptor> ListenerSlot<L> {
    pub fn new(label: impl Into<String>, listener: L) -> Self {
        Self {
            label: label.into(),
            listener: RefCell::new(Some(listener)),
            waker: RefCell::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.listener.borrow().is_some()
    }

    /// Next connection, or `None` once the slot has been released
    pub async fn accept(&self) -> Option<io::Result<(L::Stream, L::Addr)>> {
        poll_fn(|cx| {
            let listener = self.listener.borrow();
            let Some(listener) = listener.as_ref() else {
                return Poll::Ready(None);
            };
            match listener.poll_accept(cx) {
                Poll::Ready(result) => Poll::Ready(Some(result)),
                Poll::Pending => {
                    *self.waker.borrow_mut() = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
        .await
    }

    /// Drop the listening socket. Returns `false` if it was already released.
    pub fn release(&self) -> bool {
        let listener = self.listener.borrow_mut().take();
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
        match listener {
            Some(listener) => {
                drop(listener);
                debug!("Released {}", self.label);
                true
            }
            None => false,
        }
    }
}

impl<L: Acceptor> Closable for ListenerSlot<L> {
    fn close(&self) {
        self.release();
    }
}

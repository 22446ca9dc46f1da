//! Loop-thread-local reactor state
//!
//! Everything in here lives on the I/O thread only: the count of live tasks
//! that keep the loop running, and the registry of objects other threads may
//! ask to close.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Process-wide identifier of an object registered with the loop
pub type ObjectId = u64;

static NEXT_OBJECT: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_object_id() -> ObjectId {
    NEXT_OBJECT.fetch_add(1, Ordering::Relaxed)
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Reactor>>> = const { RefCell::new(None) };
}

/// Something the loop can close synchronously on request
pub(crate) trait Closable {
    fn close(&self);
}

pub struct Reactor {
    generation: u64,
    live: Cell<usize>,
    idle: Notify,
    objects: RefCell<HashMap<ObjectId, Rc<dyn Closable>>>,
}

impl Reactor {
    /// Reactor of the calling thread, if it is an I/O loop thread
    pub fn current() -> Option<Rc<Reactor>> {
        CURRENT.with(|current| current.borrow().clone())
    }

    pub(crate) fn enter(generation: u64) -> Rc<Reactor> {
        let reactor = Rc::new(Reactor {
            generation,
            live: Cell::new(0),
            idle: Notify::new(),
            objects: RefCell::new(HashMap::new()),
        });
        CURRENT.with(|current| *current.borrow_mut() = Some(Rc::clone(&reactor)));
        reactor
    }

    pub(crate) fn leave() {
        CURRENT.with(|current| current.borrow_mut().take());
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Tasks currently keeping the loop alive
    pub fn live(&self) -> usize {
        self.live.get()
    }

    /// Spawn a task on the loop. The loop stays up until it completes.
    pub fn spawn<F>(self: &Rc<Self>, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.live.set(self.live.get() + 1);
        let guard = LiveGuard {
            reactor: Rc::clone(self),
        };
        tokio::task::spawn_local(async move {
            let _guard = guard;
            future.await;
        });
    }

    pub(crate) fn register(&self, id: ObjectId, object: Rc<dyn Closable>) {
        trace!("Registering loop object {}", id);
        self.objects.borrow_mut().insert(id, object);
    }

    pub(crate) fn unregister(&self, id: ObjectId) {
        if self.objects.borrow_mut().remove(&id).is_some() {
            trace!("Unregistered loop object {}", id);
        }
    }

    pub fn is_registered(&self, id: ObjectId) -> bool {
        self.objects.borrow().contains_key(&id)
    }

    /// Close and forget a registered object. Returns `false` if it was
    /// already gone.
    pub fn close(&self, id: ObjectId) -> bool {
        let object = self.objects.borrow_mut().remove(&id);
        match object {
            Some(object) => {
                debug!("Closing loop object {}", id);
                object.close();
                true
            }
            None => false,
        }
    }

    /// Resolves once no live task remains
    pub(crate) async fn wait_idle(&self) {
        while self.live.get() > 0 {
            self.idle.notified().await;
        }
    }
}

struct LiveGuard {
    reactor: Rc<Reactor>,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let remaining = self.reactor.live.get().saturating_sub(1);
        self.reactor.live.set(remaining);
        if remaining == 0 {
            self.reactor.idle.notify_one();
        }
    }
}

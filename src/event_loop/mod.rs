//! I/O Event Loop
//!
//! A single background thread runs a current-thread tokio runtime and a
//! `LocalSet`. Every listener, relay pair, control channel and verifier is a
//! local task on it, so none of their state needs locking.
//!
//! The loop is started lazily by the first caller that needs it and exits on
//! its own once no task is alive and no job is queued. The next caller then
//! starts a new generation. At most one generation is active at a time; the
//! check-and-start sequence and the exit check both run under `RUNNER`.
//!
//! Off-loop callers submit a job and block until the loop has run it.
//! Callers already on the loop thread run inline.

pub mod reactor;
pub(crate) mod slot;

pub use reactor::{ObjectId, Reactor};

use std::rc::Rc;
use std::sync::mpsc as std_mpsc;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::{debug, error, info, warn};

use crate::error::ForwardError;

type Job = Box<dyn FnOnce(&Rc<Reactor>) + Send>;

struct LoopHandle {
    generation: u64,
    jobs: mpsc::UnboundedSender<Job>,
    thread: thread::JoinHandle<()>,
}

struct RunnerState {
    current: Option<LoopHandle>,
    last_generation: u64,
}

static RUNNER: Mutex<RunnerState> = Mutex::new(RunnerState {
    current: None,
    last_generation: 0,
});

static EXITED: Condvar = Condvar::new();

fn lock() -> MutexGuard<'static, RunnerState> {
    RUNNER.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hand a job to the active loop, starting a new generation if needed
fn dispatch(job: Job) -> Result<u64, ForwardError> {
    let mut state = lock();

    let job = match state.current.take() {
        Some(handle) => match handle.jobs.send(job) {
            Ok(()) => {
                let generation = handle.generation;
                state.current = Some(handle);
                return Ok(generation);
            }
            Err(mpsc::error::SendError(job)) => {
                warn!(
                    "I/O loop generation {} stopped unexpectedly, replacing it",
                    handle.generation
                );
                job
            }
        },
        None => job,
    };

    let generation = state.last_generation + 1;
    if state.last_generation == 0 {
        info!("Starting I/O loop");
    } else {
        info!("Restarting I/O loop (generation {})", generation);
    }

    let (jobs, receiver) = mpsc::unbounded_channel();
    jobs.send(job)
        .map_err(|_| ForwardError::EventLoop("job queue closed before start".to_string()))?;

    let thread = thread::Builder::new()
        .name(format!("rustforward-io-{}", generation))
        .spawn(move || run(generation, receiver))
        .map_err(|e| ForwardError::EventLoop(format!("failed to spawn I/O thread: {}", e)))?;

    state.last_generation = generation;
    state.current = Some(LoopHandle {
        generation,
        jobs,
        thread,
    });
    Ok(generation)
}

/// Hand a job to the active loop only. Returns `None` if no loop is running.
fn dispatch_existing(job: Job) -> Option<u64> {
    let state = lock();
    let handle = state.current.as_ref()?;
    handle.jobs.send(job).ok()?;
    Some(handle.generation)
}

fn acknowledged<T>(receiver: std_mpsc::Receiver<T>) -> Result<T, ForwardError> {
    receiver
        .recv()
        .map_err(|_| ForwardError::EventLoop("I/O loop stopped before running the request".to_string()))
}

/// Run `f` on the loop thread, starting the loop if it is not running
pub(crate) fn call<T, F>(f: F) -> Result<T, ForwardError>
where
    F: FnOnce(&Rc<Reactor>) -> T + Send + 'static,
    T: Send + 'static,
{
    if let Some(reactor) = Reactor::current() {
        return Ok(f(&reactor));
    }

    let (tx, rx) = std_mpsc::sync_channel(1);
    dispatch(Box::new(move |reactor: &Rc<Reactor>| {
        let _ = tx.send(f(reactor));
    }))?;
    acknowledged(rx)
}

/// Run `f` on the loop thread if a loop is running; `Ok(None)` otherwise
pub(crate) fn call_existing<T, F>(f: F) -> Result<Option<T>, ForwardError>
where
    F: FnOnce(&Rc<Reactor>) -> T + Send + 'static,
    T: Send + 'static,
{
    if let Some(reactor) = Reactor::current() {
        return Ok(Some(f(&reactor)));
    }

    let (tx, rx) = std_mpsc::sync_channel(1);
    let sent = dispatch_existing(Box::new(move |reactor: &Rc<Reactor>| {
        let _ = tx.send(f(reactor));
    }));
    match sent {
        Some(_) => acknowledged(rx).map(Some),
        None => Ok(None),
    }
}

/// Close a registered loop object. Returns `false` if it was already closed
/// or no loop is running.
pub(crate) fn close_object(id: ObjectId) -> Result<bool, ForwardError> {
    Ok(call_existing(move |reactor| reactor.close(id))?.unwrap_or(false))
}

/// Whether a loop generation is currently active
pub fn is_running() -> bool {
    lock()
        .current
        .as_ref()
        .map(|handle| !handle.thread.is_finished())
        .unwrap_or(false)
}

/// Generation of the active loop, or of the last one if none is active.
/// Zero if no loop was ever started.
pub fn generation() -> u64 {
    lock().last_generation
}

/// Generation of the active loop, if any
pub fn current_generation() -> Option<u64> {
    lock().current.as_ref().map(|handle| handle.generation)
}

/// Block until the active loop (if any) has exited
pub fn wait_for_exit() {
    if Reactor::current().is_some() {
        warn!("wait_for_exit called from the I/O loop thread, ignoring");
        return;
    }
    let state = lock();
    let _state = EXITED
        .wait_while(state, |state| state.current.is_some())
        .unwrap_or_else(PoisonError::into_inner);
}

/// Like [`wait_for_exit`] but gives up after `timeout`. Returns `true` if no
/// loop is active on return.
pub fn wait_for_exit_timeout(timeout: Duration) -> bool {
    if Reactor::current().is_some() {
        return false;
    }
    let state = lock();
    let (state, _) = EXITED
        .wait_timeout_while(state, timeout, |state| state.current.is_some())
        .unwrap_or_else(PoisonError::into_inner);
    state.current.is_none()
}

/// Clears the runner slot if the loop thread leaves without retiring cleanly
struct RetireGuard {
    generation: u64,
}

impl Drop for RetireGuard {
    fn drop(&mut self) {
        let mut state = lock();
        if state.current.as_ref().map(|handle| handle.generation) == Some(self.generation) {
            warn!("I/O loop generation {} exited abnormally", self.generation);
            state.current = None;
        }
        EXITED.notify_all();
    }
}

fn run(generation: u64, jobs: mpsc::UnboundedReceiver<Job>) {
    let _retire = RetireGuard { generation };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to build I/O runtime: {}", e);
            return;
        }
    };

    let reactor = Reactor::enter(generation);
    debug!("I/O loop generation {} running", generation);

    let local = LocalSet::new();
    local.block_on(&runtime, drive(Rc::clone(&reactor), jobs));
    drop(local);

    Reactor::leave();
    debug!("I/O loop generation {} stopped", generation);
}

async fn drive(reactor: Rc<Reactor>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    loop {
        tokio::select! {
            biased;

            job = jobs.recv() => match job {
                Some(job) => job(&reactor),
                None => {
                    reactor.wait_idle().await;
                    break;
                }
            },
            _ = reactor.wait_idle() => match retire_if_idle(&reactor, &mut jobs) {
                Some(job) => job(&reactor),
                None => break,
            },
        }
    }
}

/// Exit check, done under the runner lock so no job can slip in between the
/// emptiness check and clearing the slot. Returns a job that raced in.
fn retire_if_idle(reactor: &Reactor, jobs: &mut mpsc::UnboundedReceiver<Job>) -> Option<Job> {
    let mut state = lock();
    if let Ok(job) = jobs.try_recv() {
        return Some(job);
    }

    if state.current.as_ref().map(|handle| handle.generation) == Some(reactor.generation()) {
        state.current = None;
    }
    info!(
        "I/O loop generation {} has no more work, exiting",
        reactor.generation()
    );
    EXITED.notify_all();
    None
}

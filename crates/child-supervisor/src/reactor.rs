//! Single-threaded reactor binding
//!
//! The reactor is a thin layer over smol's [`LocalExecutor`]: every
//! asynchronous resource (pipe reader, process exit watcher, timer) is a
//! *handle* registered as a future on one local executor. [`Reactor::run`]
//! drives that executor on the calling thread, readiness comes from the
//! async-io poller underneath, and the call returns once no handle is
//! active any more.
//!
//! All callbacks therefore run on one thread and never concurrently, which is
//! why the rest of the crate shares state through `Rc`/`RefCell` and holds no
//! locks.

use futures::future::poll_fn;
use smol::LocalExecutor;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::task::{Poll, Waker};
use tracing::trace;

/// Identifier of a handle registered with a [`Reactor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a registered handle is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Readability of a pipe channel
    Pipe,
    /// Exit of a child process
    Process,
    /// A deadline
    Timer,
}

/// Bookkeeping shared between the reactor and its live handles
#[derive(Default)]
struct HandleTable {
    next_id: Cell<u64>,
    active: Cell<usize>,
    completed: Cell<usize>,
    idle: RefCell<Option<Waker>>,
}

/// Marks one handle as active for as long as its future is alive
struct ActiveHandle {
    id: HandleId,
    kind: HandleKind,
    table: Rc<HandleTable>,
}

impl Drop for ActiveHandle {
    fn drop(&mut self) {
        let remaining = self.table.active.get() - 1;
        self.table.active.set(remaining);
        self.table.completed.set(self.table.completed.get() + 1);
        trace!(handle = %self.id, kind = ?self.kind, remaining, "handle released");

        if remaining == 0 {
            if let Some(waker) = self.table.idle.borrow_mut().take() {
                waker.wake();
            }
        }
    }
}

/// A single-threaded event loop
///
/// Cloning a `Reactor` yields another handle to the same loop. The type is
/// `!Send`: a loop and all of its callbacks live on one thread.
#[derive(Clone)]
pub struct Reactor {
    executor: Rc<LocalExecutor<'static>>,
    handles: Rc<HandleTable>,
}

impl Reactor {
    /// Create a new, empty event loop
    pub fn new() -> Self {
        Self {
            executor: Rc::new(LocalExecutor::new()),
            handles: Rc::new(HandleTable::default()),
        }
    }

    /// Register a handle
    ///
    /// The handle counts as active until `future` completes. Nothing runs
    /// until [`Reactor::run`] is called; handles registered from inside a
    /// callback join the current run.
    pub fn register<F>(&self, kind: HandleKind, future: F) -> HandleId
    where
        F: Future<Output = ()> + 'static,
    {
        let id = HandleId(self.handles.next_id.get());
        self.handles.next_id.set(id.0 + 1);
        self.handles.active.set(self.handles.active.get() + 1);
        trace!(handle = %id, ?kind, "handle registered");

        let guard = ActiveHandle {
            id,
            kind,
            table: self.handles.clone(),
        };
        self.executor
            .spawn(async move {
                let _guard = guard;
                future.await;
            })
            .detach();

        id
    }

    /// Number of handles that have not completed yet
    pub fn active_handles(&self) -> usize {
        self.handles.active.get()
    }

    /// Returns true if at least one handle is still active
    pub fn is_alive(&self) -> bool {
        self.active_handles() > 0
    }

    /// Dispatch callbacks until no handle is active
    ///
    /// Returns the number of handles that completed during this run. Must not
    /// be called from inside a callback of the same loop.
    pub fn run(&self) -> usize {
        let before = self.handles.completed.get();
        let table = self.handles.clone();

        smol::block_on(self.executor.run(poll_fn(move |cx| {
            if table.active.get() == 0 {
                Poll::Ready(())
            } else {
                *table.idle.borrow_mut() = Some(cx.waker().clone());
                Poll::Pending
            }
        })));

        self.handles.completed.get() - before
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("active", &self.handles.active.get())
            .field("completed", &self.handles.completed.get())
            .finish()
    }
}

//! Cooperative schedulers.
//!
//! A scheduler owns a FIFO run queue of [`Work`] and a set of worker
//! threads that pop and run it. What a worker does when the queue is empty
//! is left to the implementation: [`WorkerPool`] simply blocks until work
//! arrives, while the [`IoManager`](crate::IoManager) blocks in the OS
//! readiness call.
//!
//! Every scheduler is reached through a [`SchedulerHandle`], which is also
//! what the thread-local "current scheduler" stores.

mod core;
mod worker;
mod worker_pool;

pub(crate) mod builder;
pub(crate) mod completion;
pub(crate) mod context;
pub(crate) mod parallel;

pub use self::core::{SchedulerCore, Work};
pub use builder::SchedulerBuilder;
pub use context::SchedulerSwitcher;
pub use parallel::{parallel_do, parallel_foreach};
pub use worker_pool::WorkerPool;

pub(crate) use self::core::Task;

use crate::coroutine::Coroutine;
use completion::Completion;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use tracing::{debug, trace};

/// Behaviour a concrete scheduler plugs into the shared run loop.
pub trait Scheduler: Send + Sync + 'static {
    /// The shared queue and thread bookkeeping.
    fn core(&self) -> &SchedulerCore;

    /// Wakes one idle worker so it re-evaluates its wait.
    fn tickle(&self);

    /// Runs, inside a coroutine, whenever a worker finds nothing to do.
    ///
    /// It yields back to the run loop once work may be available and
    /// returns when the worker should exit, which must not happen before
    /// [`stopping`](Self::stopping) holds. A panic here is fatal to the
    /// worker and is re-raised from its run loop.
    fn idle(&self);

    /// Whether workers may exit.
    fn stopping(&self) -> bool {
        self.core().stopping()
    }
}

/// Shared, type-erased reference to a scheduler.
///
/// Two handles are equal when they refer to the same scheduler.
#[derive(Clone)]
pub struct SchedulerHandle(Arc<dyn Scheduler>);

impl SchedulerHandle {
    pub fn new<S: Scheduler>(scheduler: Arc<S>) -> Self {
        Self(scheduler)
    }

    /// Scheduler the calling thread works for, if any.
    pub fn current() -> Option<Self> {
        context::current()
    }

    pub(crate) fn scheduler(&self) -> &dyn Scheduler {
        &*self.0
    }

    pub fn core(&self) -> &SchedulerCore {
        self.0.core()
    }

    /// Ids of the worker threads, the hijacked one first.
    pub fn worker_ids(&self) -> Vec<ThreadId> {
        self.core().worker_ids()
    }

    /// Whether the workers of this scheduler may exit.
    pub fn is_stopping(&self) -> bool {
        self.0.stopping()
    }

    /// Appends `work` to the run queue.
    ///
    /// Safe to call from any thread, from inside scheduled work included.
    /// A scheduled coroutine is moved to [`State::Ready`](crate::State).
    pub fn schedule(&self, work: impl Into<Work>) {
        self.push(work.into(), None);
    }

    /// Appends `work` to the run queue, to be run only by `thread`.
    ///
    /// `thread` must be one of this scheduler's workers.
    pub fn schedule_on(&self, work: impl Into<Work>, thread: ThreadId) {
        self.push(work.into(), Some(thread));
    }

    fn push(&self, work: Work, thread: Option<ThreadId>) {
        if let Work::Coroutine(coroutine) = &work {
            coroutine.mark_ready();
        }

        if self.core().push(Task { work, thread }) {
            self.0.tickle();
        }
    }

    /// Launches the worker threads. Does nothing if they already run.
    pub fn start(&self) {
        let Some(spawn) = self.core().begin_start() else {
            return;
        };

        debug!(threads = spawn, hijack = self.core().root_thread().is_some(), "starting scheduler");

        for _ in 0..spawn {
            let handle = self.clone();
            let thread = thread::spawn(move || {
                trace!("worker thread started");
                worker::run(&handle, &|| false);
                trace!("worker thread exiting");
            });

            self.core().add_thread(thread);
        }
    }

    /// Stops the scheduler after every queued piece of work ran.
    ///
    /// On the hijacked thread this runs the dispatch loop until the
    /// scheduler drains, then joins the spawned workers. Calling it again,
    /// or on a scheduler that never started, is a no-op. Called from work
    /// running on this scheduler, it only requests the stop and returns.
    pub fn stop(&self) {
        let core = self.core();

        core.request_stop();
        for _ in 0..core.thread_count() {
            self.0.tickle();
        }

        if context::dispatching(self) {
            trace!("stop requested from inside the scheduler");
            return;
        }

        if core.on_root() {
            worker::run(self, &|| false);
        } else if core.root_thread().is_some() {
            debug!("stopping a hijacking scheduler away from its thread; its queue stays with that thread");
        }

        for thread in core.take_threads() {
            let _ = thread.join();
        }
        core.mark_stopped();

        debug!("scheduler stopped");
    }

    /// Runs the dispatch loop on the hijacked thread until the queue
    /// drains and the scheduler's idle condition is met.
    ///
    /// # Panics
    ///
    /// Panics when not called from the hijacked thread.
    pub fn dispatch(&self) {
        let core = self.core();
        assert!(
            core.on_root(),
            "dispatch must be called from the scheduler's hijacked thread"
        );

        core.set_draining(true);
        worker::run(self, &|| false);
        core.set_draining(false);
    }

    /// Moves the running coroutine onto this scheduler.
    ///
    /// The coroutine is suspended, queued here, and continues once one of
    /// this scheduler's workers resumes it. Switching to the scheduler the
    /// thread already works for returns immediately.
    ///
    /// # Panics
    ///
    /// Panics if a switch is needed outside of a coroutine.
    pub fn switch_to(&self) {
        if context::current().as_ref() == Some(self) {
            return;
        }

        let coroutine = Coroutine::current().expect("switch_to called outside of a coroutine");

        self.schedule(coroutine);
        Coroutine::yield_now();
    }

    /// Runs `f` in a new coroutine on this scheduler and returns its value.
    ///
    /// Called from a coroutine, the caller is suspended until `f` returns.
    /// On the hijacked thread, the calling thread dispatches until `f`
    /// returns. Anywhere else the calling thread blocks. A panic in `f` is
    /// re-raised here.
    pub fn block_on<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let drive = !Coroutine::in_coroutine() && self.core().on_root();
        let root = thread::current().id();

        let completion = Arc::new(Completion::new());
        let done = completion.clone();
        let handle = self.clone();

        let coroutine = Coroutine::with_stack_size(self.core().stack_size(), move || {
            done.complete(panic::catch_unwind(AssertUnwindSafe(f)));

            if drive {
                handle.schedule_on(Work::callback(|| {}), root);
            }
        });
        self.schedule(coroutine);

        if drive {
            worker::run(self, &|| completion.is_complete());
        }

        match completion.wait() {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

/// Gives other ready work a turn.
///
/// A coroutine is queued at the back of its scheduler and suspended. On a
/// hijacked thread outside of its dispatch loop, the queue is run until it
/// is empty. Anywhere else the OS thread yields.
pub fn yield_to() {
    let current = context::current();

    match (Coroutine::current(), current) {
        (Some(coroutine), Some(scheduler)) => {
            scheduler.schedule(coroutine);
            Coroutine::yield_now();
        }
        (Some(_), None) => Coroutine::yield_now(),
        (None, Some(scheduler)) if scheduler.core().on_root() && !context::is_dispatching() => {
            let core = scheduler.core();
            worker::run(&scheduler, &|| core.is_queue_empty());
        }
        (None, _) => thread::yield_now(),
    }
}

impl PartialEq for SchedulerHandle {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }
}

impl Eq for SchedulerHandle {}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SchedulerHandle")
            .field(&Arc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}

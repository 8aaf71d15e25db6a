use super::SchedulerHandle;

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, ThreadId};

use tracing::warn;

thread_local! {
    /// Scheduler the calling thread works for.
    ///
    /// Set by worker threads for their whole life and by a hijacking
    /// scheduler on its constructing thread until it is dropped.
    pub(crate) static CURRENT_SCHEDULER: RefCell<Option<SchedulerHandle>> =
        const { RefCell::new(None) };

    /// Scheduler whose run loop is executing on this thread.
    pub(crate) static DISPATCHING: RefCell<Option<SchedulerHandle>> =
        const { RefCell::new(None) };
}

pub(crate) fn current() -> Option<SchedulerHandle> {
    CURRENT_SCHEDULER.with(|current| current.borrow().clone())
}

fn replace_current(handle: Option<SchedulerHandle>) -> Option<SchedulerHandle> {
    CURRENT_SCHEDULER.with(|current| current.replace(handle))
}

/// Returns `true` if `handle`'s run loop is on the calling thread's stack.
pub(crate) fn dispatching(handle: &SchedulerHandle) -> bool {
    DISPATCHING.with(|dispatching| dispatching.borrow().as_ref() == Some(handle))
}

pub(crate) fn is_dispatching() -> bool {
    DISPATCHING.with(|dispatching| dispatching.borrow().is_some())
}

/// Restores both thread locals when the run loop exits, panics included.
struct Restore {
    current: Option<SchedulerHandle>,
    dispatching: Option<SchedulerHandle>,
}

impl Drop for Restore {
    fn drop(&mut self) {
        CURRENT_SCHEDULER.with(|current| current.replace(self.current.take()));
        DISPATCHING.with(|dispatching| dispatching.replace(self.dispatching.take()));
    }
}

/// Runs `f` with `handle` installed as the current and dispatching
/// scheduler of this thread.
///
/// The previous context is restored once `f` returns or unwinds.
pub(crate) fn enter_context<R>(handle: SchedulerHandle, f: impl FnOnce() -> R) -> R {
    let _restore = Restore {
        current: replace_current(Some(handle.clone())),
        dispatching: DISPATCHING.with(|dispatching| dispatching.replace(Some(handle))),
    };

    f()
}

/// Keeps a hijacking scheduler installed on its constructing thread.
///
/// Dropping the guard on that thread puts back whatever scheduler was
/// current before.
pub(crate) struct HijackGuard {
    thread: ThreadId,
    previous: Option<SchedulerHandle>,
}

impl HijackGuard {
    pub(crate) fn install(handle: SchedulerHandle) -> Self {
        Self {
            thread: thread::current().id(),
            previous: replace_current(Some(handle)),
        }
    }
}

impl Drop for HijackGuard {
    fn drop(&mut self) {
        if thread::current().id() != self.thread {
            warn!("hijacking scheduler dropped away from its thread");
            return;
        }

        replace_current(self.previous.take());
    }
}

/// Moves the running coroutine to another scheduler for the length of a
/// scope.
///
/// When the scope exits, by returning or by panicking, the coroutine is
/// back on the scheduler it started on. A panic is re-raised only once
/// the coroutine is home, because a coroutine cannot migrate while it
/// unwinds: the unwind is bound to the OS thread it started on.
///
/// # Examples
///
/// ```rust,ignore
/// let rows = SchedulerSwitcher::scope(Some(&blocking_pool), || query(&db));
/// // back on the calling scheduler
/// ```
pub struct SchedulerSwitcher {
    caller: Option<SchedulerHandle>,
}

impl SchedulerSwitcher {
    /// Remembers the current scheduler and, if `target` is given, switches
    /// the running coroutine to it.
    fn new(target: Option<&SchedulerHandle>) -> Self {
        let caller = current();

        if let Some(target) = target {
            target.switch_to();
        }

        Self { caller }
    }

    /// Runs `f`, on `target` if one is given, then returns to the calling
    /// scheduler even if `f` panics or switched elsewhere itself.
    ///
    /// The panic is re-raised once the coroutine is back home.
    ///
    /// # Panics
    ///
    /// Panics if a switch is needed outside of a coroutine.
    pub fn scope<R>(target: Option<&SchedulerHandle>, f: impl FnOnce() -> R) -> R {
        let switcher = Self::new(target);
        let outcome = panic::catch_unwind(AssertUnwindSafe(f));
        drop(switcher);

        match outcome {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

impl Drop for SchedulerSwitcher {
    fn drop(&mut self) {
        let Some(caller) = self.caller.take() else {
            return;
        };

        if thread::panicking() {
            warn!("not switching back to the calling scheduler while unwinding");
            return;
        }

        caller.switch_to();
    }
}

use super::context::HijackGuard;
use super::{Scheduler, SchedulerCore, SchedulerHandle};
use crate::config::Config;
use crate::coroutine::Coroutine;

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Counting semaphore idle workers sleep on.
struct Semaphore {
    permits: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self {
            permits: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.condvar.wait(&mut permits);
        }
        *permits -= 1;
    }

    fn notify(&self) {
        *self.permits.lock() += 1;
        self.condvar.notify_one();
    }
}

struct Pool {
    core: SchedulerCore,
    semaphore: Semaphore,
}

impl Scheduler for Pool {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }

    fn tickle(&self) {
        self.semaphore.notify();
    }

    fn idle(&self) {
        loop {
            if self.stopping() {
                return;
            }

            self.semaphore.wait();
            Coroutine::yield_now();
        }
    }
}

/// Scheduler running a fixed set of worker threads and no I/O.
///
/// Idle workers block until work is scheduled or a stop is requested.
/// The pool starts on construction and stops when dropped.
///
/// # Examples
///
/// ```rust,ignore
/// let pool = WorkerPool::new(4, true);
/// let answer = pool.block_on(|| 6 * 7);
/// assert_eq!(answer, 42);
/// ```
pub struct WorkerPool {
    handle: SchedulerHandle,
    _hijack: Option<HijackGuard>,
}

impl WorkerPool {
    /// Starts a pool of `threads` workers.
    ///
    /// With `use_caller` the calling thread counts as one of them: it
    /// becomes the pool's hijacked thread and runs work from
    /// [`dispatch`](SchedulerHandle::dispatch),
    /// [`block_on`](SchedulerHandle::block_on) and
    /// [`stop`](SchedulerHandle::stop).
    ///
    /// # Panics
    ///
    /// Panics if `threads == 0`.
    pub fn new(threads: usize, use_caller: bool) -> Self {
        Self::with_stack_size(threads, use_caller, Config::global().stack_size)
    }

    pub(crate) fn with_stack_size(threads: usize, use_caller: bool, stack_size: usize) -> Self {
        let pool = Arc::new(Pool {
            core: SchedulerCore::new(threads, use_caller, stack_size),
            semaphore: Semaphore::new(),
        });

        let handle = SchedulerHandle::new(pool);
        let hijack = use_caller.then(|| HijackGuard::install(handle.clone()));

        handle.start();

        Self {
            handle,
            _hijack: hijack,
        }
    }

    /// Handle to share with other threads and coroutines.
    pub fn handle(&self) -> &SchedulerHandle {
        &self.handle
    }
}

impl Default for WorkerPool {
    /// A pool sized from [`Config::global`].
    fn default() -> Self {
        let config = Config::global();
        Self::with_stack_size(config.worker_threads, config.use_caller, config.stack_size)
    }
}

impl Deref for WorkerPool {
    type Target = SchedulerHandle;

    fn deref(&self) -> &SchedulerHandle {
        &self.handle
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.handle.stop();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("core", self.handle.core())
            .finish()
    }
}

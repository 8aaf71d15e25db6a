//! Scheduler integrated with OS readiness notification.
//!
//! The [`IoManager`] is a scheduler whose idle workers block in the
//! platform readiness queue (`epoll` or `kqueue`) instead of sleeping. A
//! coroutine about to block on a non-blocking descriptor registers its
//! interest with [`IoHandle::register_event`] and yields; it is resumed
//! once the descriptor becomes ready, or once the registration is
//! cancelled.
//!
//! Every manager also owns a [`TimerManager`] whose deadlines bound how
//! long idle workers wait.

mod event;
mod poller;

pub use event::Event;

use crate::config::Config;
use crate::coroutine::Coroutine;
use crate::error::Result;
use crate::scheduler::context::HijackGuard;
use crate::scheduler::{Scheduler, SchedulerCore, SchedulerHandle, Task, Work};
use crate::timer::{Timer, TimerManager};
use event::{AsyncEvent, Waiter};
use poller::{DefaultPoller, Poller, Readiness};

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, trace};

struct IoShared {
    core: SchedulerCore,
    timers: TimerManager,
    poller: DefaultPoller,
    events: Mutex<HashMap<RawFd, AsyncEvent>>,
}

impl IoShared {
    /// Blocks in the readiness queue, retrying interrupted waits with a
    /// recomputed deadline.
    fn wait(&self, ready: &mut Vec<Readiness>, mut timeout: Option<Duration>) -> Result<()> {
        loop {
            match self.poller.wait(ready, timeout) {
                Err(error) if error.is_interrupted() => timeout = self.timers.next_timer(),
                result => return result,
            }
        }
    }

    /// Clears the kinds that fired on each ready descriptor and returns
    /// their waiters.
    fn collect(&self, ready: &mut Vec<Readiness>) -> Vec<Waiter> {
        let mut fired = Vec::new();
        let mut table = self.events.lock();

        for readiness in ready.drain(..) {
            let Some(entry) = table.get_mut(&readiness.fd) else {
                continue;
            };

            let old = entry.mask;
            let kinds = if readiness.error { old } else { readiness.events & old };
            if kinds.is_empty() {
                continue;
            }

            trace!(fd = readiness.fd, ready = ?readiness.events, error = readiness.error, registered = ?old, "descriptor ready");

            fired.extend(entry.fire(kinds));
            let new = entry.mask;
            if new.is_empty() {
                table.remove(&readiness.fd);
            }

            if let Err(error) = self.poller.arm(readiness.fd, old, new) {
                error!(fd = readiness.fd, %error, "failed to re-arm descriptor");
            }
        }

        fired
    }
}

impl Scheduler for IoShared {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }

    fn tickle(&self) {
        self.poller.tickler().tickle();
    }

    fn stopping(&self) -> bool {
        self.timers.is_empty() && self.core.stopping() && self.events.lock().is_empty()
    }

    fn idle(&self) {
        let mut ready = Vec::new();

        loop {
            let timeout = self.timers.next_timer();
            if timeout.is_none() && self.core.stopping() && self.events.lock().is_empty() {
                return;
            }

            if let Err(error) = self.wait(&mut ready, timeout) {
                panic!("readiness wait failed: {error}");
            }

            let expired = self.timers.process_timers();
            if !expired.is_empty() {
                let tasks = expired.into_iter().map(|callback| Task {
                    work: Work::callback(move || callback()),
                    thread: None,
                });
                if self.core.push_batch(tasks) && self.core.thread_count() > 1 {
                    self.tickle();
                }
            }

            for waiter in self.collect(&mut ready) {
                waiter.fire();
            }

            Coroutine::yield_now();
        }
    }
}

/// Shared handle to an [`IoManager`].
///
/// Dereferences to the manager's [`SchedulerHandle`], so every scheduling
/// operation is available on it.
#[derive(Clone)]
pub struct IoHandle {
    shared: Arc<IoShared>,
    scheduler: SchedulerHandle,
}

impl IoHandle {
    /// Type-erased handle to this manager's scheduler.
    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// The manager's timers.
    pub fn timers(&self) -> &TimerManager {
        &self.shared.timers
    }

    /// Arms a timer on this manager; see
    /// [`TimerManager::register_timer`].
    pub fn register_timer<F>(&self, delay: Duration, callback: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.timers.register_timer(delay, callback, recurring)
    }

    /// Suspends the running coroutine for `duration`; see
    /// [`sleep`](crate::sleep).
    pub fn sleep(&self, duration: Duration) {
        crate::sleep(&self.shared.timers, duration);
    }

    /// Resumes the running coroutine once `fd` is ready for any of
    /// `events`.
    ///
    /// Only the registration happens here: the caller yields afterwards
    /// and is resumed, on the scheduler it registered from, by whichever
    /// kind fires first. The other kinds are dropped at that point, so the
    /// coroutine is resumed at most once per registration.
    ///
    /// # Errors
    ///
    /// Fails if the OS rejects the descriptor; nothing is registered then.
    ///
    /// # Panics
    ///
    /// Panics outside of a coroutine, or if one of `events` is already
    /// registered on `fd`.
    pub fn register_event(&self, fd: RawFd, events: Event) -> Result<()> {
        let coroutine =
            Coroutine::current().expect("register_event without a callback needs a running coroutine");

        self.arm(fd, events, || Work::Coroutine(coroutine.clone()))
    }

    /// Schedules `callback` once `fd` is ready for any of `events`.
    ///
    /// Each registered kind fires separately, so `callback` runs once per
    /// kind that becomes ready.
    ///
    /// # Errors
    ///
    /// Fails if the OS rejects the descriptor; nothing is registered then.
    ///
    /// # Panics
    ///
    /// Panics if one of `events` is already registered on `fd`.
    pub fn register_event_with<F>(&self, fd: RawFd, events: Event, callback: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);

        self.arm(fd, events, || {
            let callback = callback.clone();
            Work::callback(move || callback())
        })
    }

    fn arm(&self, fd: RawFd, events: Event, mut work: impl FnMut() -> Work) -> Result<()> {
        assert!(fd >= 0, "invalid file descriptor {fd}");
        assert!(!events.is_empty(), "no event kind to register");

        let scheduler = SchedulerHandle::current().unwrap_or_else(|| self.scheduler.clone());

        let mut table = self.shared.events.lock();
        let old = table.get(&fd).map_or(Event::empty(), |entry| entry.mask);

        assert!(
            !old.intersects(events),
            "{:?} already registered on fd {fd}",
            old & events
        );

        self.shared.poller.arm(fd, old, old | events)?;

        let entry = table.entry(fd).or_insert_with(AsyncEvent::new);
        for kind in events.iter() {
            entry.set(
                kind,
                Waiter {
                    scheduler: scheduler.clone(),
                    work: work(),
                },
            );
        }

        Ok(())
    }

    /// Drops the interest in `events` on `fd` without running the waiters.
    ///
    /// Returns whether anything was registered.
    ///
    /// # Errors
    ///
    /// Fails if the OS rejects the update; the registration is dropped
    /// regardless.
    pub fn unregister_event(&self, fd: RawFd, events: Event) -> Result<bool> {
        let (removed, result) = self.disarm(fd, events, false);
        result.map(|()| !removed.is_empty())
    }

    /// Drops the interest in `events` on `fd` and schedules the waiters as
    /// if the events had fired.
    ///
    /// Returns whether anything was registered.
    ///
    /// # Errors
    ///
    /// Fails if the OS rejects the update; the waiters are scheduled
    /// regardless.
    pub fn cancel_event(&self, fd: RawFd, events: Event) -> Result<bool> {
        let (removed, result) = self.disarm(fd, events, true);
        let cancelled = !removed.is_empty();

        for waiter in removed {
            waiter.fire();
        }

        result.map(|()| cancelled)
    }

    fn disarm(&self, fd: RawFd, events: Event, fire: bool) -> (Vec<Waiter>, Result<()>) {
        let mut table = self.shared.events.lock();

        let Some(entry) = table.get_mut(&fd) else {
            return (Vec::new(), Ok(()));
        };

        let old = entry.mask;
        let removed = if fire { entry.fire(events) } else { entry.take(events) };
        if removed.is_empty() {
            return (removed, Ok(()));
        }

        let new = entry.mask;
        if new.is_empty() {
            table.remove(&fd);
        }

        (removed, self.shared.poller.arm(fd, old, new))
    }

    /// Kinds currently registered on `fd`.
    pub fn pending_events(&self, fd: RawFd) -> Event {
        self.shared
            .events
            .lock()
            .get(&fd)
            .map_or(Event::empty(), |entry| entry.mask)
    }
}

impl Deref for IoHandle {
    type Target = SchedulerHandle;

    fn deref(&self) -> &SchedulerHandle {
        &self.scheduler
    }
}

impl fmt::Debug for IoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoHandle")
            .field("core", &self.shared.core)
            .field("timers", &self.shared.timers)
            .field("descriptors", &self.shared.events.lock().len())
            .finish()
    }
}

/// Scheduler that also multiplexes descriptor readiness and timers.
///
/// Starts on construction and stops when dropped. Stopping waits until
/// the queue is empty, no descriptor is registered and no timer is
/// pending.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use weft::IoManager;
///
/// let manager = IoManager::new(1, true).unwrap();
/// let handle = manager.handle().clone();
///
/// manager.block_on(move || handle.sleep(Duration::from_millis(10)));
/// ```
pub struct IoManager {
    handle: IoHandle,
    _hijack: Option<HijackGuard>,
}

impl IoManager {
    /// Starts a manager with `threads` workers; see
    /// [`WorkerPool::new`](crate::WorkerPool::new) for `use_caller`.
    ///
    /// # Errors
    ///
    /// Fails if the readiness queue or its tickle pipe cannot be created.
    /// Descriptors acquired before the failure are closed.
    ///
    /// # Panics
    ///
    /// Panics if `threads == 0`.
    pub fn new(threads: usize, use_caller: bool) -> Result<Self> {
        Self::with_stack_size(threads, use_caller, Config::global().stack_size)
    }

    pub(crate) fn with_stack_size(threads: usize, use_caller: bool, stack_size: usize) -> Result<Self> {
        let core = SchedulerCore::new(threads, use_caller, stack_size);
        let poller = DefaultPoller::new()?;

        // The hook only needs the pipe, not the manager it belongs to.
        let tickler = poller.tickler().clone();
        let timers = TimerManager::with_front_hook(move || tickler.tickle());

        let shared = Arc::new(IoShared {
            core,
            timers,
            poller,
            events: Mutex::new(HashMap::new()),
        });

        let scheduler = SchedulerHandle::new(shared.clone());
        let hijack = use_caller.then(|| HijackGuard::install(scheduler.clone()));

        scheduler.start();

        Ok(Self {
            handle: IoHandle { shared, scheduler },
            _hijack: hijack,
        })
    }

    /// Handle to share with other threads and coroutines.
    pub fn handle(&self) -> &IoHandle {
        &self.handle
    }
}

impl Deref for IoManager {
    type Target = IoHandle;

    fn deref(&self) -> &IoHandle {
        &self.handle
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.handle.scheduler.stop();
    }
}

impl fmt::Debug for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IoManager").field(&self.handle).finish()
    }
}

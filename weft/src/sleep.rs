use crate::coroutine::Coroutine;
use crate::scheduler::SchedulerHandle;
use crate::timer::TimerManager;

use std::thread;
use std::time::Duration;

/// Suspends the caller for at least `duration`.
///
/// A coroutine running on a scheduler arms a one-shot timer on `timers`
/// that queues it again, then yields, leaving its thread free for other
/// work. The timer has to be serviced by someone, typically the
/// [`IoManager`](crate::IoManager) owning `timers`. Anywhere else the OS
/// thread sleeps.
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
/// manager.block_on(move || weft::sleep(handle.timers(), Duration::from_millis(5)));
/// ```
pub fn sleep(timers: &TimerManager, duration: Duration) {
    let (Some(coroutine), Some(scheduler)) = (Coroutine::current(), SchedulerHandle::current()) else {
        thread::sleep(duration);
        return;
    };

    timers.register_timer(duration, move || scheduler.schedule(coroutine.clone()), false);
    Coroutine::yield_now();
}

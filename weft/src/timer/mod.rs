//! Software timers.
//!
//! A [`TimerManager`] keeps pending timers ordered by expiry. It never runs
//! anything on its own: the owner asks how long it may sleep
//! ([`next_timer`](TimerManager::next_timer)) and collects what is due
//! ([`process_timers`](TimerManager::process_timers)). The I/O manager does
//! both from its idle loop.

mod entry;

pub use entry::TimerCallback;

use entry::{Key, TimerEntry};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

/// Monotonic clock, in microseconds.
///
/// Only differences between two readings are meaningful.
pub fn now() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();

    let micros = EPOCH.get_or_init(Instant::now).elapsed().as_micros();
    u64::try_from(micros).unwrap_or(u64::MAX)
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

type FrontHook = Box<dyn Fn() + Send + Sync + 'static>;

#[derive(Default)]
struct Timers {
    queue: BTreeMap<Key, u64>,
    entries: HashMap<u64, TimerEntry>,
    next_seq: u64,

    /// Set once the front hook fired; cleared by `next_timer`.
    tickled: bool,
}

impl Timers {
    fn key(&mut self, expiry: u64) -> Key {
        let seq = self.next_seq;
        self.next_seq += 1;
        Key { expiry, seq }
    }

    /// Inserts `entry` and reports whether the front hook should run.
    fn insert(&mut self, id: u64, entry: TimerEntry) -> bool {
        let key = entry.key;
        self.queue.insert(key, id);
        self.entries.insert(id, entry);

        let at_front = self.queue.first_key_value().is_some_and(|(first, _)| *first == key);
        let notify = at_front && !self.tickled;
        if notify {
            self.tickled = true;
        }
        notify
    }

    fn remove(&mut self, id: u64) -> Option<TimerEntry> {
        let entry = self.entries.remove(&id)?;
        self.queue.remove(&entry.key);
        Some(entry)
    }
}

struct Inner {
    timers: Mutex<Timers>,
    front_hook: Option<FrontHook>,
}

impl Inner {
    fn notify_front(&self) {
        if let Some(hook) = &self.front_hook {
            hook();
        }
    }
}

/// Ordered collection of pending timers.
///
/// Dropping the manager drops every pending timer without firing it.
pub struct TimerManager {
    inner: Arc<Inner>,
}

impl TimerManager {
    /// Creates an empty manager without a front hook.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates an empty manager that calls `hook` whenever a newly armed
    /// timer becomes the earliest one.
    ///
    /// The hook runs outside of the manager's lock. After firing once it
    /// stays quiet until the next [`next_timer`](Self::next_timer) call,
    /// since whoever is waiting will recompute its deadline anyway.
    pub fn with_front_hook<F>(hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::build(Some(Box::new(hook)))
    }

    fn build(front_hook: Option<FrontHook>) -> Self {
        Self {
            inner: Arc::new(Inner {
                timers: Mutex::new(Timers::default()),
                front_hook,
            }),
        }
    }

    /// Reads the monotonic clock, in microseconds.
    pub fn now() -> u64 {
        now()
    }

    /// Arms a timer firing `delay` from now.
    ///
    /// A recurring timer is re-armed to `now + delay` every time it fires,
    /// until it is cancelled.
    pub fn register_timer<F>(&self, delay: Duration, callback: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        let interval = micros(delay);

        let (id, notify) = {
            let mut timers = self.inner.timers.lock();
            let key = timers.key(now().saturating_add(interval));
            let id = key.seq;

            let notify = timers.insert(
                id,
                TimerEntry {
                    key,
                    interval,
                    recurring,
                    callback: Arc::new(callback),
                },
            );
            (id, notify)
        };

        trace!(id, delay_us = interval, recurring, front = notify, "timer registered");

        if notify {
            self.inner.notify_front();
        }

        Timer {
            id,
            manager: Arc::downgrade(&self.inner),
        }
    }

    /// Time left until the earliest pending timer is due, or `None` when
    /// nothing is pending.
    ///
    /// Re-enables the front hook.
    pub fn next_timer(&self) -> Option<Duration> {
        let mut timers = self.inner.timers.lock();
        timers.tickled = false;

        let (first, _) = timers.queue.first_key_value()?;
        let left = first.expiry.saturating_sub(now());
        Some(Duration::from_micros(left))
    }

    /// Returns `true` when no timer is pending.
    pub fn is_empty(&self) -> bool {
        self.inner.timers.lock().entries.is_empty()
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.inner.timers.lock().entries.len()
    }

    /// Removes every expired timer and returns their callbacks, earliest
    /// first.
    ///
    /// Recurring timers are re-armed to `now + interval` before this
    /// returns. The callbacks are meant to be invoked by the caller, after
    /// the lock is released.
    pub fn process_timers(&self) -> Vec<TimerCallback> {
        let mut timers = self.inner.timers.lock();
        let now = now();

        let mut expired = Vec::new();
        while let Some(entry) = timers.queue.first_entry() {
            if entry.key().expiry > now {
                break;
            }

            let id = entry.remove();
            let Some(mut timer) = timers.entries.remove(&id) else {
                continue;
            };

            expired.push(timer.callback.clone());

            if timer.recurring {
                timer.key = timers.key(now.saturating_add(timer.interval));
                timers.queue.insert(timer.key, id);
                timers.entries.insert(id, timer);
            }
        }

        if !expired.is_empty() {
            trace!(count = expired.len(), "timers expired");
        }

        expired
    }

    /// Runs every expired callback on the calling thread.
    pub fn execute_timers(&self) {
        for callback in self.process_timers() {
            callback();
        }
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerManager")
            .field("pending", &self.len())
            .finish()
    }
}

/// Handle to a timer armed on a [`TimerManager`].
///
/// The handle does not keep the manager alive: once the manager is gone
/// every operation reports that the timer no longer exists. Dropping the
/// handle leaves the timer armed.
#[derive(Clone)]
pub struct Timer {
    id: u64,
    manager: Weak<Inner>,
}

impl Timer {
    /// Disarms the timer.
    ///
    /// Returns `false` if it already fired (one-shot) or was cancelled,
    /// in which case its callback may already be on its way.
    pub fn cancel(&self) -> bool {
        let Some(inner) = self.manager.upgrade() else {
            return false;
        };

        let cancelled = inner.timers.lock().remove(self.id).is_some();
        trace!(id = self.id, cancelled, "timer cancel");
        cancelled
    }

    /// Re-arms a pending timer to `now + interval`.
    pub fn refresh(&self) -> bool {
        let Some(inner) = self.manager.upgrade() else {
            return false;
        };

        let mut timers = inner.timers.lock();
        let Some(mut entry) = timers.remove(self.id) else {
            return false;
        };

        entry.key = timers.key(now().saturating_add(entry.interval));
        // Moving a timer later never makes it the new front.
        timers.queue.insert(entry.key, self.id);
        timers.entries.insert(self.id, entry);
        true
    }

    /// Changes the timer's interval to `interval`.
    ///
    /// With `from_now` the new expiry is `now + interval`; otherwise it is
    /// measured from the instant the current period started.
    pub fn reset(&self, interval: Duration, from_now: bool) -> bool {
        let Some(inner) = self.manager.upgrade() else {
            return false;
        };

        let interval = micros(interval);

        let notify = {
            let mut timers = inner.timers.lock();
            match timers.entries.get(&self.id) {
                None => return false,
                Some(entry) if entry.interval == interval && !from_now => return true,
                Some(_) => {}
            }

            let Some(mut entry) = timers.remove(self.id) else {
                return false;
            };

            let start = if from_now { now() } else { entry.start() };
            entry.interval = interval;
            entry.key = timers.key(start.saturating_add(interval));
            timers.insert(self.id, entry)
        };

        if notify {
            inner.notify_front();
        }
        true
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer").field("id", &self.id).finish()
    }
}

use super::SchedulerHandle;
use crate::coroutine::Coroutine;

use std::sync::Arc;
use std::thread::{self, Thread};

use parking_lot::Mutex;

/// Whoever waits for a [`Completion`].
enum Waiter {
    /// A suspended coroutine, rescheduled on the scheduler it waited from.
    Coroutine {
        scheduler: SchedulerHandle,
        coroutine: Arc<Coroutine>,
    },

    /// A parked OS thread.
    Thread(Thread),
}

struct Slot<T> {
    value: Option<T>,
    waiter: Option<Waiter>,
}

/// One-shot hand-off of a value between two units of execution.
///
/// The waiting side suspends its coroutine when it has one, and parks its
/// thread otherwise.
pub(crate) struct Completion<T> {
    slot: Mutex<Slot<T>>,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                waiter: None,
            }),
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.slot.lock().value.is_some()
    }

    /// Stores `value` and wakes the waiter, if any.
    pub(crate) fn complete(&self, value: T) {
        let waiter = {
            let mut slot = self.slot.lock();
            slot.value = Some(value);
            slot.waiter.take()
        };

        match waiter {
            Some(Waiter::Coroutine {
                scheduler,
                coroutine,
            }) => scheduler.schedule(coroutine),
            Some(Waiter::Thread(thread)) => thread.unpark(),
            None => {}
        }
    }

    /// Blocks until the value is available and takes it.
    pub(crate) fn wait(&self) -> T {
        loop {
            let mut slot = self.slot.lock();
            if let Some(value) = slot.value.take() {
                return value;
            }

            match (Coroutine::current(), SchedulerHandle::current()) {
                (Some(coroutine), Some(scheduler)) => {
                    slot.waiter = Some(Waiter::Coroutine {
                        scheduler,
                        coroutine,
                    });
                    drop(slot);
                    Coroutine::yield_now();
                }
                _ => {
                    slot.waiter = Some(Waiter::Thread(thread::current()));
                    drop(slot);
                    thread::park();
                }
            }
        }
    }
}

//! Fan-out helpers running work concurrently on the current scheduler.
//!
//! Both helpers need a running coroutine on a scheduler to fan out from.
//! Anywhere else they run their work sequentially on the calling thread.

use super::completion::Completion;
use super::{SchedulerHandle, Work};
use crate::coroutine::{Coroutine, Panic};

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

type Slot<T> = Arc<Completion<thread::Result<T>>>;

fn fan_out_scheduler() -> Option<SchedulerHandle> {
    if Coroutine::in_coroutine() {
        SchedulerHandle::current()
    } else {
        None
    }
}

/// Starts `f` in a new coroutine on `scheduler` and returns the slot its
/// outcome lands in.
fn spawn<T, F>(scheduler: &SchedulerHandle, f: F) -> Slot<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let slot = Arc::new(Completion::new());
    let done = slot.clone();

    let coroutine = Coroutine::with_stack_size(scheduler.core().stack_size(), move || {
        done.complete(panic::catch_unwind(AssertUnwindSafe(f)));
    });
    scheduler.schedule(Work::Coroutine(coroutine));

    slot
}

/// Runs every task concurrently and returns once all of them finished.
///
/// If any task panics, the first panic (in task order) is re-raised after
/// the others completed.
///
/// # Examples
///
/// ```rust,ignore
/// parallel_do(vec![
///     Box::new(|| fetch("a")),
///     Box::new(|| fetch("b")),
/// ]);
/// ```
pub fn parallel_do(tasks: Vec<Box<dyn FnOnce() + Send + 'static>>) {
    let scheduler = match fan_out_scheduler() {
        Some(scheduler) if tasks.len() > 1 => scheduler,
        _ => {
            for task in tasks {
                task();
            }
            return;
        }
    };

    let slots: Vec<_> = tasks
        .into_iter()
        .map(|task| spawn(&scheduler, task))
        .collect();

    let mut first_panic = None;
    for slot in slots {
        if let Err(payload) = slot.wait() {
            first_panic.get_or_insert(payload);
        }
    }

    if let Some(payload) = first_panic {
        panic::resume_unwind(payload);
    }
}

/// What the calls started by [`parallel_foreach`] reported so far.
#[derive(Default)]
struct Tally {
    in_flight: usize,
    returned_false: bool,
    first_panic: Option<Panic>,
    /// The fanning-out coroutine is suspended until a call finishes.
    waiting: bool,
}

impl Tally {
    fn failed(&self) -> bool {
        self.returned_false || self.first_panic.is_some()
    }
}

/// Tally shared between the fanning-out coroutine and its calls.
struct Progress {
    tally: Mutex<Tally>,
    scheduler: SchedulerHandle,
    caller: Arc<Coroutine>,
}

impl Progress {
    /// Records the outcome of one call and wakes the caller if it waits.
    fn finish(&self, outcome: thread::Result<bool>) {
        let wake = {
            let mut tally = self.tally.lock();
            tally.in_flight -= 1;

            match outcome {
                Ok(true) => {}
                Ok(false) => tally.returned_false = true,
                Err(payload) => {
                    tally.first_panic.get_or_insert(payload);
                }
            }

            mem::take(&mut tally.waiting)
        };

        if wake {
            self.scheduler.schedule(self.caller.clone());
        }
    }

    /// Suspends the caller while `blocked` holds, re-checking every time a
    /// call finishes.
    fn wait_while(&self, blocked: impl Fn(&Tally) -> bool) {
        loop {
            {
                let mut tally = self.tally.lock();
                if !blocked(&*tally) {
                    return;
                }
                tally.waiting = true;
            }

            Coroutine::yield_now();
        }
    }
}

/// Calls `f` on every item with at most `parallelism` calls in flight.
///
/// Items are started in order; a new one starts as soon as any call in
/// flight finished. Once a call returns `false` or panics no further item
/// is started, but the calls already started still run to completion.
/// The first panic is re-raised once they did.
///
/// Returns `true` if every call returned `true`.
///
/// # Panics
///
/// Panics if `parallelism == 0`.
pub fn parallel_foreach<I, F>(items: I, f: F, parallelism: usize) -> bool
where
    I: IntoIterator,
    I::Item: Send + 'static,
    F: Fn(I::Item) -> bool + Send + Sync + 'static,
{
    assert!(parallelism > 0, "parallelism must be > 0");

    let (scheduler, caller) = match (fan_out_scheduler(), Coroutine::current()) {
        (Some(scheduler), Some(caller)) if parallelism > 1 => (scheduler, caller),
        _ => return items.into_iter().all(f),
    };

    let f = Arc::new(f);
    let progress = Arc::new(Progress {
        tally: Mutex::new(Tally::default()),
        scheduler: scheduler.clone(),
        caller,
    });

    let mut items = items.into_iter();
    loop {
        progress.wait_while(|tally| tally.in_flight == parallelism && !tally.failed());

        if progress.tally.lock().failed() {
            break;
        }
        let Some(item) = items.next() else {
            break;
        };
        progress.tally.lock().in_flight += 1;

        let f = f.clone();
        let done = progress.clone();
        let coroutine = Coroutine::with_stack_size(scheduler.core().stack_size(), move || {
            done.finish(panic::catch_unwind(AssertUnwindSafe(|| (*f)(item))));
        });
        scheduler.schedule(Work::Coroutine(coroutine));
    }

    progress.wait_while(|tally| tally.in_flight > 0);

    let (first_panic, returned_false) = {
        let mut tally = progress.tally.lock();
        (tally.first_panic.take(), tally.returned_false)
    };

    if let Some(payload) = first_panic {
        panic::resume_unwind(payload);
    }

    !returned_false
}

use super::context::enter_context;
use super::{SchedulerHandle, Work};
use crate::coroutine::{Coroutine, panic_message};

use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::Arc;
use std::thread;

use tracing::{error, trace};

/// Runs the dispatch loop of `handle` on the calling thread.
///
/// The loop pops ready work, oldest first, skipping work pinned to other
/// threads. When nothing is runnable it resumes the scheduler's idle
/// coroutine, and it returns once that coroutine finishes or `exit`
/// holds.
pub(crate) fn run(handle: &SchedulerHandle, exit: &dyn Fn() -> bool) {
    enter_context(handle.clone(), || {
        let scheduler = handle.scheduler();
        let core = scheduler.core();
        let thread = thread::current().id();
        let shared = core.thread_count() > 1;

        let mut idle: Option<Arc<Coroutine>> = None;

        loop {
            let (work, more) = core.pop(thread);

            if more && shared {
                scheduler.tickle();
            }

            if let Some(work) = work {
                execute(work);
                core.finish();

                if shared && core.stop_requested() {
                    // Idle workers re-check whether they may exit.
                    scheduler.tickle();
                }

                if exit() {
                    break;
                }
                continue;
            }

            if exit() {
                break;
            }

            let idle = idle.get_or_insert_with(|| {
                let handle = handle.clone();
                Coroutine::with_stack_size(core.stack_size(), move || handle.scheduler().idle())
            });

            if let Err(payload) = idle.resume_catching() {
                error!(panic = panic_message(&payload), "idle loop panicked");
                panic::resume_unwind(payload);
            }

            if idle.state().is_finished() {
                trace!("idle loop returned");

                // Pass the wake-up on to the next sleeping worker.
                if shared {
                    scheduler.tickle();
                }
                break;
            }
        }
    });
}

fn execute(work: Work) {
    match work {
        Work::Coroutine(coroutine) => {
            if let Err(payload) = coroutine.resume_catching() {
                error!(
                    id = coroutine.id(),
                    panic = panic_message(&payload),
                    "scheduled coroutine panicked"
                );
                coroutine.park_panic(payload);
            }
        }
        Work::Callback(callback) => {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                error!(
                    panic = panic_message(&payload),
                    "scheduled callback panicked, aborting"
                );
                process::abort();
            }
        }
    }
}

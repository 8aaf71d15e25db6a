use weft::{Coroutine, Scheduler, SchedulerCore, SchedulerHandle, State, Work, WorkerPool};

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

fn counter_work(counter: &Arc<AtomicUsize>) -> Work {
    let counter = counter.clone();
    Work::callback(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn test_block_on_returns_the_value() {
    let pool = WorkerPool::new(1, true);

    assert_eq!(pool.block_on(|| 6 * 7), 42);
}

#[test]
fn test_block_on_runs_inside_a_coroutine_on_the_pool() {
    let pool = WorkerPool::new(1, true);
    let expected = pool.handle().clone();

    let (in_coroutine, current) =
        pool.block_on(|| (Coroutine::in_coroutine(), SchedulerHandle::current()));

    assert!(in_coroutine);
    assert_eq!(current, Some(expected));
}

#[test]
fn test_block_on_reraises_a_panic() {
    let pool = WorkerPool::new(1, true);

    let result = panic::catch_unwind(AssertUnwindSafe(|| pool.block_on(|| panic!("boom"))));

    let payload = result.expect_err("the panic reaches the caller");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));

    // The pool keeps working afterwards.
    assert_eq!(pool.block_on(|| 1), 1);
}

#[test]
fn test_block_on_from_a_foreign_thread() {
    let pool = WorkerPool::new(2, false);

    let worker = pool.block_on(|| thread::current().id());

    assert_ne!(worker, thread::current().id());
    assert!(pool.worker_ids().contains(&worker));
}

#[test]
fn test_hijack_stop_drains_scheduled_work() {
    let pool = WorkerPool::new(1, true);
    let counter = Arc::new(AtomicUsize::new(0));

    let co_counter = counter.clone();
    let co = Coroutine::new(move || {
        co_counter.fetch_add(1, Ordering::SeqCst);
    });

    pool.schedule(co.clone());
    for _ in 0..9 {
        pool.schedule(counter_work(&counter));
    }

    pool.stop();

    assert_eq!(co.state(), State::Term);
    assert_eq!(counter.load(Ordering::SeqCst), 10);
}

#[test]
fn test_start_and_stop_are_idempotent() {
    for (threads, use_caller) in [(1, true), (3, true), (2, false)] {
        let pool = WorkerPool::new(threads, use_caller);
        let counter = Arc::new(AtomicUsize::new(0));

        pool.start();
        pool.start();

        for _ in 0..20 {
            pool.schedule(counter_work(&counter));
        }

        pool.stop();
        pool.stop();

        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }
}

#[test]
fn test_stop_without_any_work() {
    let pool = WorkerPool::new(4, false);
    pool.stop();
    drop(pool);
}

#[test]
fn test_pool_can_restart_after_stop() {
    let pool = WorkerPool::new(2, false);
    pool.stop();

    pool.start();
    assert_eq!(pool.block_on(|| 5), 5);
}

#[test]
fn test_hybrid_pool_runs_everything_on_its_workers() {
    let pool = WorkerPool::new(4, true);
    let seen = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..200 {
        let seen = seen.clone();
        pool.schedule(Work::callback(move || {
            seen.lock().unwrap().push(thread::current().id());
        }));
    }

    let workers = pool.worker_ids();
    pool.stop();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 200);
    assert!(seen.iter().all(|id| workers.contains(id)));

    // Only the hijacked thread is left once the spawned ones are joined.
    assert_eq!(pool.worker_ids(), [thread::current().id()]);
}

#[test]
fn test_dispatch_runs_until_the_queue_drains() {
    let pool = WorkerPool::new(1, true);
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        pool.schedule(counter_work(&counter));
    }

    // Work scheduled by work is drained as well.
    let nested = counter.clone();
    let handle = pool.handle().clone();
    pool.schedule(Work::callback(move || {
        handle.schedule(counter_work(&nested));
    }));

    pool.dispatch();

    assert_eq!(counter.load(Ordering::SeqCst), 6);
}

#[test]
#[should_panic(expected = "hijacked thread")]
fn test_dispatch_away_from_the_hijacked_thread_panics() {
    let pool = WorkerPool::new(1, false);
    pool.dispatch();
}

#[test]
fn test_schedule_on_pins_work_to_a_thread() {
    let pool = WorkerPool::new(3, true);
    let workers = pool.worker_ids();
    assert_eq!(workers.len(), 3);
    assert_eq!(workers[0], thread::current().id());

    let target = workers[2];
    let ran_on = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..10 {
        let ran_on = ran_on.clone();
        pool.schedule_on(
            Work::callback(move || ran_on.lock().unwrap().push(thread::current().id())),
            target,
        );
    }

    pool.stop();

    let ran_on = ran_on.lock().unwrap();
    assert_eq!(ran_on.len(), 10);
    assert!(ran_on.iter().all(|id| *id == target));
}

#[test]
fn test_yield_to_gives_other_work_a_turn() {
    let pool = WorkerPool::new(1, true);
    let order = Arc::new(Mutex::new(Vec::new()));

    let log = order.clone();
    pool.block_on(move || {
        let scheduler = SchedulerHandle::current().unwrap();

        let other = log.clone();
        scheduler.schedule(Coroutine::new(move || other.lock().unwrap().push("other")));

        log.lock().unwrap().push("before");
        weft::yield_to();
        log.lock().unwrap().push("after");
    });

    assert_eq!(*order.lock().unwrap(), ["before", "other", "after"]);
}

#[test]
fn test_yield_to_on_the_hijacked_thread_runs_the_queue() {
    let pool = WorkerPool::new(1, true);
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        pool.schedule(counter_work(&counter));
    }

    weft::yield_to();

    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[test]
fn test_panicking_coroutine_is_parked() {
    let pool = WorkerPool::new(1, true);

    let co = Coroutine::new(|| panic!("scheduled failure"));
    pool.schedule(co.clone());
    pool.stop();

    assert_eq!(co.state(), State::Except);

    let payload = co.take_panic().expect("the dispatcher parks the panic");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"scheduled failure"));
    assert!(co.take_panic().is_none());
}

#[test]
fn test_current_scheduler_follows_the_hijacking_pool() {
    assert!(SchedulerHandle::current().is_none());

    {
        let pool = WorkerPool::new(1, true);
        assert_eq!(SchedulerHandle::current().as_ref(), Some(pool.handle()));
    }

    assert!(SchedulerHandle::current().is_none());
}

#[test]
#[should_panic(expected = "worker_threads must be > 0")]
fn test_zero_worker_threads_panics() {
    let _pool = WorkerPool::new(0, true);
}

#[test]
fn test_builder_configures_the_pool() {
    let pool = weft::SchedulerBuilder::new()
        .worker_threads(2)
        .use_caller(false)
        .stack_size(64 * 1024)
        .build_pool();

    assert_eq!(pool.core().thread_count(), 2);
    assert_eq!(pool.core().stack_size(), 64 * 1024);
    assert!(pool.core().root_thread().is_none());
    assert_eq!(pool.block_on(|| Coroutine::current().unwrap().stack_size()), 64 * 1024);
}

/// Scheduler whose idle hook fails the way a broken readiness wait does.
struct FailingIdle {
    core: SchedulerCore,
}

impl Scheduler for FailingIdle {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }

    fn tickle(&self) {}

    fn idle(&self) {
        panic!("readiness wait failed");
    }
}

#[test]
fn test_idle_failure_is_reraised_from_the_run_loop() {
    let scheduler = SchedulerHandle::new(Arc::new(FailingIdle {
        core: SchedulerCore::new(1, true, 64 * 1024),
    }));
    scheduler.start();

    let ran = Arc::new(AtomicUsize::new(0));
    scheduler.schedule(counter_work(&ran));

    let result = panic::catch_unwind(AssertUnwindSafe(|| scheduler.dispatch()));

    // Queued work still ran before the worker went idle.
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    let payload = result.expect_err("the worker does not leave silently");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"readiness wait failed"));
}

use weft::{IoManager, TimerManager};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Services `timers` on the calling thread until `done` holds.
fn drive(timers: &TimerManager, done: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);

    while !done() {
        assert!(Instant::now() < deadline, "timers did not fire in time");

        if let Some(wait) = timers.next_timer() {
            thread::sleep(wait.min(Duration::from_millis(5)));
        }
        timers.execute_timers();
    }
}

#[test]
fn test_timers_fire_in_expiry_order() {
    let timers = TimerManager::new();
    let fired = Arc::new(Mutex::new(Vec::new()));

    for delay in [50, 10, 30] {
        let fired = fired.clone();
        timers.register_timer(
            Duration::from_millis(delay),
            move || fired.lock().unwrap().push(delay),
            false,
        );
    }

    drive(&timers, || fired.lock().unwrap().len() == 3);

    assert_eq!(*fired.lock().unwrap(), [10, 30, 50]);
    assert!(timers.is_empty());
}

#[test]
fn test_equal_expiries_fire_in_registration_order() {
    let timers = TimerManager::new();
    let fired = Arc::new(Mutex::new(Vec::new()));

    for i in 0..5 {
        let fired = fired.clone();
        timers.register_timer(Duration::ZERO, move || fired.lock().unwrap().push(i), false);
    }

    timers.execute_timers();

    assert_eq!(*fired.lock().unwrap(), [0, 1, 2, 3, 4]);
}

#[test]
fn test_next_timer() {
    let timers = TimerManager::new();
    assert_eq!(timers.next_timer(), None);

    let timer = timers.register_timer(Duration::from_millis(200), || {}, false);

    let left = timers.next_timer().unwrap();
    assert!(left <= Duration::from_millis(200));
    assert!(left > Duration::from_millis(100));

    assert!(timer.cancel());
    assert_eq!(timers.next_timer(), None);
}

#[test]
fn test_cancel_before_the_deadline_wins() {
    let timers = TimerManager::new();
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = runs.clone();
    let timer = timers.register_timer(
        Duration::from_millis(5),
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    assert!(timer.cancel());
    assert!(!timer.cancel());

    thread::sleep(Duration::from_millis(10));
    timers.execute_timers();

    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert!(timers.is_empty());
}

#[test]
fn test_cancel_after_dispatch_loses() {
    let timers = TimerManager::new();
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = runs.clone();
    let timer = timers.register_timer(
        Duration::ZERO,
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    let due = timers.process_timers();
    assert_eq!(due.len(), 1);

    // Handed out but not run yet: too late to cancel.
    assert!(!timer.cancel());

    for callback in due {
        callback();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_recurring_timer_rearms_until_cancelled() {
    let timers = TimerManager::new();
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = runs.clone();
    let timer = timers.register_timer(
        Duration::from_millis(2),
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    drive(&timers, || runs.load(Ordering::SeqCst) >= 3);
    assert_eq!(timers.len(), 1);

    assert!(timer.cancel());
    assert!(timers.is_empty());
}

#[test]
fn test_refresh_pushes_the_deadline_back() {
    let timers = TimerManager::new();
    let timer = timers.register_timer(Duration::from_millis(100), || {}, false);

    thread::sleep(Duration::from_millis(60));
    assert!(timers.next_timer().unwrap() < Duration::from_millis(60));

    assert!(timer.refresh());
    assert!(timers.next_timer().unwrap() > Duration::from_millis(60));

    assert!(timer.cancel());
    assert!(!timer.refresh());
}

#[test]
fn test_reset_changes_the_delay() {
    let timers = TimerManager::new();
    let timer = timers.register_timer(Duration::from_secs(10), || {}, false);

    assert!(timer.reset(Duration::from_millis(20), true));
    assert!(timers.next_timer().unwrap() <= Duration::from_millis(20));

    // Measured from the start of the period: already due.
    thread::sleep(Duration::from_millis(10));
    assert!(timer.reset(Duration::from_millis(5), false));
    assert_eq!(timers.next_timer(), Some(Duration::ZERO));

    assert_eq!(timers.process_timers().len(), 1);
    assert!(!timer.reset(Duration::from_millis(5), true));
}

#[test]
fn test_front_hook_fires_once_per_wait() {
    let hooks = Arc::new(AtomicUsize::new(0));
    let counter = hooks.clone();
    let timers = TimerManager::with_front_hook(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let first = timers.register_timer(Duration::from_secs(10), || {}, false);
    assert_eq!(hooks.load(Ordering::SeqCst), 1);

    // Not at the front.
    let second = timers.register_timer(Duration::from_secs(20), || {}, false);
    assert_eq!(hooks.load(Ordering::SeqCst), 1);

    // At the front, but nobody recomputed its wait since the last hook.
    let third = timers.register_timer(Duration::from_secs(5), || {}, false);
    assert_eq!(hooks.load(Ordering::SeqCst), 1);

    timers.next_timer();
    let fourth = timers.register_timer(Duration::from_secs(1), || {}, false);
    assert_eq!(hooks.load(Ordering::SeqCst), 2);

    for timer in [first, second, third, fourth] {
        assert!(timer.cancel());
    }
}

#[test]
fn test_timer_outlived_by_its_handle() {
    let timers = TimerManager::new();
    let timer = timers.register_timer(Duration::from_secs(1), || {}, false);

    drop(timers);

    assert!(!timer.cancel());
    assert!(!timer.refresh());
}

#[test]
fn test_clock_is_monotonic() {
    let before = weft::now();
    thread::sleep(Duration::from_millis(2));
    let after = TimerManager::now();

    assert!(after >= before + 2_000);
}

#[test]
fn test_sleep_outside_of_a_coroutine_blocks_the_thread() {
    let timers = TimerManager::new();
    let start = Instant::now();

    weft::sleep(&timers, Duration::from_millis(20));

    assert!(start.elapsed() >= Duration::from_millis(20));
    assert!(timers.is_empty());
}

#[test]
fn test_sleep_inside_a_coroutine() {
    let manager = IoManager::new(1, true).unwrap();
    let io = manager.handle().clone();

    let elapsed = manager.block_on(move || {
        let start = Instant::now();
        io.sleep(Duration::from_millis(30));
        start.elapsed()
    });

    assert!(elapsed >= Duration::from_millis(30));
}

#[test]
fn test_sleeping_coroutines_interleave() {
    let manager = IoManager::new(1, true).unwrap();
    let io = manager.handle().clone();
    let order = Arc::new(Mutex::new(Vec::new()));

    let log = order.clone();
    manager.block_on(move || {
        let scheduler = weft::SchedulerHandle::current().unwrap();

        for (name, delay) in [("slow", 40), ("fast", 10)] {
            let io = io.clone();
            let log = log.clone();
            scheduler.schedule(weft::Coroutine::new(move || {
                io.sleep(Duration::from_millis(delay));
                log.lock().unwrap().push(name);
            }));
        }

        io.sleep(Duration::from_millis(80));
        log.lock().unwrap().push("main");
    });

    assert_eq!(*order.lock().unwrap(), ["fast", "slow", "main"]);
}

#[test]
fn test_io_manager_runs_timer_callbacks() {
    let manager = IoManager::new(2, false).unwrap();
    let (tx, rx) = mpsc::channel();

    let tx = Mutex::new(tx);
    manager.register_timer(
        Duration::from_millis(10),
        move || {
            let _ = tx.lock().unwrap().send(thread::current().id());
        },
        false,
    );

    let worker = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(manager.worker_ids().contains(&worker));
}

#[test]
fn test_stop_waits_for_pending_timers() {
    let manager = IoManager::new(1, true).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = runs.clone();
    manager.register_timer(
        Duration::from_millis(20),
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    manager.stop();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

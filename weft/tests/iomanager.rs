use weft::{Coroutine, Event, IoManager};

use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        assert!(flags >= 0);
        assert_eq!(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK), 0);
    }
}

/// Non-blocking pipe, read end first.
fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

    nonblocking(fds[0]);
    nonblocking(fds[1]);
    (fds[0], fds[1])
}

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);

    nonblocking(fds[0]);
    nonblocking(fds[1]);
    (fds[0], fds[1])
}

fn write_byte(fd: RawFd) {
    let n = unsafe { libc::write(fd, b"x".as_ptr().cast(), 1) };
    assert_eq!(n, 1);
}

fn read_all(fd: RawFd) -> usize {
    let mut buf = [0u8; 64];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    n.max(0) as usize
}

fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

fn counting(counter: &Arc<AtomicUsize>) -> impl Fn() + Send + Sync + 'static {
    let counter = counter.clone();
    move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_read_readiness_resumes_the_coroutine() {
    let manager = IoManager::new(1, true).unwrap();
    let io = manager.handle().clone();
    let (r, w) = pipe();

    let read = manager.block_on(move || {
        io.register_event(r, Event::READ).unwrap();
        assert_eq!(io.pending_events(r), Event::READ);

        write_byte(w);
        Coroutine::yield_now();

        // Fired registrations are cleared.
        assert_eq!(io.pending_events(r), Event::empty());
        read_all(r)
    });

    assert_eq!(read, 1);
    close(r);
    close(w);
}

#[test]
fn test_readiness_fires_once_per_registration() {
    let manager = IoManager::new(1, true).unwrap();
    let io = manager.handle().clone();
    let (r, w) = pipe();
    let fired = Arc::new(AtomicUsize::new(0));

    let callback = counting(&fired);
    manager.block_on(move || {
        io.register_event_with(r, Event::READ, callback).unwrap();

        write_byte(w);
        write_byte(w);
        io.sleep(Duration::from_millis(20));

        write_byte(w);
        io.sleep(Duration::from_millis(20));
    });

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    close(r);
    close(w);
}

#[test]
fn test_cancel_event_runs_the_continuation() {
    let manager = IoManager::new(1, true).unwrap();
    let io = manager.handle().clone();
    let (r, w) = pipe();
    let fired = Arc::new(AtomicUsize::new(0));

    let callback = counting(&fired);
    let (cancelled, again) = manager.block_on(move || {
        io.register_event_with(r, Event::READ, callback).unwrap();

        let cancelled = io.cancel_event(r, Event::READ).unwrap();
        weft::yield_to();

        (cancelled, io.cancel_event(r, Event::READ).unwrap())
    });

    assert!(cancelled);
    assert!(!again);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    close(r);
    close(w);
}

#[test]
fn test_cancel_event_resumes_a_waiting_coroutine() {
    let manager = IoManager::new(1, true).unwrap();
    let io = manager.handle().clone();
    let (r, w) = pipe();

    manager.block_on(move || {
        let scheduler = weft::SchedulerHandle::current().unwrap();

        let canceller = io.clone();
        scheduler.schedule(Coroutine::new(move || {
            assert!(canceller.cancel_event(r, Event::READ).unwrap());
        }));

        // Nothing is ever written: only the cancellation can wake us.
        io.register_event(r, Event::READ).unwrap();
        Coroutine::yield_now();

        assert_eq!(io.pending_events(r), Event::empty());
    });

    close(r);
    close(w);
}

#[test]
fn test_unregister_event_drops_the_continuation() {
    let manager = IoManager::new(1, true).unwrap();
    let io = manager.handle().clone();
    let (r, w) = pipe();
    let fired = Arc::new(AtomicUsize::new(0));

    let callback = counting(&fired);
    let (removed, again) = manager.block_on(move || {
        io.register_event_with(r, Event::READ, callback).unwrap();

        let removed = io.unregister_event(r, Event::READ).unwrap();
        let again = io.unregister_event(r, Event::READ).unwrap();

        write_byte(w);
        io.sleep(Duration::from_millis(20));

        (removed, again)
    });

    assert!(removed);
    assert!(!again);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    close(r);
    close(w);
}

#[test]
fn test_disjoint_kinds_share_one_descriptor() {
    let manager = IoManager::new(1, true).unwrap();
    let io = manager.handle().clone();
    let (a, b) = socketpair();
    let reads = Arc::new(AtomicUsize::new(0));
    let writes = Arc::new(AtomicUsize::new(0));

    let on_read = counting(&reads);
    let on_write = counting(&writes);
    manager.block_on(move || {
        io.register_event_with(a, Event::READ, on_read).unwrap();
        io.register_event_with(a, Event::WRITE, on_write).unwrap();
        assert_eq!(io.pending_events(a), Event::READ | Event::WRITE);

        // The socket is writable right away; the read side stays armed.
        io.sleep(Duration::from_millis(20));
        assert_eq!(io.pending_events(a), Event::READ);

        write_byte(b);
        io.sleep(Duration::from_millis(20));
        assert_eq!(io.pending_events(a), Event::empty());
    });

    assert_eq!(reads.load(Ordering::SeqCst), 1);
    assert_eq!(writes.load(Ordering::SeqCst), 1);
    close(a);
    close(b);
}

#[test]
fn test_coroutine_waiting_on_several_kinds_resumes_once() {
    let manager = IoManager::new(1, true).unwrap();
    let io = manager.handle().clone();
    let (a, b) = socketpair();
    let resumed = Arc::new(AtomicUsize::new(0));

    let counter = resumed.clone();
    let slept = manager.block_on(move || {
        // Readable and writable at once: both kinds fire in one wait.
        write_byte(b);
        io.register_event(a, Event::READ | Event::WRITE).unwrap();
        Coroutine::yield_now();
        counter.fetch_add(1, Ordering::SeqCst);

        assert_eq!(io.pending_events(a), Event::empty());

        // A second resumption would cut this sleep short.
        let start = Instant::now();
        io.sleep(Duration::from_millis(30));
        start.elapsed()
    });

    assert_eq!(resumed.load(Ordering::SeqCst), 1);
    assert!(slept >= Duration::from_millis(30));
    close(a);
    close(b);
}

#[test]
fn test_hangup_resumes_a_coroutine_once() {
    let manager = IoManager::new(1, true).unwrap();
    let io = manager.handle().clone();
    let (r, w) = pipe();

    let slept = manager.block_on(move || {
        io.register_event(r, Event::READ | Event::CLOSE).unwrap();
        close(w);
        Coroutine::yield_now();

        assert_eq!(io.pending_events(r), Event::empty());

        let start = Instant::now();
        io.sleep(Duration::from_millis(30));
        start.elapsed()
    });

    assert!(slept >= Duration::from_millis(30));
    close(r);
}

#[test]
fn test_cancelling_one_kind_of_a_coroutine_drops_the_others() {
    let manager = IoManager::new(1, true).unwrap();
    let io = manager.handle().clone();
    let (r, w) = pipe();

    manager.block_on(move || {
        let scheduler = weft::SchedulerHandle::current().unwrap();

        let canceller = io.clone();
        scheduler.schedule(Coroutine::new(move || {
            assert!(canceller.cancel_event(r, Event::READ).unwrap());
        }));

        io.register_event(r, Event::READ | Event::CLOSE).unwrap();
        Coroutine::yield_now();

        assert_eq!(io.pending_events(r), Event::empty());
    });

    close(r);
    close(w);
}

#[test]
fn test_hangup_fires_every_registered_kind() {
    let manager = IoManager::new(1, true).unwrap();
    let io = manager.handle().clone();
    let (r, w) = pipe();
    let fired = Arc::new(AtomicUsize::new(0));

    let callback = counting(&fired);
    manager.block_on(move || {
        io.register_event_with(r, Event::READ | Event::CLOSE, callback).unwrap();

        close(w);
        io.sleep(Duration::from_millis(20));

        assert_eq!(io.pending_events(r), Event::empty());
    });

    assert_eq!(fired.load(Ordering::SeqCst), 2);
    close(r);
}

#[test]
fn test_registering_a_kind_twice_panics() {
    let manager = IoManager::new(1, true).unwrap();
    let io = manager.handle().clone();
    let (r, w) = pipe();

    manager.block_on(move || {
        io.register_event_with(r, Event::READ, || {}).unwrap();

        let duplicate =
            panic::catch_unwind(AssertUnwindSafe(|| io.register_event_with(r, Event::READ, || {})));
        assert!(duplicate.is_err());

        // The first registration is untouched.
        assert_eq!(io.pending_events(r), Event::READ);
        assert!(io.unregister_event(r, Event::READ).unwrap());
    });

    close(r);
    close(w);
}

#[test]
fn test_register_event_outside_of_a_coroutine_panics() {
    let manager = IoManager::new(1, true).unwrap();
    let (r, w) = pipe();

    let result = panic::catch_unwind(AssertUnwindSafe(|| manager.register_event(r, Event::READ)));

    assert!(result.is_err());
    assert_eq!(manager.pending_events(r), Event::empty());
    close(r);
    close(w);
}

#[test]
fn test_invalid_descriptor_is_an_os_error() {
    let manager = IoManager::new(1, true).unwrap();
    let bogus = RawFd::MAX;

    let error = manager
        .register_event_with(bogus, Event::READ, || {})
        .expect_err("unknown descriptors are rejected");

    assert!(matches!(error, weft::Error::Os { .. }));
    assert_eq!(manager.pending_events(bogus), Event::empty());
}

#[test]
fn test_readiness_across_worker_threads() {
    let manager = IoManager::new(3, false).unwrap();
    let io = manager.handle().clone();
    let fired = Arc::new(AtomicUsize::new(0));

    let pipes: Vec<_> = (0..8).map(|_| pipe()).collect();
    let ends = pipes.clone();

    let counter = fired.clone();
    manager.block_on(move || {
        let scheduler = weft::SchedulerHandle::current().unwrap();

        for &(r, _) in &ends {
            let io = io.clone();
            let counter = counter.clone();
            scheduler.schedule(Coroutine::new(move || {
                io.register_event(r, Event::READ).unwrap();
                Coroutine::yield_now();
                assert_eq!(read_all(r), 1);
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // Give every reader a chance to register before writing.
        io.sleep(Duration::from_millis(20));
        for &(_, w) in &ends {
            write_byte(w);
        }
    });

    drop(manager);

    assert_eq!(fired.load(Ordering::SeqCst), 8);
    for (r, w) in pipes {
        close(r);
        close(w);
    }
}

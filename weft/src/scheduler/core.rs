use crate::coroutine::Coroutine;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;

/// A unit of ready work.
///
/// Coroutines are resumed; callbacks are invoked directly on the worker
/// thread, without a coroutine of their own.
pub enum Work {
    Coroutine(Arc<Coroutine>),
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

impl Work {
    /// Wraps a plain callable.
    ///
    /// A callback must not panic: it runs on the worker's own stack, and a
    /// panic escaping it aborts the process.
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Work::Callback(Box::new(f))
    }
}

impl From<Arc<Coroutine>> for Work {
    fn from(coroutine: Arc<Coroutine>) -> Self {
        Work::Coroutine(coroutine)
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Work::Coroutine(coroutine) => f.debug_tuple("Coroutine").field(coroutine).finish(),
            Work::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Queued work, optionally pinned to one worker thread.
pub(crate) struct Task {
    pub(crate) work: Work,
    pub(crate) thread: Option<ThreadId>,
}

#[derive(Default)]
struct Lifecycle {
    running: bool,
    threads: Vec<JoinHandle<()>>,
}

/// State shared by every scheduler implementation: the run queue, the
/// worker threads and the stop protocol.
///
/// Concrete schedulers embed one and expose it through
/// [`Scheduler::core`](super::Scheduler::core).
pub struct SchedulerCore {
    queue: Mutex<VecDeque<Task>>,

    /// Workers currently running a task (not idling).
    active: AtomicUsize,

    stop_requested: AtomicBool,

    /// The hijacked thread is inside `dispatch` and wants to return once
    /// the queue drains.
    draining: AtomicBool,

    thread_count: usize,

    /// Hijacked constructing thread, if any.
    root: Option<ThreadId>,

    /// Spawned worker threads, recorded at spawn time.
    workers: Mutex<Vec<ThreadId>>,

    stack_size: usize,
    lifecycle: Mutex<Lifecycle>,
}

impl SchedulerCore {
    /// Creates the shared state of a scheduler running `threads` workers.
    ///
    /// With `use_caller`, the calling thread is hijacked as one of the
    /// workers and only `threads - 1` threads are spawned.
    ///
    /// # Panics
    ///
    /// Panics if `threads == 0`.
    pub fn new(threads: usize, use_caller: bool, stack_size: usize) -> Self {
        assert!(threads > 0, "worker_threads must be > 0");

        Self {
            queue: Mutex::new(VecDeque::new()),
            active: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            thread_count: threads,
            root: use_caller.then(|| thread::current().id()),
            workers: Mutex::new(Vec::with_capacity(threads)),
            stack_size,
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Total number of workers, the hijacked thread included.
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Stack size of the coroutines this scheduler creates itself.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// The hijacked thread, if the scheduler was built with `use_caller`.
    pub fn root_thread(&self) -> Option<ThreadId> {
        self.root
    }

    pub(crate) fn on_root(&self) -> bool {
        self.root == Some(thread::current().id())
    }

    /// Ids of the worker threads, the hijacked one first.
    pub fn worker_ids(&self) -> Vec<ThreadId> {
        self.root
            .into_iter()
            .chain(self.workers.lock().iter().copied())
            .collect()
    }

    /// Whether the run loop on the calling thread may exit: a stop was
    /// requested (or the hijacked thread is draining), nothing is queued
    /// and no worker is busy.
    pub fn stopping(&self) -> bool {
        let queue = self.queue.lock();

        let requested = self.stop_requested.load(Ordering::Acquire)
            || (self.draining.load(Ordering::Acquire) && self.on_root());

        requested && queue.is_empty() && self.active.load(Ordering::Acquire) == 0
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Appends `task` to the run queue.
    ///
    /// Returns `true` when the queue was empty, in which case an idle
    /// worker has to be tickled.
    pub(crate) fn push(&self, task: Task) -> bool {
        debug_assert!(
            task.thread.is_none_or(|id| self.worker_ids().contains(&id)),
            "work pinned to a thread that is not one of the scheduler's workers"
        );

        let mut queue = self.queue.lock();
        let was_empty = queue.is_empty();
        queue.push_back(task);
        was_empty
    }

    pub(crate) fn push_batch(&self, tasks: impl IntoIterator<Item = Task>) -> bool {
        let mut queue = self.queue.lock();
        let was_empty = queue.is_empty();
        queue.extend(tasks);
        was_empty && !queue.is_empty()
    }

    /// Takes the first task runnable on `thread` and marks the worker busy.
    ///
    /// The second value tells whether other work remains queued, which
    /// means another worker should be woken.
    pub(crate) fn pop(&self, thread: ThreadId) -> (Option<Work>, bool) {
        let mut queue = self.queue.lock();

        let position = queue
            .iter()
            .position(|task| task.thread.is_none_or(|id| id == thread));

        let work = position.and_then(|index| queue.remove(index)).map(|task| {
            self.active.fetch_add(1, Ordering::AcqRel);
            task.work
        });

        (work, !queue.is_empty())
    }

    pub(crate) fn finish(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn is_queue_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub(crate) fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::Release);
    }

    /// Marks the scheduler running and returns how many threads must be
    /// spawned, or `None` if it already runs.
    pub(crate) fn begin_start(&self) -> Option<usize> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.running {
            return None;
        }

        lifecycle.running = true;
        self.stop_requested.store(false, Ordering::Release);

        Some(self.thread_count - usize::from(self.root.is_some()))
    }

    pub(crate) fn add_thread(&self, handle: JoinHandle<()>) {
        self.workers.lock().push(handle.thread().id());
        self.lifecycle.lock().threads.push(handle);
    }

    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    /// Hands out the spawned threads for joining.
    pub(crate) fn take_threads(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.lifecycle.lock().threads)
    }

    /// Records that every spawned worker has been joined.
    pub(crate) fn mark_stopped(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.threads.is_empty() {
            lifecycle.running = false;
            self.workers.lock().clear();
        }
    }
}

impl fmt::Debug for SchedulerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerCore")
            .field("thread_count", &self.thread_count)
            .field("root", &self.root)
            .field("queued", &self.queue.lock().len())
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("stop_requested", &self.stop_requested())
            .finish()
    }
}

use super::state::{EXCEPT, EXECUTING, HOLD, READY, State, TERM};
use crate::config::{Config, MIN_STACK_SIZE};

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread;

use generator::{Generator, Gn};
use parking_lot::Mutex;

/// Payload of a panic that escaped a coroutine's entry function.
pub type Panic = Box<dyn Any + Send + 'static>;

type Entry = Generator<'static, (), ()>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Coroutines currently resumed on this thread, innermost last.
    ///
    /// Pushed by [`Coroutine::resume`] and popped when control comes back,
    /// so "who resumed whom" is tracked here rather than by the
    /// coroutines themselves.
    static CALL_STACK: RefCell<Vec<Arc<Coroutine>>> = const { RefCell::new(Vec::new()) };
}

/// A stackful, cooperatively scheduled unit of execution.
///
/// A coroutine owns a machine stack and an entry function. It runs only
/// while somebody [resumes](Coroutine::resume) it, and gives control back
/// either by calling [`Coroutine::yield_now`] or by returning.
///
/// Coroutines are shared through `Arc`: the scheduler, an I/O registration
/// or a timer each hold a handle while they may resume it. The stack is
/// released when the last handle goes away.
///
/// # Examples
///
/// ```rust,ignore
/// let co = Coroutine::new(|| {
///     println!("first half");
///     Coroutine::yield_now();
///     println!("second half");
/// });
///
/// co.resume();
/// assert_eq!(co.state(), State::Hold);
/// co.resume();
/// assert_eq!(co.state(), State::Term);
/// ```
pub struct Coroutine {
    id: u64,
    state: AtomicU8,
    stack_size: usize,

    /// The suspended machine context.
    ///
    /// Locked by the resumer for as long as the coroutine runs, which makes
    /// a second resumer wait until the first one got control back.
    entry: Mutex<Entry>,

    /// Panic captured by a resumer that could not re-raise it.
    panic: Mutex<Option<Panic>>,
}

impl Coroutine {
    /// Creates a coroutine in [`State::Init`] with the configured default
    /// stack size.
    pub fn new<F>(entry: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(Config::global().stack_size, entry)
    }

    /// Creates a coroutine with a stack of `stack_size` bytes.
    ///
    /// Sizes below [`MIN_STACK_SIZE`] are rounded up.
    pub fn with_stack_size<F>(stack_size: usize, entry: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack_size = stack_size.max(MIN_STACK_SIZE);

        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(State::Init.into_raw()),
            stack_size,
            entry: Mutex::new(Gn::<()>::new_opt(stack_words(stack_size), entry)),
            panic: Mutex::new(None),
        })
    }

    /// Unique identifier of this coroutine.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        State::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Size of the machine stack, in bytes.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Returns the coroutine running on the calling thread, if any.
    pub fn current() -> Option<Arc<Coroutine>> {
        CALL_STACK.with(|stack| stack.borrow().last().cloned())
    }

    /// Returns `true` if the calling thread is running inside a coroutine.
    pub fn in_coroutine() -> bool {
        CALL_STACK.with(|stack| !stack.borrow().is_empty())
    }

    /// Runs the coroutine until it yields or finishes.
    ///
    /// # Panics
    ///
    /// Panics if the coroutine is not in [`State::Init`], [`State::Ready`]
    /// or [`State::Hold`], or if it is already running on this thread.
    /// A panic raised by the entry function leaves the coroutine in
    /// [`State::Except`] and is re-raised here.
    pub fn resume(self: &Arc<Self>) {
        if let Err(payload) = self.resume_catching() {
            panic::resume_unwind(payload);
        }
    }

    /// Resumes the coroutine, returning an escaped panic instead of
    /// re-raising it.
    pub(crate) fn resume_catching(self: &Arc<Self>) -> thread::Result<()> {
        assert!(
            !self.on_call_stack(),
            "coroutine {} cannot resume itself or one of its resumers",
            self.id
        );

        let mut entry = self.entry.lock();

        let previous = self.state();
        assert!(
            previous.is_resumable(),
            "cannot resume coroutine {} in state {:?}",
            self.id,
            previous
        );
        self.set_state(State::Executing);

        let outcome = {
            let _frame = Frame::push(self.clone());
            panic::catch_unwind(AssertUnwindSafe(|| {
                entry.resume();
            }))
        };

        match outcome {
            Ok(()) if entry.is_done() => {
                self.set_state(State::Term);
                Ok(())
            }
            Ok(()) => {
                // Rescheduled before yielding: it is already READY.
                let _ = self.state.compare_exchange(
                    EXECUTING,
                    HOLD,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                Ok(())
            }
            Err(payload) => {
                self.set_state(State::Except);
                Err(payload)
            }
        }
    }

    /// Gives control back to whoever resumed the running coroutine.
    ///
    /// Unless somebody schedules it in the meantime, the coroutine is left
    /// in [`State::Hold`].
    ///
    /// # Panics
    ///
    /// Panics when called outside of a coroutine.
    pub fn yield_now() {
        assert!(
            Self::in_coroutine(),
            "Coroutine::yield_now called outside of a coroutine"
        );

        generator::yield_with(());
    }

    /// Re-initialises a finished (or never started) coroutine with a new
    /// entry function, reusing its stack where possible.
    ///
    /// # Panics
    ///
    /// Panics if the coroutine is running, scheduled or suspended.
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let state = self.state();
        assert!(
            matches!(state, State::Init | State::Term | State::Except),
            "cannot reset coroutine {} in state {:?}",
            self.id,
            state
        );

        let mut current = self.entry.lock();
        if state == State::Term && current.is_done() {
            current.init_code(entry);
        } else {
            *current = Gn::<()>::new_opt(stack_words(self.stack_size), entry);
        }

        self.panic.lock().take();
        self.set_state(State::Init);
    }

    /// Takes the panic parked by a resumer that could not re-raise it.
    ///
    /// The dispatcher parks panics here when a scheduled coroutine ends in
    /// [`State::Except`]; the payload is handed out exactly once.
    pub fn take_panic(&self) -> Option<Panic> {
        self.panic.lock().take()
    }

    pub(crate) fn park_panic(&self, payload: Panic) {
        *self.panic.lock() = Some(payload);
    }

    /// Marks a suspended or running coroutine as queued.
    ///
    /// A coroutine that has never run stays in [`State::Init`].
    pub(crate) fn mark_ready(&self) {
        let _ = self
            .state
            .compare_exchange(HOLD, READY, Ordering::AcqRel, Ordering::Acquire)
            .or_else(|_| {
                self.state
                    .compare_exchange(EXECUTING, READY, Ordering::AcqRel, Ordering::Acquire)
            });
    }

    fn set_state(&self, state: State) {
        self.state.store(state.into_raw(), Ordering::Release);
    }

    fn on_call_stack(self: &Arc<Self>) -> bool {
        CALL_STACK.with(|stack| stack.borrow().iter().any(|co| Arc::ptr_eq(co, self)))
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        let state = self.state.load(Ordering::Acquire);
        if state == EXCEPT || state == TERM {
            return;
        }

        tracing::trace!(id = self.id, state = ?State::from_raw(state), "dropping unfinished coroutine");
    }
}

/// Entry of the per-thread call stack, popped on every exit path.
struct Frame;

impl Frame {
    fn push(coroutine: Arc<Coroutine>) -> Self {
        CALL_STACK.with(|stack| stack.borrow_mut().push(coroutine));
        Frame
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        CALL_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Converts a stack size in bytes to the even word count the generator
/// expects (an odd count switches on stack-usage tracking).
fn stack_words(bytes: usize) -> usize {
    (bytes / mem::size_of::<usize>()) & !1
}

/// Coroutine has been created (or reset) and never resumed.
pub(crate) const INIT: u8 = 0;

/// Coroutine is running on some thread.
///
/// At most one coroutine per thread observes this state at a time.
pub(crate) const EXECUTING: u8 = 1;

/// Coroutine sits in a run queue, waiting to be resumed.
pub(crate) const READY: u8 = 2;

/// Coroutine is suspended and nobody has scheduled it yet.
pub(crate) const HOLD: u8 = 3;

/// Entry function returned normally.
pub(crate) const TERM: u8 = 4;

/// Entry function panicked.
pub(crate) const EXCEPT: u8 = 5;

/// Lifecycle state of a [`Coroutine`](super::Coroutine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Created with an entry function, never resumed.
    Init,
    /// Currently running.
    Executing,
    /// Scheduled, not running yet.
    Ready,
    /// Suspended, waiting for whoever holds it to resume or schedule it.
    Hold,
    /// Finished normally.
    Term,
    /// Finished by panicking.
    Except,
}

impl State {
    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            INIT => State::Init,
            EXECUTING => State::Executing,
            READY => State::Ready,
            HOLD => State::Hold,
            TERM => State::Term,
            EXCEPT => State::Except,
            _ => unreachable!("invalid coroutine state {raw}"),
        }
    }

    pub(crate) fn into_raw(self) -> u8 {
        match self {
            State::Init => INIT,
            State::Executing => EXECUTING,
            State::Ready => READY,
            State::Hold => HOLD,
            State::Term => TERM,
            State::Except => EXCEPT,
        }
    }

    /// Whether a coroutine in this state may be resumed.
    pub fn is_resumable(self) -> bool {
        matches!(self, State::Init | State::Ready | State::Hold)
    }

    /// Whether the entry function has finished, one way or the other.
    pub fn is_finished(self) -> bool {
        matches!(self, State::Term | State::Except)
    }
}

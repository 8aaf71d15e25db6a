use std::sync::Arc;

/// Callback run when a timer expires.
///
/// Shared rather than boxed: a recurring timer hands out the same callback
/// every period.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Position of a timer in the expiry order.
///
/// Keys compare by expiry first and by insertion sequence second, so two
/// timers due at the same microsecond fire in the order they were armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Key {
    /// Absolute expiry on the [`now`](super::now) clock, in microseconds.
    pub(crate) expiry: u64,
    pub(crate) seq: u64,
}

/// A pending timer as stored by its manager.
pub(crate) struct TimerEntry {
    pub(crate) key: Key,

    /// Delay the timer was armed with, in microseconds.
    pub(crate) interval: u64,

    pub(crate) recurring: bool,
    pub(crate) callback: TimerCallback,
}

impl TimerEntry {
    /// Instant the current period started at.
    pub(crate) fn start(&self) -> u64 {
        self.key.expiry.saturating_sub(self.interval)
    }
}

//! Platform-specific readiness queues.
//!
//! Both backends are edge-triggered and expose the same [`Poller`]
//! interface to the I/O manager. The concrete implementation is selected
//! at compile time depending on the target operating system.

use super::Event;
use crate::error::Result;

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;

pub(crate) mod unix;

#[cfg(target_os = "linux")]
pub(crate) type DefaultPoller = epoll::EpollPoller;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) type DefaultPoller = kqueue::KqueuePoller;

/// One descriptor reported ready by [`Poller::wait`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness {
    pub(crate) fd: RawFd,
    pub(crate) events: Event,

    /// Error or hang-up condition on the descriptor.
    pub(crate) error: bool,
}

/// Edge-triggered readiness queue.
pub(crate) trait Poller: Send + Sync + Sized {
    /// Creates the queue and registers the tickle pipe in it.
    fn new() -> Result<Self>;

    /// Pipe used to interrupt [`wait`](Self::wait) from another thread.
    ///
    /// Shared so the timer front hook can wake waiters without holding on
    /// to the poller.
    fn tickler(&self) -> &Arc<Tickler>;

    /// Moves the interest on `fd` from `old` to `new`.
    ///
    /// An empty `old` adds the descriptor, an empty `new` removes it.
    fn arm(&self, fd: RawFd, old: Event, new: Event) -> Result<()>;

    /// Blocks until a descriptor is ready, the tickle pipe is written to,
    /// or `timeout` elapses, and appends what became ready to `ready`.
    fn wait(&self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> Result<()>;
}

/// Self-pipe waking threads blocked in [`Poller::wait`].
///
/// The read end is registered level-triggered and one byte is consumed per
/// wake-up, so every tickle wakes one waiter.
pub(crate) struct Tickler {
    reader: OwnedFd,
    writer: OwnedFd,
}

impl Tickler {
    pub(crate) fn new() -> Result<Self> {
        let (reader, writer) = unix::pipe()?;
        Ok(Self { reader, writer })
    }

    pub(crate) fn reader(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    pub(crate) fn tickle(&self) {
        match unix::write_byte(self.writer.as_raw_fd()) {
            Ok(()) => trace!("tickled"),
            // A full pipe wakes a waiter just as well.
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
            Err(error) => warn!(%error, "failed to tickle"),
        }
    }

    pub(crate) fn consume(&self) {
        match unix::read_byte(self.reader()) {
            Ok(true) => trace!("received tickle"),
            Ok(false) => {}
            Err(error) => warn!(%error, "failed to drain tickle pipe"),
        }
    }
}

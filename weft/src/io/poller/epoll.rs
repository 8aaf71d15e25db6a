//! Linux `epoll` backend.
//!
//! Descriptors are registered edge-triggered with their whole interest
//! mask in one `epoll_event`; the tickle pipe is the only level-triggered
//! entry.

use super::unix::{is_already_removed, timeout_ms};
use super::{Poller, Readiness, Tickler};
use crate::error::{Error, Result};
use crate::io::Event;

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLET, EPOLLHUP,
    EPOLLIN, EPOLLOUT, EPOLLRDHUP, c_int, epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

/// Token of the tickle pipe; descriptors use their own value as token.
const TICKLE_TOKEN: u64 = u64::MAX;

/// Events fetched per `epoll_wait` call.
const MAX_EVENTS: usize = 64;

/// Linux `epoll` poller.
pub(crate) struct EpollPoller {
    epoll: OwnedFd,
    tickler: Arc<Tickler>,
}

fn interest(events: Event) -> u32 {
    let mut flags = EPOLLET;

    if events.contains(Event::READ) {
        flags |= EPOLLIN;
    }
    if events.contains(Event::WRITE) {
        flags |= EPOLLOUT;
    }
    if events.contains(Event::CLOSE) {
        flags |= EPOLLRDHUP;
    }

    flags as u32
}

fn op_name(op: c_int) -> &'static str {
    match op {
        EPOLL_CTL_ADD => "EPOLL_CTL_ADD",
        EPOLL_CTL_MOD => "EPOLL_CTL_MOD",
        _ => "EPOLL_CTL_DEL",
    }
}

impl EpollPoller {
    fn ctl(&self, op: c_int, fd: RawFd, mut event: epoll_event) -> io::Result<()> {
        let rc = unsafe { epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

impl Poller for EpollPoller {
    fn new() -> Result<Self> {
        let raw = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if raw < 0 {
            return Err(Error::last_os("epoll_create1"));
        }
        let epoll = unsafe { OwnedFd::from_raw_fd(raw) };

        let poller = Self {
            epoll,
            tickler: Arc::new(Tickler::new()?),
        };

        let event = epoll_event {
            events: EPOLLIN as u32,
            u64: TICKLE_TOKEN,
        };
        poller
            .ctl(EPOLL_CTL_ADD, poller.tickler.reader(), event)
            .map_err(|source| Error::Os {
                call: "epoll_ctl",
                source,
            })?;

        Ok(poller)
    }

    fn tickler(&self) -> &Arc<Tickler> {
        &self.tickler
    }

    fn arm(&self, fd: RawFd, old: Event, new: Event) -> Result<()> {
        let op = if new.is_empty() {
            EPOLL_CTL_DEL
        } else if old.is_empty() {
            EPOLL_CTL_ADD
        } else {
            EPOLL_CTL_MOD
        };

        let event = epoll_event {
            events: interest(new),
            u64: fd as u64,
        };

        let result = self.ctl(op, fd, event);
        trace!(fd, op = op_name(op), events = ?new, ok = result.is_ok(), "epoll_ctl");

        match result {
            Ok(()) => Ok(()),
            Err(error) if op == EPOLL_CTL_DEL && is_already_removed(&error) => Ok(()),
            Err(source) => Err(Error::Os {
                call: "epoll_ctl",
                source,
            }),
        }
    }

    fn wait(&self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> Result<()> {
        let mut events: [epoll_event; MAX_EVENTS] = unsafe { mem::zeroed() };
        let timeout = timeout_ms(timeout);

        let n = unsafe {
            epoll_wait(
                self.epoll.as_raw_fd(),
                events.as_mut_ptr(),
                MAX_EVENTS as c_int,
                timeout,
            )
        };

        if n < 0 {
            return Err(Error::last_os("epoll_wait"));
        }
        trace!(timeout, ready = n, "epoll_wait");

        for event in &events[..n as usize] {
            // `epoll_event` is packed: copy the fields out.
            let token = event.u64;
            let flags = event.events;

            if token == TICKLE_TOKEN {
                self.tickler.consume();
                continue;
            }

            let mut fired = Event::empty();
            if flags & (EPOLLIN as u32) != 0 {
                fired |= Event::READ;
            }
            if flags & (EPOLLOUT as u32) != 0 {
                fired |= Event::WRITE;
            }
            if flags & (EPOLLRDHUP as u32) != 0 {
                fired |= Event::CLOSE;
            }

            ready.push(Readiness {
                fd: token as RawFd,
                events: fired,
                error: flags & ((EPOLLERR | EPOLLHUP) as u32) != 0,
            });
        }

        Ok(())
    }
}

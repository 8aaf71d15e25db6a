//! BSD / macOS `kqueue` backend.
//!
//! `READ` and `CLOSE` share the read filter (a peer close shows up as
//! `EV_EOF` on it); `WRITE` uses the write filter. Filters are registered
//! with `EV_CLEAR` for edge-triggered delivery, except for the tickle pipe.

use super::unix::is_already_removed;
use super::{Poller, Readiness, Tickler};
use crate::error::{Error, Result};
use crate::io::Event;

use libc::{
    EV_ADD, EV_CLEAR, EV_DELETE, EV_EOF, EV_ERROR, EVFILT_READ, EVFILT_WRITE, c_int, kevent,
    kqueue, timespec,
};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

/// Events fetched per `kevent` call.
const MAX_EVENTS: usize = 64;

/// `kqueue` poller.
pub(crate) struct KqueuePoller {
    kqueue: OwnedFd,
    tickler: Arc<Tickler>,
}

fn change(fd: RawFd, filter: i16, flags: u16) -> kevent {
    let mut event: kevent = unsafe { mem::zeroed() };
    event.ident = fd as usize;
    event.filter = filter;
    event.flags = flags;
    event
}

fn reads(events: Event) -> bool {
    events.intersects(Event::READ | Event::CLOSE)
}

fn writes(events: Event) -> bool {
    events.contains(Event::WRITE)
}

impl KqueuePoller {
    fn submit(&self, changes: &[kevent]) -> io::Result<()> {
        let rc = unsafe {
            kevent(
                self.kqueue.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as c_int,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

impl Poller for KqueuePoller {
    fn new() -> Result<Self> {
        let raw = unsafe { kqueue() };
        if raw < 0 {
            return Err(Error::last_os("kqueue"));
        }
        let kqueue = unsafe { OwnedFd::from_raw_fd(raw) };

        let poller = Self {
            kqueue,
            tickler: Arc::new(Tickler::new()?),
        };

        poller
            .submit(&[change(poller.tickler.reader(), EVFILT_READ, EV_ADD)])
            .map_err(|source| Error::Os {
                call: "kevent",
                source,
            })?;

        Ok(poller)
    }

    fn tickler(&self) -> &Arc<Tickler> {
        &self.tickler
    }

    fn arm(&self, fd: RawFd, old: Event, new: Event) -> Result<()> {
        let mut changes = Vec::with_capacity(2);
        let mut removing = false;

        match (reads(old), reads(new)) {
            (false, true) => changes.push(change(fd, EVFILT_READ, EV_ADD | EV_CLEAR)),
            (true, false) => {
                changes.push(change(fd, EVFILT_READ, EV_DELETE));
                removing = true;
            }
            _ => {}
        }

        match (writes(old), writes(new)) {
            (false, true) => changes.push(change(fd, EVFILT_WRITE, EV_ADD | EV_CLEAR)),
            (true, false) => {
                changes.push(change(fd, EVFILT_WRITE, EV_DELETE));
                removing = true;
            }
            _ => {}
        }

        if changes.is_empty() {
            return Ok(());
        }

        let result = self.submit(&changes);
        trace!(fd, old = ?old, new = ?new, ok = result.is_ok(), "kevent");

        match result {
            Ok(()) => Ok(()),
            Err(error) if removing && is_already_removed(&error) => Ok(()),
            Err(source) => Err(Error::Os {
                call: "kevent",
                source,
            }),
        }
    }

    fn wait(&self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> Result<()> {
        let mut events: [kevent; MAX_EVENTS] = unsafe { mem::zeroed() };

        let deadline = timeout.map(|timeout| timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        });

        let n = unsafe {
            kevent(
                self.kqueue.as_raw_fd(),
                ptr::null(),
                0,
                events.as_mut_ptr(),
                MAX_EVENTS as c_int,
                deadline.as_ref().map_or(ptr::null(), |deadline| deadline as *const timespec),
            )
        };

        if n < 0 {
            return Err(Error::last_os("kevent"));
        }
        trace!(?timeout, ready = n, "kevent wait");

        for event in &events[..n as usize] {
            let fd = event.ident as RawFd;

            if fd == self.tickler.reader() && event.filter == EVFILT_READ {
                self.tickler.consume();
                continue;
            }

            let mut fired = Event::empty();
            if event.filter == EVFILT_READ {
                fired |= Event::READ;
            }
            if event.filter == EVFILT_WRITE {
                fired |= Event::WRITE;
            }
            if event.flags & EV_EOF != 0 {
                fired |= Event::CLOSE;
            }

            ready.push(Readiness {
                fd,
                events: fired,
                error: event.flags & EV_ERROR != 0,
            });
        }

        Ok(())
    }
}

use crate::scheduler::{SchedulerHandle, Work};

use std::sync::Arc;

use bitflags::bitflags;

bitflags! {
    /// Readiness kinds a descriptor can be watched for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Event: u8 {
        /// Data can be read.
        const READ = 0b001;
        /// Data can be written.
        const WRITE = 0b010;
        /// The peer closed its end.
        const CLOSE = 0b100;
    }
}

/// Continuation to run when an event fires, and where to run it.
pub(crate) struct Waiter {
    pub(crate) scheduler: SchedulerHandle,
    pub(crate) work: Work,
}

impl Waiter {
    pub(crate) fn fire(self) {
        self.scheduler.schedule(self.work);
    }

    /// Whether both waiters resume the same coroutine.
    fn same_coroutine(&self, other: &Waiter) -> bool {
        match (&self.work, &other.work) {
            (Work::Coroutine(a), Work::Coroutine(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Interest registered on one descriptor.
///
/// `mask` always holds exactly the kinds that have a waiter.
pub(crate) struct AsyncEvent {
    pub(crate) mask: Event,
    read: Option<Waiter>,
    write: Option<Waiter>,
    close: Option<Waiter>,
}

impl AsyncEvent {
    pub(crate) fn new() -> Self {
        Self {
            mask: Event::empty(),
            read: None,
            write: None,
            close: None,
        }
    }

    fn slot(&mut self, kind: Event) -> &mut Option<Waiter> {
        if kind == Event::READ {
            &mut self.read
        } else if kind == Event::WRITE {
            &mut self.write
        } else {
            &mut self.close
        }
    }

    /// Installs `waiter` for the single kind `kind`.
    pub(crate) fn set(&mut self, kind: Event, waiter: Waiter) {
        debug_assert!(!self.mask.intersects(kind));

        *self.slot(kind) = Some(waiter);
        self.mask |= kind;
    }

    /// Clears the registered kinds among `kinds` and hands out their
    /// waiters.
    pub(crate) fn take(&mut self, kinds: Event) -> Vec<Waiter> {
        let kinds = kinds & self.mask;
        self.mask.remove(kinds);

        kinds
            .iter()
            .filter_map(|kind| self.slot(kind).take())
            .collect()
    }

    /// Clears the registered kinds among `kinds` and hands out the waiters
    /// to run.
    ///
    /// A coroutine is handed out once even when it waits on several kinds,
    /// and its kinds that did not fire are cleared too.
    pub(crate) fn fire(&mut self, kinds: Event) -> Vec<Waiter> {
        let mut fired: Vec<Waiter> = Vec::new();
        for waiter in self.take(kinds) {
            if !fired.iter().any(|other| other.same_coroutine(&waiter)) {
                fired.push(waiter);
            }
        }

        let remaining = self.mask;
        for kind in remaining.iter() {
            let resumed = self
                .slot(kind)
                .as_ref()
                .is_some_and(|waiter| fired.iter().any(|other| other.same_coroutine(waiter)));

            if resumed {
                self.slot(kind).take();
                self.mask.remove(kind);
            }
        }

        fired
    }
}

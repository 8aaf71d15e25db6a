//! # Weft
//!
//! **Weft** is a cooperative, multi-threaded coroutine engine. Many
//! stackful coroutines are multiplexed over a small pool of OS threads,
//! and blocking-style code on non-blocking descriptors is turned into
//! "register interest, yield, get resumed" by an I/O manager built on
//! edge-triggered `epoll` (Linux) or `kqueue` (macOS / BSD).
//!
//! The engine is made of a few layered pieces:
//!
//! - [`Coroutine`]: a stackful unit of execution with explicit resume and
//!   yield, and a small state machine
//! - [`TimerManager`]: ordered one-shot and recurring timers on a
//!   monotonic microsecond clock
//! - [`WorkerPool`]: a FIFO scheduler over a fixed set of worker threads,
//!   optionally hijacking the constructing thread
//! - [`IoManager`]: a scheduler whose idle workers wait for descriptor
//!   readiness and timer deadlines
//! - [`SchedulerSwitcher`]: moves the running coroutine between schedulers
//!   and back
//!
//! There is no preemption: a coroutine keeps its thread until it yields,
//! waits for an event, or returns.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! #[weft::main]
//! fn main() {
//!     let scheduler = weft::SchedulerHandle::current().unwrap();
//!
//!     scheduler.schedule(weft::Coroutine::new(|| println!("from a coroutine")));
//!     weft::yield_to();
//! }
//! ```
//!
//! ## Configuration
//!
//! Defaults come from [`Config::from_env`]: `WEFT_WORKER_THREADS`,
//! `WEFT_USE_CALLER` and `WEFT_STACK_SIZE`. [`SchedulerBuilder`] overrides
//! them per scheduler.

mod config;
mod coroutine;
mod error;
mod io;
mod scheduler;
mod sleep;
mod timer;

pub use config::Config;
pub use coroutine::{Coroutine, Panic, State};
pub use error::{Error, Result};
pub use io::{Event, IoHandle, IoManager};
pub use scheduler::{
    Scheduler, SchedulerBuilder, SchedulerCore, SchedulerHandle, SchedulerSwitcher, Work,
    WorkerPool, parallel_do, parallel_foreach, yield_to,
};
pub use sleep::sleep;
pub use timer::{Timer, TimerCallback, TimerManager, now};

pub use weft_macros::*;

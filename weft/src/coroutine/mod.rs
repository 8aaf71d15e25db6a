//! Stackful coroutines.
//!
//! A [`Coroutine`] is the unit of execution everything else in the crate
//! schedules. It knows nothing about schedulers: it can be resumed by hand,
//! by a worker thread's dispatch loop, or by another coroutine.

mod core;
mod state;

pub use self::core::{Coroutine, Panic};
pub use state::State;

pub(crate) fn panic_message(payload: &Panic) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "Box<dyn Any>"
    }
}

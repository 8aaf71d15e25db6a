use std::io;

use thiserror::Error;

/// Errors surfaced by the engine.
///
/// Only conditions the caller can act on are represented here. Misuse of
/// the scheduling primitives (resuming a running coroutine, registering the
/// same event kind twice, ...) is a bug in the caller and panics instead.
#[derive(Debug, Error)]
pub enum Error {
    /// An OS call backing the engine failed.
    #[error("{call} failed: {source}")]
    Os {
        /// Name of the failing system call.
        call: &'static str,
        #[source]
        source: io::Error,
    },

    /// A configuration value read from the environment could not be parsed.
    #[error("invalid value for {key}: {value:?}")]
    Config { key: &'static str, value: String },
}

impl Error {
    /// Captures `errno` for the system call that just failed.
    pub(crate) fn last_os(call: &'static str) -> Self {
        Error::Os {
            call,
            source: io::Error::last_os_error(),
        }
    }

    /// Returns `true` if this error wraps an `EINTR` from the OS.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Os { source, .. } if source.kind() == io::ErrorKind::Interrupted)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

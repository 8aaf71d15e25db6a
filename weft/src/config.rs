//! Engine configuration.
//!
//! Values default to a single hijacked worker and a 128 KiB coroutine
//! stack. Each of them can be overridden from the environment:
//!
//! | variable              | field            |
//! |-----------------------|------------------|
//! | `WEFT_WORKER_THREADS` | `worker_threads` |
//! | `WEFT_USE_CALLER`     | `use_caller`     |
//! | `WEFT_STACK_SIZE`     | `stack_size`     |

use crate::error::{Error, Result};

use std::env;
use std::str::FromStr;
use std::sync::OnceLock;

use tracing::warn;

/// Default machine stack size of a coroutine, in bytes.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Smallest stack size accepted; anything lower is rounded up.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

const WORKER_THREADS: &str = "WEFT_WORKER_THREADS";
const USE_CALLER: &str = "WEFT_USE_CALLER";
const STACK_SIZE: &str = "WEFT_STACK_SIZE";

static GLOBAL: OnceLock<Config> = OnceLock::new();

/// Tunables shared by schedulers and coroutines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Total number of worker threads, the hijacked caller included.
    pub worker_threads: usize,

    /// Whether the constructing thread serves as one of the workers.
    pub use_caller: bool,

    /// Machine stack size of new coroutines, in bytes.
    pub stack_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_threads: 1,
            use_caller: true,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl Config {
    /// Builds a configuration from the defaults overridden by the
    /// `WEFT_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is set but cannot be parsed,
    /// or if `WEFT_WORKER_THREADS` is zero.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(n) = read_var::<usize>(WORKER_THREADS)? {
            if n == 0 {
                return Err(Error::Config {
                    key: WORKER_THREADS,
                    value: n.to_string(),
                });
            }
            config.worker_threads = n;
        }

        if let Some(use_caller) = read_bool(USE_CALLER)? {
            config.use_caller = use_caller;
        }

        if let Some(size) = read_var::<usize>(STACK_SIZE)? {
            config.stack_size = size.max(MIN_STACK_SIZE);
        }

        Ok(config)
    }

    /// Process-wide configuration, loaded from the environment on first use.
    ///
    /// An unparsable environment is logged and replaced by the defaults.
    pub fn global() -> &'static Config {
        GLOBAL.get_or_init(|| {
            Self::from_env().unwrap_or_else(|error| {
                warn!(%error, "ignoring environment configuration");
                Self::default()
            })
        })
    }
}

fn read_var<T: FromStr>(key: &'static str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config { key, value }),
        Err(_) => Ok(None),
    }
}

fn read_bool(key: &'static str) -> Result<Option<bool>> {
    let Ok(value) = env::var(key) else {
        return Ok(None);
    };

    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(Error::Config { key, value }),
    }
}

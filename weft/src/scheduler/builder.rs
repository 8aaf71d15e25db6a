use super::WorkerPool;
use crate::config::{Config, MIN_STACK_SIZE};
use crate::error::Result;
use crate::io::IoManager;

/// Builder for configuring and creating a scheduler.
///
/// Defaults come from [`Config::global`], which reads the `WEFT_*`
/// environment variables once per process.
///
/// # Examples
///
/// ```rust,ignore
/// let manager = SchedulerBuilder::new()
///     .worker_threads(4)
///     .use_caller(false)
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct SchedulerBuilder {
    worker_threads: usize,
    use_caller: bool,
    stack_size: usize,
}

impl SchedulerBuilder {
    /// Creates a builder seeded from the process configuration.
    pub fn new() -> Self {
        Self::from_config(Config::global())
    }

    /// Creates a builder seeded from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            worker_threads: config.worker_threads,
            use_caller: config.use_caller,
            stack_size: config.stack_size,
        }
    }

    /// Sets the total number of worker threads, the hijacked caller
    /// included.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn worker_threads(mut self, n: usize) -> Self {
        assert!(n > 0, "worker_threads must be > 0");

        self.worker_threads = n;
        self
    }

    /// Whether the building thread is hijacked as one of the workers.
    pub fn use_caller(mut self, use_caller: bool) -> Self {
        self.use_caller = use_caller;
        self
    }

    /// Stack size, in bytes, of the coroutines the scheduler creates.
    ///
    /// Values below [`MIN_STACK_SIZE`] are rounded up.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes.max(MIN_STACK_SIZE);
        self
    }

    /// Builds and starts an [`IoManager`].
    ///
    /// # Errors
    ///
    /// Fails if the OS refuses the readiness queue or the wake-up pipe.
    pub fn build(self) -> Result<IoManager> {
        IoManager::with_stack_size(self.worker_threads, self.use_caller, self.stack_size)
    }

    /// Builds and starts a [`WorkerPool`].
    pub fn build_pool(self) -> WorkerPool {
        WorkerPool::with_stack_size(self.worker_threads, self.use_caller, self.stack_size)
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

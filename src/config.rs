use crate::backend::Backend;
use std::num::NonZeroUsize;
use thiserror::Error;

/// Configuration entry-point for instantiating the runtime.
///
/// A concrete `Config` binds a specific accelerator [`Backend`] to the
/// runtime, fixing both the completion event type and the kernel submission
/// context via the associated types on `Backend`.
pub trait Config: Sized + 'static {
    /// The backend kernels and host calls are dispatched to.
    type Backend: Backend;
}

/// Error returned by [`RuntimeConfig::validate`].
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// `workers` is zero.
    #[error("worker count must be non-zero")]
    NoWorkers,
    /// `hazard_shards` is not a power of two.
    #[error("hazard shard count {0} is not a power of two")]
    ShardCount(usize),
    /// `split_grain` is zero.
    #[error("range split grain must be non-zero")]
    ZeroGrain,
}

/// Tunables for the scheduler, the hazard tracker and the completion
/// reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Number of hazard shards. Must be a power of two.
    pub hazard_shards: usize,
    /// Upper bound on the number of polls a reconciler skips after a scan
    /// that made no progress.
    pub backoff_cap: u32,
    /// Minimum number of elements each half of a split range must keep.
    pub split_grain: usize,
    /// Prefix of worker thread names, followed by the worker index.
    pub thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            hazard_shards: 256,
            backoff_cap: 64,
            split_grain: 1024,
            thread_name: "dagrt-worker".to_owned(),
        }
    }
}

impl RuntimeConfig {
    /// Set the number of worker threads.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the number of hazard shards.
    #[must_use]
    pub fn with_hazard_shards(mut self, shards: usize) -> Self {
        self.hazard_shards = shards;
        self
    }

    /// Set the reconciler's maximum poll skip.
    #[must_use]
    pub fn with_backoff_cap(mut self, cap: u32) -> Self {
        self.backoff_cap = cap;
        self
    }

    /// Set the minimum size of a split range half.
    #[must_use]
    pub fn with_split_grain(mut self, grain: usize) -> Self {
        self.split_grain = grain;
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// # Errors
    /// If any tunable is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if !self.hazard_shards.is_power_of_two() {
            return Err(ConfigError::ShardCount(self.hazard_shards));
        }
        if self.split_grain == 0 {
            return Err(ConfigError::ZeroGrain);
        }
        Ok(())
    }
}

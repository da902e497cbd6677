use crate::{
    config::{Config, ConfigError, RuntimeConfig},
    graph::TaskGraph,
    hazard::HazardTracker,
    scheduler::{Scheduler, SchedulerError, SchedulerStats},
};
use derive_more::Debug;
use thiserror::Error;

/// Error returned by [`Runtime::new`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// [`RuntimeConfig::validate`] rejected the configuration.
    #[error("invalid runtime configuration")]
    Config(#[from] ConfigError),
    /// A worker thread could not be started.
    #[error("failed to start scheduler")]
    Scheduler(#[from] SchedulerError),
}

/// A scheduler and the hazard tracker every graph built on it shares.
#[derive(Debug)]
pub struct Runtime<C: Config> {
    config: RuntimeConfig,
    tracker: HazardTracker<C>,
    scheduler: Scheduler<C>,
}

impl<C: Config> Runtime<C> {
    /// # Errors
    /// If `config` is invalid or the worker threads cannot be started.
    pub fn new(backend: C::Backend, config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let tracker = HazardTracker::new(config.hazard_shards);
        let scheduler = Scheduler::new(backend, &config)?;
        Ok(Self {
            config,
            tracker,
            scheduler,
        })
    }

    /// Start building a graph generation.
    pub fn graph(&self) -> TaskGraph<'_, C> {
        TaskGraph::new(&self.scheduler, &self.tracker)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn tracker(&self) -> &HazardTracker<C> {
        &self.tracker
    }

    pub fn scheduler(&self) -> &Scheduler<C> {
        &self.scheduler
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Stop the workers. See [`Scheduler::shutdown`].
    pub fn shutdown(mut self) -> SchedulerStats {
        self.scheduler.shutdown();
        self.scheduler.stats()
    }
}

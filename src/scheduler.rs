mod reconcile;

use crate::{
    config::{Config, RuntimeConfig},
    node::{Job, NodeHandle},
    scheduler::reconcile::Reconciler,
};
use crossbeam_deque::{Injector, Steal, Stealer, Worker as LocalQueue};
use crossbeam_utils::{Backoff, CachePadded};
use derive_more::Debug;
use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// Error returned by [`Scheduler::new`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SchedulerError {
    /// The OS refused to start a worker thread.
    #[error("failed to spawn worker thread {index}")]
    Spawn {
        index: usize,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Default)]
struct WorkerCounters {
    executed: AtomicU64,
    steals: AtomicU64,
    splits: AtomicU64,
    panicked: AtomicU64,
}

/// Snapshot of scheduler activity, summed over all workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Jobs run, including split-off range pieces.
    pub executed: u64,
    /// Jobs taken from another worker's queue.
    pub steals: u64,
    /// Range jobs split in two.
    pub splits: u64,
    /// Jobs whose work panicked.
    pub panicked: u64,
}

#[derive(Debug)]
struct Inner<C: Config> {
    #[debug(skip)]
    backend: C::Backend,
    #[debug(skip)]
    injector: Injector<Job<C>>,
    #[debug(skip)]
    stealers: Vec<Stealer<Job<C>>>,
    running: AtomicBool,
    counters: Box<[CachePadded<WorkerCounters>]>,
    grain: usize,
}

/// Fixed pool of workers, each with its own deque, stealing when idle.
///
/// Workers pop from their own end of the local deque and steal from the
/// opposite end of their peers'. Completion handles produced by jobs are
/// polled by the running worker's reconciler; successors they release are
/// pushed onto that worker's deque.
#[derive(Debug)]
pub struct Scheduler<C: Config> {
    inner: Arc<Inner<C>>,
    workers: Vec<JoinHandle<()>>,
}

struct WorkerLoop<C: Config> {
    index: usize,
    local: LocalQueue<Job<C>>,
    inner: Arc<Inner<C>>,
    reconciler: Reconciler<C>,
}

impl<C: Config> Scheduler<C> {
    /// Start `config.workers` worker threads.
    ///
    /// # Errors
    /// If a worker thread cannot be spawned. Workers started before the
    /// failure are stopped and joined.
    pub fn new(backend: C::Backend, config: &RuntimeConfig) -> Result<Self, SchedulerError> {
        let queues: Vec<_> = (0..config.workers).map(|_| LocalQueue::new_lifo()).collect();
        let inner = Arc::new(Inner {
            backend,
            injector: Injector::new(),
            stealers: queues.iter().map(LocalQueue::stealer).collect(),
            running: AtomicBool::new(true),
            counters: (0..config.workers)
                .map(|_| CachePadded::new(WorkerCounters::default()))
                .collect(),
            grain: config.split_grain,
        });

        let mut scheduler = Self {
            inner: inner.clone(),
            workers: Vec::with_capacity(config.workers),
        };
        for (index, local) in queues.into_iter().enumerate() {
            let worker = WorkerLoop {
                index,
                local,
                inner: inner.clone(),
                reconciler: Reconciler::new(config.backoff_cap),
            };
            let spawned = thread::Builder::new()
                .name(format!("{}-{index}", config.thread_name))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => scheduler.workers.push(handle),
                Err(source) => {
                    scheduler.shutdown();
                    return Err(SchedulerError::Spawn { index, source });
                }
            }
        }
        debug!(workers = config.workers, "scheduler started");
        Ok(scheduler)
    }

    pub fn backend(&self) -> &C::Backend {
        &self.inner.backend
    }

    pub fn worker_count(&self) -> usize {
        self.inner.stealers.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner
            .counters
            .iter()
            .fold(SchedulerStats::default(), |acc, c| SchedulerStats {
                executed: acc.executed + c.executed.load(Ordering::Relaxed),
                steals: acc.steals + c.steals.load(Ordering::Relaxed),
                splits: acc.splits + c.splits.load(Ordering::Relaxed),
                panicked: acc.panicked + c.panicked.load(Ordering::Relaxed),
            })
    }

    /// Queue a claimed, ready node from outside the pool.
    pub(crate) fn submit(&self, node: NodeHandle<C>) {
        self.inner.injector.push(node.into_job(self.inner.grain));
    }

    /// Stop and join every worker. Idempotent.
    ///
    /// Workers first wait out the completion handles they are still
    /// watching. Jobs still queued afterwards, including nodes released by
    /// those completions, are retired without running: their nodes complete
    /// so every outstanding [`GraphCompletion`](crate::graph::GraphCompletion)
    /// fires, but their work is dropped. Wait for graphs before shutting down
    /// to have all work run.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.inner.running.store(false, Ordering::Release);
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("scheduler worker terminated abnormally");
            }
        }
        let injector = &self.inner.injector;
        let grain = self.inner.grain;
        let mut retired = 0usize;
        loop {
            match injector.steal() {
                Steal::Success(job) => {
                    retire(job, &mut |ready| injector.push(ready.into_job(grain)));
                    retired += 1;
                }
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        if retired > 0 {
            warn!(retired, "retired submitted jobs without running them");
        }
        debug!(stats = ?self.stats(), "scheduler stopped");
    }
}

impl<C: Config> Drop for Scheduler<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Drop a job's work unrun and complete its part of the node.
fn retire<C: Config>(job: Job<C>, ready: &mut impl FnMut(NodeHandle<C>)) {
    let node = job.node().clone();
    drop(job);
    node.finish_part(ready);
}

impl<C: Config> WorkerLoop<C> {
    fn run(mut self) {
        let backoff = Backoff::new();
        while self.inner.running.load(Ordering::Acquire) {
            self.reconcile();
            match self.find_job() {
                Some(job) => {
                    backoff.reset();
                    self.dispatch(job);
                }
                None => backoff.snooze(),
            }
        }

        let Self {
            index,
            local,
            inner,
            reconciler,
        } = &mut self;
        let grain = inner.grain;
        if !reconciler.is_empty() {
            debug!(
                worker = *index,
                pending = reconciler.len(),
                "waiting for outstanding completions"
            );
        }
        let drained = reconciler.drain(&mut |node| local.push(node.into_job(grain)));
        let mut retired = 0usize;
        while let Some(job) = local.pop() {
            retire(job, &mut |ready| local.push(ready.into_job(grain)));
            retired += 1;
        }
        if retired > 0 {
            warn!(worker = *index, retired, "retired queued jobs without running them");
        }
        trace!(worker = *index, drained, "worker exited");
    }

    fn counters(&self) -> &WorkerCounters {
        &self.inner.counters[self.index]
    }

    fn reconcile(&mut self) {
        let Self {
            local,
            inner,
            reconciler,
            ..
        } = self;
        let grain = inner.grain;
        reconciler.poll(&mut |node| local.push(node.into_job(grain)));
    }

    /// Own deque first, then the injector, then peers starting after
    /// ourselves.
    fn find_job(&self) -> Option<Job<C>> {
        if let Some(job) = self.local.pop() {
            return Some(job);
        }
        let peers = self.inner.stealers.len();
        loop {
            let mut retry = false;
            match self.inner.injector.steal_batch_and_pop(&self.local) {
                Steal::Success(job) => return Some(job),
                Steal::Retry => retry = true,
                Steal::Empty => {}
            }
            for offset in 1..peers {
                let victim = (self.index + offset) % peers;
                match self.inner.stealers[victim].steal() {
                    Steal::Success(job) => {
                        self.counters().steals.fetch_add(1, Ordering::Relaxed);
                        return Some(job);
                    }
                    Steal::Retry => retry = true,
                    Steal::Empty => {}
                }
            }
            if !retry {
                return None;
            }
        }
    }

    fn dispatch(&mut self, job: Job<C>) {
        if self.local.is_empty() {
            if let Some(piece) = job.try_split() {
                self.counters().splits.fetch_add(1, Ordering::Relaxed);
                trace!(worker = self.index, "split range job");
                self.local.push(piece);
            }
        }
        let node = job.node().clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| job.run(&self.inner.backend)));
        self.counters().executed.fetch_add(1, Ordering::Relaxed);
        let grain = self.inner.grain;
        let local = &self.local;
        match outcome {
            Ok(Some(event)) => self.reconciler.track(event, node),
            Ok(None) => node.finish_part(&mut |ready| local.push(ready.into_job(grain))),
            Err(_) => {
                self.counters().panicked.fetch_add(1, Ordering::Relaxed);
                error!(worker = self.index, "task work panicked; releasing its successors");
                node.finish_part(&mut |ready| local.push(ready.into_job(grain)));
            }
        }
    }
}

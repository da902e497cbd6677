use crate::{
    backend::CompletionEvent,
    config::Config,
    hazard::HazardTracker,
    node::NodeHandle,
    scheduler::Scheduler,
    sync::{AtomicBool, AtomicUsize, Ordering},
    task::{TaskMetadata, Work},
    types::{Address, IndexSet},
};
use core::mem;
use derive_more::Debug;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxBuildHasher;
use std::sync::Arc;
use tracing::{debug, warn};

/// Bookkeeping shared by every node of one graph generation.
///
/// `remaining` starts at one for the builder itself so that nodes finishing
/// early (edges into a still-running earlier generation) cannot fire the
/// signal while the generation is still being built.
#[derive(Debug)]
pub(crate) struct Generation {
    armed: AtomicBool,
    remaining: AtomicUsize,
    nodes: AtomicUsize,
    done: Mutex<bool>,
    cond: Condvar,
}

impl Generation {
    pub(crate) fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            remaining: AtomicUsize::new(1),
            nodes: AtomicUsize::new(0),
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn register(&self) {
        self.remaining.fetch_add(1, Ordering::Relaxed);
        self.nodes.fetch_add(1, Ordering::Relaxed);
    }

    /// Allow nodes of this generation to be dispatched as they become ready.
    pub(crate) fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    pub(crate) fn node_finished(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut done = self.done.lock();
            *done = true;
            self.cond.notify_all();
        }
    }

    fn is_done(&self) -> bool {
        *self.done.lock()
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }
}

/// Aggregate completion signal of one graph generation.
///
/// Fires once every node submitted by the matching [`TaskGraph::execute`]
/// call, and every range piece split off them, has completed.
#[derive(Debug, Clone)]
pub struct GraphCompletion(Arc<Generation>);

impl GraphCompletion {
    /// Number of nodes in the generation.
    pub fn node_count(&self) -> usize {
        self.0.nodes.load(Ordering::Relaxed)
    }
}

impl CompletionEvent for GraphCompletion {
    fn is_complete(&self) -> bool {
        self.0.is_done()
    }

    /// Blocks until the generation drains. Nodes still queued when the
    /// scheduler shuts down are retired without running, so this returns
    /// after shutdown too.
    fn wait(&self) {
        self.0.wait();
    }
}

/// Builder for one generation of the task graph.
///
/// Nodes added through the `add_*` methods are wired immediately but none of
/// them runs before [`TaskGraph::execute`]. After `execute` the builder starts
/// a fresh generation and may be reused.
#[derive(Debug)]
pub struct TaskGraph<'rt, C: Config> {
    scheduler: &'rt Scheduler<C>,
    tracker: &'rt HazardTracker<C>,
    generation: Arc<Generation>,
    nodes: Vec<NodeHandle<C>>,
}

impl<'rt, C: Config> TaskGraph<'rt, C> {
    pub fn new(scheduler: &'rt Scheduler<C>, tracker: &'rt HazardTracker<C>) -> Self {
        Self {
            scheduler,
            tracker,
            generation: Arc::new(Generation::new()),
            nodes: Vec::new(),
        }
    }

    /// Nodes added since the last `execute`.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a node ordered only by explicit predecessors.
    pub fn add_node(&mut self, work: Work<C>, deps: &[NodeHandle<C>]) -> NodeHandle<C> {
        self.add_node_with_access(work, &[], &[], deps)
    }

    /// Add a node ordered after every earlier conflicting access to `reads`
    /// and `writes`, and after `deps`.
    ///
    /// An address present in both sets is tracked as a write.
    pub fn add_node_with_access(
        &mut self,
        work: Work<C>,
        reads: &[Address],
        writes: &[Address],
        deps: &[NodeHandle<C>],
    ) -> NodeHandle<C> {
        let node = self.create(work, None);
        self.wire(&node, reads, writes, deps);
        node
    }

    /// Like [`TaskGraph::add_node_with_access`], carrying a profiling record.
    ///
    /// `fallback_work` is the work that runs.
    pub fn add_task(
        &mut self,
        metadata: TaskMetadata,
        reads: &[Address],
        writes: &[Address],
        fallback_work: Work<C>,
        deps: &[NodeHandle<C>],
    ) -> NodeHandle<C> {
        let node = self.create(fallback_work, Some(metadata));
        self.wire(&node, reads, writes, deps);
        node
    }

    /// Submit every ready node of the current generation and return its
    /// aggregate completion signal.
    ///
    /// Nodes still waiting on predecessors are dispatched by whichever worker
    /// completes their last predecessor.
    pub fn execute(&mut self) -> GraphCompletion {
        self.submit()
    }

    fn submit(&mut self) -> GraphCompletion {
        let generation = mem::replace(&mut self.generation, Arc::new(Generation::new()));
        let nodes = mem::take(&mut self.nodes);
        generation.arm();
        let mut roots = 0usize;
        for node in &nodes {
            if node.in_degree() == 0 && node.try_claim() {
                self.scheduler.submit(node.clone());
                roots += 1;
            }
        }
        debug!(nodes = nodes.len(), roots, "graph generation submitted");
        generation.node_finished();
        GraphCompletion(generation)
    }

    fn create(&mut self, work: Work<C>, metadata: Option<TaskMetadata>) -> NodeHandle<C> {
        self.generation.register();
        let node = NodeHandle::new(work, self.generation.clone(), metadata);
        self.nodes.push(node.clone());
        node
    }

    fn wire(
        &self,
        node: &NodeHandle<C>,
        reads: &[Address],
        writes: &[Address],
        deps: &[NodeHandle<C>],
    ) {
        let mut write_set = IndexSet::with_capacity_and_hasher(writes.len(), FxBuildHasher);
        write_set.extend(writes.iter().copied());
        let mut read_set = IndexSet::with_capacity_and_hasher(reads.len(), FxBuildHasher);
        read_set.extend(reads.iter().copied().filter(|addr| !write_set.contains(addr)));

        for &address in &read_set {
            self.tracker.resolve(node, address, false);
        }
        for &address in &write_set {
            self.tracker.resolve(node, address, true);
        }
        for dep in deps {
            self.tracker.add_dependency(dep, node);
        }
    }
}

/// Unexecuted nodes are already visible to the hazard tracker, so later
/// generations may depend on them. They are submitted with their work
/// replaced by no-ops: they still wait for their own predecessors and then
/// release their successors.
impl<C: Config> Drop for TaskGraph<'_, C> {
    fn drop(&mut self) {
        if self.nodes.is_empty() {
            return;
        }
        warn!(
            nodes = self.nodes.len(),
            "task graph dropped with unexecuted nodes; discarding their work"
        );
        for node in &self.nodes {
            node.discard_work();
        }
        self.submit();
    }
}

use crate::{
    backend::{Backend, Kernel},
    config::Config,
    graph::Generation,
    shared::{Counted, RefCounted, Shared},
    sync::*,
    task::{RangeBody, TaskMetadata, Work},
    types::{Event, SyncUnsafeCell},
    utils::RangeCursor,
};
use core::{fmt, marker::PhantomData, ptr, ptr::NonNull};
use std::sync::Arc;

struct Link<T: RefCounted> {
    target: Shared<T>,
    next: *mut Link<T>,
}

/// Prepend-only, lock-free stack of counted handles that can be sealed once.
///
/// Any number of threads may push concurrently. Sealing atomically takes the
/// whole list and makes every later push fail, so a producer racing with the
/// owner's completion either lands in the list the owner walks, or learns
/// that the owner has already finished. Links are never unlinked while the
/// list is open, so the CAS loop is free of ABA.
pub(crate) struct SuccessorList<T: RefCounted> {
    head: AtomicPtr<Link<T>>,
    _marker: PhantomData<Shared<T>>,
}

#[inline]
fn sealed<T: RefCounted>() -> *mut Link<T> {
    NonNull::dangling().as_ptr()
}

impl<T: RefCounted> SuccessorList<T> {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// Push `target`, handing it back if the list was already sealed.
    pub(crate) fn push(&self, target: Shared<T>) -> Result<(), Shared<T>> {
        let link = Box::into_raw(Box::new(Link {
            target,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head == sealed() {
                // SAFETY: `link` was never published.
                let link = unsafe { Box::from_raw(link) };
                return Err(link.target);
            }
            // SAFETY: `link` is still exclusively ours until the CAS succeeds.
            unsafe { (*link).next = head };
            match self
                .head
                .compare_exchange_weak(head, link, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(observed) => head = observed,
            }
        }
    }

    /// Close the list and take everything pushed so far, newest first.
    ///
    /// # Panics
    /// If the list was already sealed.
    pub(crate) fn seal(&self) -> Drain<T> {
        let head = self.head.swap(sealed(), Ordering::AcqRel);
        assert!(head != sealed(), "SuccessorList::seal: [1]");
        Drain { cursor: head }
    }

    pub(crate) fn is_sealed(&self) -> bool {
        self.head.load(Ordering::Acquire) == sealed()
    }
}

impl<T: RefCounted> Drop for SuccessorList<T> {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Acquire);
        if head != sealed() {
            drop(Drain { cursor: head });
        }
    }
}

/// Owning iterator over a sealed successor chain.
pub(crate) struct Drain<T: RefCounted> {
    cursor: *mut Link<T>,
}

impl<T: RefCounted> Iterator for Drain<T> {
    type Item = Shared<T>;

    fn next(&mut self) -> Option<Shared<T>> {
        if self.cursor.is_null() {
            return None;
        }
        // SAFETY: links reachable from a taken head are owned by this drain.
        let link = unsafe { Box::from_raw(self.cursor) };
        self.cursor = link.next;
        Some(link.target)
    }
}

impl<T: RefCounted> Drop for Drain<T> {
    fn drop(&mut self) {
        for _ in self.by_ref() {}
    }
}

/// A schedulable unit of the task graph.
pub(crate) struct Node<C: Config> {
    /// Taken exactly once, by the thread that wins `dispatched`.
    work: SyncUnsafeCell<Option<Work<C>>>,
    /// Unresolved predecessor edges.
    in_degree: AtomicUsize,
    successors: SuccessorList<Counted<Node<C>>>,
    dispatched: AtomicBool,
    /// Outstanding pieces of this node: the original job plus every range
    /// piece split off it, each of which may be waiting on its own event.
    parts: AtomicUsize,
    generation: Arc<Generation>,
    metadata: Option<TaskMetadata>,
}

/// Shared handle to a graph node.
///
/// Returned by every `add_*` call on [`crate::graph::TaskGraph`] and accepted
/// as an explicit predecessor by later ones.
pub struct NodeHandle<C: Config>(Shared<Counted<Node<C>>>);

impl<C: Config> Clone for NodeHandle<C> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<C: Config> fmt::Debug for NodeHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("in_degree", &self.in_degree())
            .field("complete", &self.is_complete())
            .field("metadata", &self.0.metadata)
            .finish_non_exhaustive()
    }
}

impl<C: Config> NodeHandle<C> {
    pub(crate) fn new(
        work: Work<C>,
        generation: Arc<Generation>,
        metadata: Option<TaskMetadata>,
    ) -> Self {
        Self(Shared::new(Counted::new(Node {
            work: SyncUnsafeCell::new(Some(work)),
            in_degree: AtomicUsize::new(0),
            successors: SuccessorList::new(),
            dispatched: AtomicBool::new(false),
            parts: AtomicUsize::new(1),
            generation,
            metadata,
        })))
    }

    /// Number of predecessor edges that have not completed yet.
    pub fn in_degree(&self) -> usize {
        self.0.in_degree.load(Ordering::SeqCst)
    }

    /// Whether the node's work, including every split-off piece, has finished.
    pub fn is_complete(&self) -> bool {
        self.0.successors.is_sealed()
    }

    /// Profiling record attached by `add_task`, if any.
    pub fn metadata(&self) -> Option<&TaskMetadata> {
        self.0.metadata.as_ref()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }

    pub(crate) fn generation(&self) -> &Arc<Generation> {
        &self.0.generation
    }

    /// Wire `self -> successor`.
    ///
    /// Must happen before `self` is dispatched for the edge to be ordered by
    /// the graph; an edge onto an already-completed node is satisfied on the
    /// spot. Self-edges are ignored. Returns whether an edge was recorded.
    pub(crate) fn link_successor(&self, successor: &Self) -> bool {
        if self.ptr_eq(successor) {
            return false;
        }
        successor.0.in_degree.fetch_add(1, Ordering::Relaxed);
        match self.0.successors.push(successor.0.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug_assert!(
                    !successor.generation().is_armed(),
                    "NodeHandle::link_successor: successor already submitted"
                );
                successor.0.in_degree.fetch_sub(1, Ordering::AcqRel);
                false
            }
        }
    }

    /// Win the right to dispatch this node. Succeeds once per node.
    pub(crate) fn try_claim(&self) -> bool {
        !self.0.dispatched.swap(true, Ordering::AcqRel)
    }

    /// Swap the node's work for a no-op, keeping its place in the graph.
    ///
    /// Only valid before the node's generation is armed.
    pub(crate) fn discard_work(&self) {
        debug_assert!(
            !self.generation().is_armed(),
            "NodeHandle::discard_work: [1]"
        );
        // SAFETY: nodes of an unarmed generation are never claimed, so the
        // builder is the only thread touching the slot.
        unsafe {
            self.0
                .work
                .get_mut()
                .with(|ptr| *ptr = Some(Work::Host(Box::new(|| None))));
        }
    }

    /// Turn a claimed node into its first job.
    pub(crate) fn into_job(self, grain: usize) -> Job<C> {
        // SAFETY: only the claiming thread reaches this point for a given
        // node, and it does so once.
        let work = unsafe {
            self.0
                .work
                .get_mut()
                .with(|ptr| (*ptr).take())
                .expect("NodeHandle::into_job: [1]")
        };
        let task = match work {
            Work::Kernel(kernel) => JobTask::Kernel(kernel),
            Work::Host(call) => JobTask::Host(call),
            Work::Range { range, body } => JobTask::Range {
                cursor: RangeCursor::new(range, grain),
                body,
            },
        };
        Job { node: self, task }
    }

    /// Retire one outstanding part. The last one completes the node: its
    /// successor list is sealed and every successor whose in-degree drops to
    /// zero inside a submitted generation is claimed and passed to `ready`.
    pub(crate) fn finish_part(&self, ready: &mut impl FnMut(Self)) {
        if self.0.parts.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        for successor in self.0.successors.seal() {
            let successor = Self(successor);
            if successor.0.in_degree.fetch_sub(1, Ordering::SeqCst) == 1
                && successor.generation().is_armed()
                && successor.try_claim()
            {
                ready(successor);
            }
        }
        self.0.generation.node_finished();
    }
}

enum JobTask<C: Config> {
    Kernel(Kernel<C::Backend>),
    Host(Box<dyn FnOnce() -> Option<Event<C>> + Send>),
    Range {
        cursor: RangeCursor,
        body: RangeBody<C>,
    },
}

/// A unit a worker executes: a whole node, or one range piece of it.
pub(crate) struct Job<C: Config> {
    node: NodeHandle<C>,
    task: JobTask<C>,
}

impl<C: Config> fmt::Debug for Job<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut job = f.debug_struct("Job");
        match &self.task {
            JobTask::Kernel(_) => job.field("kind", &"kernel"),
            JobTask::Host(_) => job.field("kind", &"host"),
            JobTask::Range { cursor, .. } => job.field("range", &cursor.remaining()),
        };
        job.field("node", &self.node).finish()
    }
}

impl<C: Config> Job<C> {
    pub(crate) fn node(&self) -> &NodeHandle<C> {
        &self.node
    }

    /// Detach half of a range job as a new job on the same node.
    ///
    /// Kernel and host jobs never split; range jobs refuse once either half
    /// would fall below the grain.
    pub(crate) fn try_split(&self) -> Option<Self> {
        let JobTask::Range { cursor, body } = &self.task else {
            return None;
        };
        let piece = cursor.try_split()?;
        self.node.0.parts.fetch_add(1, Ordering::Relaxed);
        Some(Self {
            node: self.node.clone(),
            task: JobTask::Range {
                cursor: RangeCursor::new(piece, cursor.grain()),
                body: body.clone(),
            },
        })
    }

    /// Run the job, returning the completion handle to watch. `None` means
    /// the work already finished.
    pub(crate) fn run(self, backend: &C::Backend) -> Option<Event<C>> {
        match self.task {
            JobTask::Kernel(kernel) => Some(backend.submit(kernel)),
            JobTask::Host(call) => call(),
            JobTask::Range { cursor, body } => {
                let range = cursor.take();
                Some(backend.submit(Box::new(move |handler| body(range, handler))))
            }
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::backend::{CompletionEvent, InlineBackend, Signal};
    use std::sync::Mutex;

    struct TestConfig;

    impl Config for TestConfig {
        type Backend = InlineBackend;
    }

    fn node(generation: &Arc<Generation>) -> NodeHandle<TestConfig> {
        generation.register();
        NodeHandle::new(Work::host(|| None), generation.clone(), None)
    }

    #[test]
    fn successor_list_pushes_and_seals() {
        let list = SuccessorList::new();
        for value in 0..3u32 {
            list.push(Shared::new(Counted::new(value))).unwrap();
        }
        let drained: Vec<u32> = list.seal().map(|shared| **shared).collect();
        assert_eq!(drained, vec![2, 1, 0]);
        assert!(list.is_sealed());
        let rejected = list.push(Shared::new(Counted::new(9u32))).unwrap_err();
        assert_eq!(**rejected, 9);
    }

    #[test]
    fn successor_list_releases_unsealed_links_on_drop() {
        let item = Shared::new(Counted::new(1u8));
        {
            let list = SuccessorList::new();
            list.push(item.clone()).unwrap();
            assert_eq!(item.ref_count(), 2);
        }
        assert_eq!(item.ref_count(), 1);
    }

    #[test]
    fn diamond_in_degrees() {
        let generation = Arc::new(Generation::new());
        let (a, b, c, d) = (
            node(&generation),
            node(&generation),
            node(&generation),
            node(&generation),
        );
        assert!(a.link_successor(&b));
        assert!(a.link_successor(&c));
        assert!(b.link_successor(&d));
        assert!(c.link_successor(&d));
        assert_eq!(a.in_degree(), 0);
        assert_eq!(b.in_degree(), 1);
        assert_eq!(d.in_degree(), 2);
    }

    #[test]
    fn self_edge_is_ignored() {
        let generation = Arc::new(Generation::new());
        let a = node(&generation);
        assert!(!a.link_successor(&a));
        assert_eq!(a.in_degree(), 0);
    }

    #[test]
    fn edge_onto_completed_node_is_satisfied() {
        let done = Arc::new(Generation::new());
        let a = node(&done);
        a.finish_part(&mut |_| unreachable!());
        assert!(a.is_complete());

        let fresh = Arc::new(Generation::new());
        let b = node(&fresh);
        assert!(!a.link_successor(&b));
        assert_eq!(b.in_degree(), 0);
    }

    #[test]
    fn finishing_releases_only_armed_successors() {
        let generation = Arc::new(Generation::new());
        let a = node(&generation);
        let b = node(&generation);
        a.link_successor(&b);

        let mut ready = Vec::new();
        a.finish_part(&mut |n| ready.push(n));
        assert!(ready.is_empty(), "generation not submitted yet");
        assert_eq!(b.in_degree(), 0);

        let armed = Arc::new(Generation::new());
        armed.arm();
        let c = node(&armed);
        let d = node(&armed);
        c.link_successor(&d);
        c.finish_part(&mut |n| ready.push(n));
        assert_eq!(ready.len(), 1);
        assert!(ready[0].ptr_eq(&d));
        assert!(!d.try_claim(), "claimed on release");
    }

    #[test]
    fn split_pieces_all_finish_before_completion() {
        let generation = Arc::new(Generation::new());
        generation.register();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let node = NodeHandle::<TestConfig>::new(
            Work::range(0..4096, move |range, _| sink.lock().unwrap().push(range)),
            generation.clone(),
            None,
        );
        assert!(node.try_claim());
        let job = node.clone().into_job(1024);
        let first = job.try_split().expect("4096 splits");
        let second = job.try_split().expect("2048 splits");
        assert!(job.try_split().is_none());

        for (idx, piece) in [first, second, job].into_iter().enumerate() {
            let owner = piece.node().clone();
            let event = piece.run(&InlineBackend).expect("range jobs submit");
            assert!(event.is_complete());
            owner.finish_part(&mut |_| unreachable!());
            assert_eq!(owner.is_complete(), idx == 2);
        }
        let mut ranges = seen.lock().unwrap().clone();
        ranges.sort_by_key(|r| r.start);
        assert_eq!(ranges, vec![0..2048, 2048..3072, 3072..4096]);
    }

    #[test]
    fn host_job_returns_its_event() {
        let generation = Arc::new(Generation::new());
        generation.register();
        let node = NodeHandle::<TestConfig>::new(
            Work::host(|| Some(Signal::ready())),
            generation,
            None,
        );
        assert!(node.try_claim());
        let job = node.into_job(1024);
        assert!(job.try_split().is_none());
        assert!(job.run(&InlineBackend).is_some());
    }
}

#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;
    use loom::thread;

    #[test]
    fn push_racing_seal_is_either_drained_or_rejected() {
        loom::model(|| {
            let list = std::sync::Arc::new(SuccessorList::new());
            let pusher = {
                let list = list.clone();
                thread::spawn(move || list.push(Shared::new(Counted::new(7u32))).is_ok())
            };
            let drained = list.seal().count();
            let pushed = pusher.join().unwrap();
            assert_eq!(drained, usize::from(pushed));
        });
    }
}

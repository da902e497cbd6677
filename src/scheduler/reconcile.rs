use crate::{backend::CompletionEvent, config::Config, node::NodeHandle, types::Event};
use derive_more::Debug;

#[derive(Debug)]
struct Pending<C: Config> {
    #[debug(skip)]
    event: Event<C>,
    node: NodeHandle<C>,
}

/// Per-worker bridge from external completion handles back into the graph.
///
/// Polling is throttled by an adaptive skip counter: a scan that completes
/// nothing doubles the number of following polls that return immediately,
/// up to `cap`; any progress, or newly tracked work, drops it back to zero.
#[derive(Debug)]
pub(crate) struct Reconciler<C: Config> {
    pending: Vec<Pending<C>>,
    /// Polls left to skip before the next scan.
    skip: u32,
    /// Skip length applied after the next unproductive scan.
    backoff: u32,
    cap: u32,
}

impl<C: Config> Reconciler<C> {
    pub(crate) fn new(cap: u32) -> Self {
        Self {
            pending: Vec::new(),
            skip: 0,
            backoff: 0,
            cap,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Watch `event`; `node` loses one outstanding part when it completes.
    pub(crate) fn track(&mut self, event: Event<C>, node: NodeHandle<C>) {
        self.pending.push(Pending { event, node });
        self.skip = 0;
        self.backoff = 0;
    }

    /// Scan pending events unless backing off. Completed ones retire a part
    /// of their node; nodes made ready by that are passed to `ready`.
    /// Returns the number of events that completed.
    pub(crate) fn poll(&mut self, ready: &mut impl FnMut(NodeHandle<C>)) -> usize {
        if self.pending.is_empty() {
            return 0;
        }
        if self.skip > 0 {
            self.skip -= 1;
            return 0;
        }
        let mut completed = 0;
        let mut idx = 0;
        while idx < self.pending.len() {
            if self.pending[idx].event.is_complete() {
                let Pending { node, .. } = self.pending.swap_remove(idx);
                node.finish_part(ready);
                completed += 1;
            } else {
                idx += 1;
            }
        }
        if completed > 0 {
            self.backoff = 0;
        } else {
            self.backoff = self.backoff.saturating_mul(2).saturating_add(1).min(self.cap);
        }
        self.skip = self.backoff;
        completed
    }

    /// Block on every pending event in turn and retire it.
    pub(crate) fn drain(&mut self, ready: &mut impl FnMut(NodeHandle<C>)) -> usize {
        let drained = self.pending.len();
        for Pending { event, node } in self.pending.drain(..) {
            event.wait();
            node.finish_part(ready);
        }
        self.skip = 0;
        self.backoff = 0;
        drained
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::{
        backend::{InlineBackend, Signal, Trigger},
        graph::Generation,
        task::Work,
    };
    use std::sync::Arc;

    struct TestConfig;

    impl Config for TestConfig {
        type Backend = InlineBackend;
    }

    fn pair(generation: &Arc<Generation>) -> (NodeHandle<TestConfig>, NodeHandle<TestConfig>) {
        generation.register();
        generation.register();
        let a = NodeHandle::new(Work::host(|| None), generation.clone(), None);
        let b = NodeHandle::new(Work::host(|| None), generation.clone(), None);
        a.link_successor(&b);
        assert!(a.try_claim());
        (a, b)
    }

    fn pending(reconciler: &mut Reconciler<TestConfig>, node: NodeHandle<TestConfig>) -> Trigger {
        let (signal, trigger) = Signal::pending();
        reconciler.track(signal, node);
        trigger
    }

    #[test]
    fn completion_releases_successor() {
        let generation = Arc::new(Generation::new());
        generation.arm();
        let (a, b) = pair(&generation);
        let mut reconciler = Reconciler::new(8);
        let trigger = pending(&mut reconciler, a.clone());

        let mut ready = Vec::new();
        assert_eq!(reconciler.poll(&mut |n| ready.push(n)), 0);
        assert!(ready.is_empty());
        assert_eq!(b.in_degree(), 1);

        trigger.fire();
        while reconciler.poll(&mut |n| ready.push(n)) == 0 {}
        assert!(reconciler.is_empty());
        assert!(a.is_complete());
        assert_eq!(ready.len(), 1);
        assert!(ready[0].ptr_eq(&b));
    }

    #[test]
    fn backoff_grows_to_cap_and_resets_on_progress() {
        let generation = Arc::new(Generation::new());
        let (a, _b) = pair(&generation);
        let mut reconciler = Reconciler::new(4);
        let trigger = pending(&mut reconciler, a);
        let mut ignore = |_: NodeHandle<TestConfig>| {};

        let mut skips = Vec::new();
        for _ in 0..4 {
            reconciler.poll(&mut ignore);
            skips.push(reconciler.skip);
            while reconciler.skip > 0 {
                reconciler.poll(&mut ignore);
            }
        }
        assert_eq!(skips, vec![1, 3, 4, 4]);

        trigger.fire();
        assert_eq!(reconciler.poll(&mut ignore), 1);
        assert_eq!((reconciler.skip, reconciler.backoff), (0, 0));
    }

    #[test]
    fn tracking_new_work_cancels_backoff() {
        let generation = Arc::new(Generation::new());
        let (a, b) = pair(&generation);
        let mut reconciler = Reconciler::new(16);
        let _trigger = pending(&mut reconciler, a);
        reconciler.poll(&mut |_| {});
        assert!(reconciler.skip > 0);
        assert!(b.try_claim());
        reconciler.track(Signal::ready(), b);
        assert_eq!(reconciler.skip, 0);
        assert_eq!(reconciler.len(), 2);
    }

    #[test]
    fn drain_waits_for_everything() {
        let generation = Arc::new(Generation::new());
        generation.arm();
        let (a, b) = pair(&generation);
        let mut reconciler = Reconciler::new(8);
        let trigger = pending(&mut reconciler, a);
        let firing = std::thread::spawn(move || trigger.fire());
        let mut ready = Vec::new();
        assert_eq!(reconciler.drain(&mut |n| ready.push(n)), 1);
        firing.join().unwrap();
        assert!(ready[0].ptr_eq(&b));
    }
}

use crate::{
    config::Config,
    node::NodeHandle,
    types::{Address, CACHE_LINE_LOG2},
};
use core::fmt;
use crossbeam_utils::CachePadded;
use derive_more::Debug;
use spin::mutex::SpinMutex;

/// Reader lists longer than this drop readers that have already completed
/// before growing further.
const READER_PRUNE_THRESHOLD: usize = 64;

struct Shard<C: Config> {
    last_writer: Option<NodeHandle<C>>,
    readers: Vec<NodeHandle<C>>,
}

impl<C: Config> fmt::Debug for Shard<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("has_writer", &self.last_writer.is_some())
            .field("readers", &self.readers.len())
            .finish()
    }
}

impl<C: Config> Default for Shard<C> {
    fn default() -> Self {
        Self {
            last_writer: None,
            readers: Vec::new(),
        }
    }
}

/// Sharded registry turning read/write declarations into graph edges.
///
/// Each address hashes (by cache line) to one of a fixed, power-of-two number
/// of shards holding the last writer and the active readers. Unrelated
/// addresses that share a shard produce conservative extra edges, never
/// missing ones.
///
/// The tracker outlives graph generations. An edge from a node of an earlier
/// generation that has already completed is satisfied immediately, so stale
/// entries cost nothing but memory; [`HazardTracker::reset`] drops them.
#[derive(Debug)]
pub struct HazardTracker<C: Config> {
    shards: Box<[CachePadded<SpinMutex<Shard<C>>>]>,
    mask: usize,
}

impl<C: Config> HazardTracker<C> {
    /// # Panics
    /// If `shards` is not a power of two.
    pub fn new(shards: usize) -> Self {
        assert!(
            shards.is_power_of_two(),
            "HazardTracker::new: shard count {shards} is not a power of two"
        );
        Self {
            shards: (0..shards)
                .map(|_| CachePadded::new(SpinMutex::new(Shard::default())))
                .collect(),
            mask: shards - 1,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard an address is tracked in.
    pub fn shard_of(&self, address: Address) -> usize {
        (address >> CACHE_LINE_LOG2) & self.mask
    }

    /// Record that `node` reads (or writes) `address`, wiring edges from the
    /// conflicting earlier accesses.
    ///
    /// A write depends on the last writer and every active reader, then
    /// becomes the sole last writer. A read depends on the last writer and
    /// joins the readers. Returns the number of edges wired.
    pub fn resolve(&self, node: &NodeHandle<C>, address: Address, is_write: bool) -> usize {
        let mut shard = self.shards[self.shard_of(address)].lock();
        let Shard {
            last_writer,
            readers,
        } = &mut *shard;
        let mut wired = 0;
        if let Some(writer) = last_writer.as_ref() {
            wired += usize::from(writer.link_successor(node));
        }
        if is_write {
            for reader in readers.drain(..) {
                wired += usize::from(reader.link_successor(node));
            }
            *last_writer = Some(node.clone());
        } else {
            if readers.len() >= READER_PRUNE_THRESHOLD {
                readers.retain(|reader| !reader.is_complete());
            }
            if !readers.last().is_some_and(|last| last.ptr_eq(node)) {
                readers.push(node.clone());
            }
        }
        wired
    }

    /// Wire one explicit edge `from -> to`. Returns whether it was recorded.
    pub fn add_dependency(&self, from: &NodeHandle<C>, to: &NodeHandle<C>) -> bool {
        from.link_successor(to)
    }

    /// Forget every recorded writer and reader.
    ///
    /// Only call between generations: nodes registered afterwards will not be
    /// ordered after accesses recorded before.
    pub fn reset(&self) {
        for shard in self.shards.iter() {
            *shard.lock() = Shard::default();
        }
    }

    /// Number of readers currently recorded for the shard of `address`.
    pub fn readers_of(&self, address: Address) -> usize {
        self.shards[self.shard_of(address)].lock().readers.len()
    }
}

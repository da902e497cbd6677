use crate::{
    memory::{AllocError, Allocator, AllocatorHandle, Strategy},
    sync::{AtomicPtr, AtomicU64, AtomicUsize, Ordering},
};
use core::ptr::{self, NonNull};
use crossbeam_utils::CachePadded;
use derive_more::Debug;
use tracing::{debug, warn};

/// Slots per page: one bit of the occupancy word each.
pub const SLOTS_PER_PAGE: usize = u64::BITS as usize;

/// Layout and placement of a [`BitmaskPool`].
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Usable bytes per slot.
    pub slot_size: usize,
    /// Alignment of every slot. Must be a power of two.
    pub slot_align: usize,
    /// NUMA node the pages are meant for, recorded on each page.
    pub numa_node: u32,
    /// Strategy the page memory is requested with.
    pub strategy: Strategy,
    /// Maximum number of free slots a [`SlotCache`] holds.
    pub cache_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            slot_size: 256,
            slot_align: 64,
            numa_node: 0,
            strategy: Strategy::Device,
            cache_capacity: 16,
        }
    }
}

impl PoolConfig {
    /// Set the usable bytes per slot.
    #[must_use]
    pub fn with_slot_size(mut self, slot_size: usize) -> Self {
        self.slot_size = slot_size;
        self
    }

    /// Set the slot alignment.
    #[must_use]
    pub fn with_slot_align(mut self, slot_align: usize) -> Self {
        self.slot_align = slot_align;
        self
    }

    /// Set the NUMA node recorded on new pages.
    #[must_use]
    pub fn with_numa_node(mut self, numa_node: u32) -> Self {
        self.numa_node = numa_node;
        self
    }

    /// Set the strategy page memory is requested with.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the capacity of each [`SlotCache`].
    #[must_use]
    pub fn with_cache_capacity(mut self, cache_capacity: usize) -> Self {
        self.cache_capacity = cache_capacity;
        self
    }
}

#[derive(Debug)]
struct Page {
    base: NonNull<u8>,
    /// Bit `i` is set iff slot `i` is handed out.
    mask: AtomicU64,
    #[debug(skip)]
    next: AtomicPtr<CachePadded<Page>>,
    numa_node: u32,
    stride: usize,
}

impl Page {
    fn contains(&self, addr: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        (base..base + self.stride * SLOTS_PER_PAGE).contains(&addr)
    }

    fn slot(&self, index: u32) -> NonNull<u8> {
        // SAFETY: `index < SLOTS_PER_PAGE`, so the offset stays inside the
        // page's backing allocation.
        unsafe { self.base.add(index as usize * self.stride) }
    }

    /// Set the lowest clear bit, returning its slot.
    fn try_claim(&self) -> Option<NonNull<u8>> {
        let mut mask = self.mask.load(Ordering::Relaxed);
        while mask != u64::MAX {
            let index = (!mask).trailing_zeros();
            match self.mask.compare_exchange_weak(
                mask,
                mask | (1 << index),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(self.slot(index)),
                Err(observed) => mask = observed,
            }
        }
        None
    }
}

/// Lock-free fixed-slot allocator.
///
/// Memory comes from an [`Allocator`] a page at a time; every page holds
/// [`SLOTS_PER_PAGE`] equally sized slots whose occupancy lives in a single
/// atomic word. Pages are prepended to a chain and only released when the
/// pool drops, so walking the chain needs no synchronization beyond the
/// acquire load of each link.
#[derive(Debug)]
pub struct BitmaskPool<A: Allocator> {
    #[debug(skip)]
    allocator: AllocatorHandle<A>,
    #[debug(skip)]
    head: AtomicPtr<CachePadded<Page>>,
    pages: AtomicUsize,
    stride: usize,
    config: PoolConfig,
}

impl<A: Allocator> BitmaskPool<A> {
    /// Create a pool with one page.
    ///
    /// # Errors
    /// [`AllocError::NullAllocator`] for an empty handle,
    /// [`AllocError::ZeroSize`] for a zero slot size,
    /// [`AllocError::InvalidAlignment`] for a non-power-of-two alignment, or
    /// whatever the allocator reports for the first page.
    pub fn new(allocator: AllocatorHandle<A>, config: PoolConfig) -> Result<Self, AllocError> {
        if allocator.is_empty() {
            return Err(AllocError::NullAllocator);
        }
        if config.slot_size == 0 {
            return Err(AllocError::ZeroSize);
        }
        if !config.slot_align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(config.slot_align));
        }
        let stride = config.slot_size.next_multiple_of(config.slot_align);
        let pool = Self {
            allocator,
            head: AtomicPtr::new(ptr::null_mut()),
            pages: AtomicUsize::new(0),
            stride,
            config,
        };
        pool.grow(0)?;
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Distance between neighbouring slots.
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn page_count(&self) -> usize {
        self.pages.load(Ordering::Relaxed)
    }

    /// Slots currently handed out, summed over the chain.
    pub fn occupancy(&self) -> usize {
        self.pages()
            .map(|page| page.mask.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Claim a slot from the existing chain. `None` once every page is full.
    pub fn allocate_from_pool(&self) -> Option<NonNull<u8>> {
        self.pages().find_map(Page::try_claim)
    }

    /// Claim a slot, adding a page when the chain is saturated.
    ///
    /// # Errors
    /// If the allocator cannot provide a new page.
    pub fn allocate(&self) -> Result<NonNull<u8>, AllocError> {
        if let Some(slot) = self.allocate_from_pool() {
            return Ok(slot);
        }
        let page = self.grow(1)?;
        Ok(page.slot(0))
    }

    /// Append up to `count` slots from the existing chain to `out`. Returns
    /// the number appended.
    pub fn allocate_batch(&self, out: &mut Vec<NonNull<u8>>, count: usize) -> usize {
        let before = out.len();
        out.extend((0..count).map_while(|_| self.allocate_from_pool()));
        out.len() - before
    }

    /// Return a slot to its page.
    ///
    /// # Errors
    /// [`AllocError::UnknownPointer`] if `ptr` is not a slot of this pool.
    pub fn deallocate_to_page(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let (page, bit) = self.locate(ptr)?;
        let prev = page.mask.fetch_and(!bit, Ordering::Release);
        debug_assert!(
            prev & bit != 0,
            "BitmaskPool::deallocate_to_page: slot {ptr:p} freed twice"
        );
        Ok(())
    }

    /// NUMA node recorded on the page holding `ptr`.
    pub fn numa_node_of(&self, ptr: NonNull<u8>) -> Option<u32> {
        self.page_of(ptr.as_ptr() as usize).map(|page| page.numa_node)
    }

    /// A cache of free slots for the calling thread.
    pub fn cache(&self) -> SlotCache<'_, A> {
        SlotCache::new(self, self.config.cache_capacity)
    }

    /// Page holding slot `ptr` and the slot's occupancy bit.
    fn locate(&self, ptr: NonNull<u8>) -> Result<(&Page, u64), AllocError> {
        let addr = ptr.as_ptr() as usize;
        let page = self.page_of(addr).ok_or(AllocError::UnknownPointer)?;
        let offset = addr - page.base.as_ptr() as usize;
        if offset % page.stride != 0 {
            return Err(AllocError::UnknownPointer);
        }
        Ok((page, 1 << (offset / page.stride)))
    }

    fn page_of(&self, addr: usize) -> Option<&Page> {
        self.pages().find(|page| page.contains(addr))
    }

    fn pages(&self) -> impl Iterator<Item = &Page> {
        let mut cursor = self.head.load(Ordering::Acquire);
        core::iter::from_fn(move || {
            // SAFETY: published pages live until the pool drops.
            let page = unsafe { cursor.as_ref() }?;
            cursor = page.next.load(Ordering::Acquire);
            Some(&**page)
        })
    }

    /// Prepend a fresh page whose occupancy starts as `initial`.
    fn grow(&self, initial: u64) -> Result<&Page, AllocError> {
        let bytes = self
            .stride
            .checked_mul(SLOTS_PER_PAGE)
            .ok_or(AllocError::OutOfMemory { bytes: usize::MAX })?;
        let base = self
            .allocator
            .allocate(bytes, self.config.strategy, self.config.slot_align)?;
        let raw = Box::into_raw(Box::new(CachePadded::new(Page {
            base,
            mask: AtomicU64::new(initial),
            next: AtomicPtr::new(ptr::null_mut()),
            numa_node: self.config.numa_node,
            stride: self.stride,
        })));
        // SAFETY: freshly boxed; freed only when the pool drops.
        let page: &Page = unsafe { &*raw };
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            page.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, raw, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }
        let pages = self.pages.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(pages, bytes, numa_node = self.config.numa_node, "bitmask pool grew");
        Ok(page)
    }
}

impl<A: Allocator> Drop for BitmaskPool<A> {
    fn drop(&mut self) {
        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            // SAFETY: `&mut self` means no other thread sees the chain, and
            // each page header was created by `Box::into_raw` in `grow`.
            let page = unsafe { Box::from_raw(cursor) };
            cursor = page.next.load(Ordering::Relaxed);
            let live = page.mask.load(Ordering::Relaxed).count_ones();
            if live != 0 {
                warn!(live, "bitmask pool dropped with outstanding slots");
            }
            if let Err(err) = self.allocator.deallocate(page.base) {
                warn!(%err, "failed to release bitmask pool page");
            }
        }
    }
}

/// Bounded stack of free slots refilled in batches from a [`BitmaskPool`].
///
/// Serves allocations without touching the shared occupancy words until it
/// runs dry. Not `Send`: keep one per thread. Dropping it returns the cached
/// slots to the pool.
#[derive(Debug)]
pub struct SlotCache<'p, A: Allocator> {
    pool: &'p BitmaskPool<A>,
    slots: Vec<NonNull<u8>>,
    capacity: usize,
}

impl<'p, A: Allocator> SlotCache<'p, A> {
    fn new(pool: &'p BitmaskPool<A>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            pool,
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// # Errors
    /// If the pool is saturated and cannot grow.
    pub fn alloc(&mut self) -> Result<NonNull<u8>, AllocError> {
        if self.slots.is_empty() {
            self.pool.allocate_batch(&mut self.slots, self.capacity);
        }
        match self.slots.pop() {
            Some(slot) => Ok(slot),
            None => self.pool.allocate(),
        }
    }

    /// Keep `ptr` for reuse, or hand it back to the pool when full.
    ///
    /// # Errors
    /// [`AllocError::UnknownPointer`] if `ptr` is not a slot of the pool.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        if self.slots.len() == self.capacity {
            return self.pool.deallocate_to_page(ptr);
        }
        self.pool.locate(ptr)?;
        self.slots.push(ptr);
        Ok(())
    }

    /// Return every cached slot to the pool. Returns how many were returned.
    pub fn flush(&mut self) -> usize {
        let flushed = self.slots.len();
        for slot in self.slots.drain(..) {
            let released = self.pool.deallocate_to_page(slot);
            debug_assert!(released.is_ok(), "SlotCache::flush: [1]");
        }
        flushed
    }
}

impl<A: Allocator> Drop for SlotCache<'_, A> {
    fn drop(&mut self) {
        self.flush();
    }
}

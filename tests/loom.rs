#![allow(missing_docs)]
#![cfg(feature = "loom")]

use dagrt::{
    memory::{
        AllocatorHandle,
        host::HostAllocator,
        pool::{BitmaskPool, PoolConfig},
    },
    shared::{Counted, Shared},
};
use loom::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

fn small_pool() -> BitmaskPool<HostAllocator> {
    BitmaskPool::new(
        AllocatorHandle::new(Counted::new(HostAllocator::new())),
        PoolConfig::default().with_slot_size(8).with_slot_align(8),
    )
    .unwrap()
}

#[test]
fn loom_shared_handle_destroyed_exactly_once() {
    loom::model(|| {
        let drops = Arc::new(AtomicUsize::new(0));
        let handle = Shared::new(Counted::new(DropCounter(drops.clone())));
        let other = handle.clone();

        let t = thread::spawn(move || {
            let copy = other.clone();
            drop(other);
            assert_eq!(copy.0.load(Ordering::Relaxed), 0);
            drop(copy);
        });
        drop(handle);
        t.join().unwrap();

        assert_eq!(drops.load(Ordering::Relaxed), 1);
    });
}

#[test]
fn loom_concurrent_pool_allocations_are_distinct() {
    loom::model(|| {
        let pool = Arc::new(small_pool());
        let remote = pool.clone();
        let t = thread::spawn(move || remote.allocate_from_pool().unwrap().as_ptr() as usize);
        let mine = pool.allocate_from_pool().unwrap().as_ptr() as usize;
        let theirs = t.join().unwrap();

        assert_ne!(mine, theirs);
        assert_eq!(pool.occupancy(), 2);
    });
}

#[test]
fn loom_free_racing_allocate_keeps_mask_exact() {
    loom::model(|| {
        let pool = Arc::new(small_pool());
        let first = pool.allocate_from_pool().unwrap().as_ptr() as usize;
        let remote = pool.clone();
        let t = thread::spawn(move || {
            let ptr = core::ptr::NonNull::new(first as *mut u8).unwrap();
            remote.deallocate_to_page(ptr).unwrap();
        });
        let second = pool.allocate_from_pool().unwrap();
        t.join().unwrap();

        assert_eq!(pool.occupancy(), 1);
        pool.deallocate_to_page(second).unwrap();
        assert_eq!(pool.occupancy(), 0);
    });
}

use crate::sync::{AtomicIsize, Ordering, fence};
use core::{fmt, marker::PhantomData, mem, ops::Deref, ptr::NonNull};
use derive_more::Deref;

/// Types that carry their own (intrusive) reference count.
///
/// # Safety
///
/// Implementors must destroy the object exactly once, inside the `release`
/// call that takes the count from one to zero, and never while a prior
/// `acquire` is still unmatched.
pub unsafe trait RefCounted {
    /// Register one more owner. Relaxed: the count guards no data until the
    /// final decrement.
    fn acquire(&self);

    /// Drop one owner, destroying the object if it was the last.
    ///
    /// # Safety
    ///
    /// `this` must point to a live object, and the caller must own one
    /// reference obtained through `acquire` which it gives up here.
    unsafe fn release(this: NonNull<Self>);
}

/// Atomic signed reference counter, starting at zero.
#[derive(Debug)]
pub struct RefCount(AtomicIsize);

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

impl RefCount {
    /// A counter with no owners yet.
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    /// Add one owner.
    ///
    /// # Panics
    /// If the object was already destroyed.
    #[inline]
    pub fn acquire(&self) {
        let prev = self.0.fetch_add(1, Ordering::Relaxed);
        assert!(prev >= 0, "RefCount::acquire: object already destroyed");
    }

    /// Returns `true` if this call released the last reference. The caller is
    /// then the only party allowed to touch the object and must destroy it.
    #[inline]
    #[must_use]
    pub fn release(&self) -> bool {
        let prev = self.0.fetch_sub(1, Ordering::Release);
        assert!(prev > 0, "RefCount::release: count would go negative");
        if prev == 1 {
            fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }

    /// Current count. Only a snapshot under concurrent use.
    pub fn get(&self) -> isize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Heap cell pairing a value with an intrusive [`RefCount`].
///
/// The usual way to make a type shareable through [`Shared`]:
/// `Shared::new(Counted::new(value))`.
#[derive(Debug, Deref)]
pub struct Counted<T> {
    refs: RefCount,
    #[deref]
    value: T,
}

impl<T> Counted<T> {
    pub fn new(value: T) -> Self {
        Self {
            refs: RefCount::new(),
            value,
        }
    }

    /// Current number of live handles.
    pub fn ref_count(&self) -> isize {
        self.refs.get()
    }
}

// SAFETY: `Counted` values only become shared through `Shared::new`, which
// boxes them; the box is freed exactly when `RefCount::release` reports the
// last owner.
unsafe impl<T> RefCounted for Counted<T> {
    fn acquire(&self) {
        self.refs.acquire();
    }

    unsafe fn release(this: NonNull<Self>) {
        // SAFETY: caller guarantees `this` is live and owns one reference.
        let last = unsafe { this.as_ref() }.refs.release();
        if last {
            // SAFETY: allocated by `Box` in `Shared::new`; no other owner
            // remains after the final release.
            drop(unsafe { Box::from_raw(this.as_ptr()) });
        }
    }
}

/// Owning handle over an intrusively counted object.
///
/// Cloning acquires, moving transfers, dropping releases. A handle is either
/// empty or owns exactly one reference. Dereferencing an empty handle panics.
pub struct Shared<T: RefCounted> {
    ptr: Option<NonNull<T>>,
    _marker: PhantomData<T>,
}

// SAFETY: a handle hands out `&T` across threads and may drop the last
// reference on any thread, the same contract as `Arc<T>`.
unsafe impl<T: RefCounted + Send + Sync> Send for Shared<T> {}
unsafe impl<T: RefCounted + Send + Sync> Sync for Shared<T> {}

impl<T: RefCounted> Shared<T> {
    /// Move `value` to the heap and take the first reference.
    pub fn new(value: T) -> Self {
        let ptr = NonNull::from(Box::leak(Box::new(value)));
        // SAFETY: freshly leaked, live.
        unsafe { ptr.as_ref() }.acquire();
        Self {
            ptr: Some(ptr),
            _marker: PhantomData,
        }
    }

    /// A handle referring to nothing. Acquire/release on it are no-ops.
    pub const fn empty() -> Self {
        Self {
            ptr: None,
            _marker: PhantomData,
        }
    }

    /// Adopt an existing reference without touching the counter.
    ///
    /// # Safety
    ///
    /// `ptr` must be live and the caller must transfer one owned reference.
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        Self {
            ptr: Some(ptr),
            _marker: PhantomData,
        }
    }

    /// Give up the handle without releasing; the caller now owns the reference.
    pub fn into_raw(self) -> Option<NonNull<T>> {
        let ptr = self.ptr;
        mem::forget(self);
        ptr
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.is_none()
    }

    pub fn get(&self) -> Option<&T> {
        // SAFETY: a non-empty handle keeps its target alive.
        self.ptr.map(|ptr| unsafe { &*ptr.as_ptr() })
    }

    pub fn as_ptr(&self) -> Option<NonNull<T>> {
        self.ptr
    }

    /// Both handles refer to the same object (or are both empty).
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }

    /// Release the held reference now, leaving the handle empty.
    pub fn reset(&mut self) {
        drop(mem::take(self));
    }

    pub fn swap(&mut self, other: &mut Self) {
        mem::swap(&mut self.ptr, &mut other.ptr);
    }
}

impl<T: RefCounted> Default for Shared<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: RefCounted> Clone for Shared<T> {
    fn clone(&self) -> Self {
        if let Some(target) = self.get() {
            target.acquire();
        }
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }

    fn clone_from(&mut self, source: &Self) {
        let mut tmp = source.clone();
        self.swap(&mut tmp);
    }
}

impl<T: RefCounted> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            // SAFETY: this handle owns one reference to a live object.
            unsafe { T::release(ptr) };
        }
    }
}

impl<T: RefCounted> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.get().expect("Shared::deref: empty handle")
    }
}

impl<T: RefCounted + fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(target) => f.debug_tuple("Shared").field(target).finish(),
            None => f.write_str("Shared(<empty>)"),
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering as StdOrdering},
    };

    #[derive(Debug)]
    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, StdOrdering::SeqCst);
        }
    }

    fn counted() -> (Shared<Counted<DropCounter>>, Arc<AtomicUsize>) {
        let drops = Arc::new(AtomicUsize::new(0));
        (Shared::new(Counted::new(DropCounter(drops.clone()))), drops)
    }

    #[test]
    fn counter_starts_at_zero() {
        let counted = Counted::new(5u8);
        assert_eq!(counted.ref_count(), 0);
        let shared = Shared::new(counted);
        assert_eq!(shared.ref_count(), 1);
        assert_eq!(**shared, 5);
    }

    #[test]
    fn clone_and_move_semantics() {
        let (a, drops) = counted();
        let b = a.clone();
        assert_eq!(a.ref_count(), 2);
        let c = b;
        assert_eq!(c.ref_count(), 2);
        drop(a);
        assert_eq!(drops.load(StdOrdering::SeqCst), 0);
        drop(c);
        assert_eq!(drops.load(StdOrdering::SeqCst), 1);
    }

    #[test]
    fn clone_from_releases_previous_target() {
        let (mut a, drops_a) = counted();
        let (b, drops_b) = counted();
        a.clone_from(&b);
        assert_eq!(drops_a.load(StdOrdering::SeqCst), 1);
        assert!(a.ptr_eq(&b));
        assert_eq!(b.ref_count(), 2);
        drop((a, b));
        assert_eq!(drops_b.load(StdOrdering::SeqCst), 1);
    }

    #[test]
    fn self_assignment_keeps_object_alive() {
        let (mut a, drops) = counted();
        let alias = a.clone();
        a.clone_from(&alias);
        drop(alias);
        assert_eq!(drops.load(StdOrdering::SeqCst), 0);
        assert_eq!(a.ref_count(), 1);
    }

    #[test]
    fn empty_handle_is_inert() {
        let empty = Shared::<Counted<u32>>::empty();
        let copy = empty.clone();
        assert!(copy.is_empty());
        assert!(empty.get().is_none());
        drop((empty, copy));
    }

    #[test]
    #[should_panic(expected = "empty handle")]
    fn deref_of_empty_handle_panics() {
        let empty = Shared::<Counted<u32>>::default();
        let _ = **empty;
    }

    #[test]
    fn raw_round_trip_preserves_count() {
        let (a, drops) = counted();
        let raw = a.into_raw().expect("non-empty");
        // SAFETY: `raw` carries the reference given up by `into_raw`.
        let back = unsafe { Shared::from_raw(raw) };
        assert_eq!(back.ref_count(), 1);
        drop(back);
        assert_eq!(drops.load(StdOrdering::SeqCst), 1);
    }

    #[test]
    fn concurrent_acquire_release_destroys_once() {
        let (root, drops) = counted();
        let threads: Vec<_> = (0..8u64)
            .map(|seed| {
                let local = root.clone();
                std::thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(seed);
                    let mut held = Vec::new();
                    for _ in 0..2_000 {
                        if held.is_empty() || rng.gen_bool(0.6) {
                            held.push(local.clone());
                        } else {
                            let idx = rng.gen_range(0..held.len());
                            held.swap_remove(idx);
                        }
                        assert!(local.ref_count() >= 1);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(drops.load(StdOrdering::SeqCst), 0);
        assert_eq!(root.ref_count(), 1);
        drop(root);
        assert_eq!(drops.load(StdOrdering::SeqCst), 1);
    }
}

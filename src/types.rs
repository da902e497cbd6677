use crate::{backend::Backend, config::Config, sync::UnsafeCell};
use derive_more::{Deref, DerefMut};
use indexmap::IndexSet as _IndexSet;
use rustc_hash::FxBuildHasher;
use std::collections::HashMap as _HashMap;

/// A minimal `UnsafeCell` wrapper that is `Sync` when `T: Send`.
///
/// Used for node work slots: the value is moved out exactly once by the thread
/// that won the node's dispatch claim, so no two threads ever touch it.
#[derive(Debug, Deref, DerefMut)]
#[repr(transparent)]
pub(crate) struct SyncUnsafeCell<T>(UnsafeCell<T>);

unsafe impl<T: Send> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    pub(crate) fn new(val: T) -> Self {
        Self(UnsafeCell::new(val))
    }
}

/// A memory address declared by a task as read or written.
///
/// Only its numeric value matters; it is never dereferenced by the runtime.
pub type Address = usize;

/// Completion handle produced by the backend bound to `C`.
pub type Event<C> = <<C as Config>::Backend as Backend>::Event;
/// Device-submission context handed to kernel closures for `C`.
pub type Handler<C> = <<C as Config>::Backend as Backend>::Handler;

/// Identity of the device that owns an allocation or executes kernels.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DeviceId {
    /// Host memory / host CPU.
    Host,
    /// Accelerator with the given ordinal.
    Accelerator(u32),
}

/// Log2 of the cache line size used to hash addresses into hazard shards.
pub const CACHE_LINE_LOG2: u32 = 6;

pub(crate) type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
pub(crate) type IndexSet<T> = _IndexSet<T, FxBuildHasher>;

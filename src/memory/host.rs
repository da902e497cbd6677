use crate::{
    memory::{AllocError, Allocator, Strategy},
    types::{DeviceId, HashMap},
};
use core::ptr::NonNull;
use parking_lot::Mutex;
use std::alloc::{self, Layout};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
struct Allocation {
    layout: Layout,
    strategy: Strategy,
}

/// [`Allocator`] on the global heap.
///
/// Every strategy maps to ordinary host memory; the requested strategy is
/// remembered per allocation so callers can query it back. Allocations still
/// live when the allocator drops are freed.
#[derive(Debug)]
pub struct HostAllocator {
    device: DeviceId,
    live: Mutex<HashMap<usize, Allocation>>,
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HostAllocator {
    pub fn new() -> Self {
        Self::for_device(DeviceId::Host)
    }

    /// Host memory reported as belonging to `device`, standing in for an
    /// accelerator whose memory is host-visible.
    pub fn for_device(device: DeviceId) -> Self {
        Self {
            device,
            live: Mutex::new(HashMap::default()),
        }
    }

    pub fn live_allocations(&self) -> usize {
        self.live.lock().len()
    }

    /// Strategy `ptr` was allocated with.
    pub fn strategy_of(&self, ptr: NonNull<u8>) -> Option<Strategy> {
        self.live
            .lock()
            .get(&(ptr.as_ptr() as usize))
            .map(|allocation| allocation.strategy)
    }
}

impl Allocator for HostAllocator {
    fn allocate(
        &self,
        bytes: usize,
        strategy: Strategy,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        if bytes == 0 {
            return Err(AllocError::ZeroSize);
        }
        let layout = Layout::from_size_align(bytes, alignment)
            .map_err(|_| AllocError::InvalidAlignment(alignment))?;
        // SAFETY: `layout` has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc(layout) })
            .ok_or(AllocError::OutOfMemory { bytes })?;
        self.live
            .lock()
            .insert(ptr.as_ptr() as usize, Allocation { layout, strategy });
        Ok(ptr)
    }

    fn deallocate(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let Allocation { layout, .. } = self
            .live
            .lock()
            .remove(&(ptr.as_ptr() as usize))
            .ok_or(AllocError::UnknownPointer)?;
        // SAFETY: `ptr` was returned by `alloc::alloc` with `layout` and has
        // just been removed from the live table.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn device_of(&self, ptr: NonNull<u8>) -> Option<DeviceId> {
        self.live
            .lock()
            .contains_key(&(ptr.as_ptr() as usize))
            .then_some(self.device)
    }
}

impl Drop for HostAllocator {
    fn drop(&mut self) {
        let live = self.live.get_mut();
        if !live.is_empty() {
            warn!(count = live.len(), "host allocator dropped with live allocations");
        }
        for (addr, Allocation { layout, .. }) in live.drain() {
            // SAFETY: every entry is an outstanding `alloc::alloc` result.
            unsafe { alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn honors_alignment() {
        let host = HostAllocator::new();
        for alignment in [1, 8, 64, 4096] {
            let ptr = host.allocate(24, Strategy::Device, alignment).unwrap();
            assert_eq!(ptr.as_ptr() as usize % alignment, 0);
            host.deallocate(ptr).unwrap();
        }
        assert_eq!(host.live_allocations(), 0);
    }

    #[test]
    fn remembers_strategy_and_device() {
        let host = HostAllocator::for_device(DeviceId::Accelerator(2));
        let ptr = host.allocate(8, Strategy::HostPinned, 8).unwrap();
        assert_eq!(host.strategy_of(ptr), Some(Strategy::HostPinned));
        assert_eq!(host.device_of(ptr), Some(DeviceId::Accelerator(2)));
        host.deallocate(ptr).unwrap();
        assert_eq!(host.device_of(ptr), None);
    }

    #[test]
    fn rejects_bad_requests() {
        let host = HostAllocator::new();
        assert_eq!(host.allocate(0, Strategy::Device, 8), Err(AllocError::ZeroSize));
        assert_eq!(
            host.allocate(8, Strategy::Device, 3),
            Err(AllocError::InvalidAlignment(3))
        );
        let ptr = host.allocate(8, Strategy::Device, 8).unwrap();
        host.deallocate(ptr).unwrap();
        assert_eq!(host.deallocate(ptr), Err(AllocError::UnknownPointer));
    }

    #[test]
    fn drop_frees_leftovers() {
        let host = HostAllocator::new();
        host.allocate(128, Strategy::Shared, 16).unwrap();
        assert_eq!(host.live_allocations(), 1);
    }
}

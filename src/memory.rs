pub mod host;
pub mod pool;

use crate::{
    shared::{Counted, Shared},
    types::DeviceId,
};
use core::ptr::NonNull;
use thiserror::Error;

/// Where an allocation is placed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum Strategy {
    /// Local to the device, not host-accessible.
    #[default]
    Device,
    /// Accessible from both the host and the device.
    Shared,
    /// Page-locked host memory the device can read directly.
    HostPinned,
}

/// Error returned by [`Allocator`] operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AllocError {
    /// A request for zero bytes.
    #[error("zero-size allocation requested")]
    ZeroSize,
    /// The allocator handle was empty.
    #[error("allocation through an empty allocator handle")]
    NullAllocator,
    /// The requested alignment is not a power of two.
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
    /// The backend could not provide the memory.
    #[error("out of memory allocating {bytes} bytes")]
    OutOfMemory { bytes: usize },
    /// The pointer is not a live allocation or slot of this allocator.
    #[error("pointer was not allocated here")]
    UnknownPointer,
}

/// Memory backend contract.
///
/// Implementations bind to a concrete device's allocation primitives. Every
/// pointer returned by `allocate` stays valid until passed to `deallocate`
/// on the same allocator.
pub trait Allocator: Send + Sync {
    /// # Errors
    /// [`AllocError::ZeroSize`] for `bytes == 0`,
    /// [`AllocError::InvalidAlignment`] for a non-power-of-two alignment and
    /// [`AllocError::OutOfMemory`] when the device cannot satisfy the request.
    fn allocate(
        &self,
        bytes: usize,
        strategy: Strategy,
        alignment: usize,
    ) -> Result<NonNull<u8>, AllocError>;

    /// # Errors
    /// [`AllocError::UnknownPointer`] if `ptr` is not a live allocation of
    /// this allocator.
    fn deallocate(&self, ptr: NonNull<u8>) -> Result<(), AllocError>;

    /// Device owning `ptr`, or `None` if it is not a live allocation.
    fn device_of(&self, ptr: NonNull<u8>) -> Option<DeviceId>;
}

/// Reference-counted allocator shared by pools and storage blocks.
pub type AllocatorHandle<A> = Shared<Counted<A>>;

/// Allocate through a possibly empty handle.
///
/// # Errors
/// [`AllocError::NullAllocator`] if `handle` is empty, otherwise whatever
/// the allocator reports.
pub fn allocate_with<A: Allocator>(
    handle: &AllocatorHandle<A>,
    bytes: usize,
    strategy: Strategy,
    alignment: usize,
) -> Result<NonNull<u8>, AllocError> {
    handle
        .get()
        .ok_or(AllocError::NullAllocator)?
        .allocate(bytes, strategy, alignment)
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::{host::HostAllocator, *};

    #[test]
    fn empty_handle_is_rejected() {
        let handle = AllocatorHandle::<HostAllocator>::empty();
        assert_eq!(
            allocate_with(&handle, 64, Strategy::Device, 8),
            Err(AllocError::NullAllocator)
        );
    }

    #[test]
    fn handle_forwards_to_allocator() {
        let handle = AllocatorHandle::new(Counted::new(HostAllocator::new()));
        let ptr = allocate_with(&handle, 64, Strategy::Shared, 16).unwrap();
        assert_eq!(handle.device_of(ptr), Some(DeviceId::Host));
        handle.deallocate(ptr).unwrap();
    }
}

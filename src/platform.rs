//! The only place where this crate talks to the system. Everything else works
//! on memory handed to it by a caller or by a parent allocator.

use std::ptr::NonNull;

use log::trace;

use crate::{
    alignment::{is_valid_alignment, POINTER_SIZE},
    assertion::mem_assert,
    AllocationResult, AllocationSourceInfo, Allocator, Pointer,
};

/// Abstraction for platform specific memory handling. We only need aligned
/// blocks of memory and a way to give them back, we don't care which C
/// runtime function provides them.
trait PlatformSpecificMemory {
    /// Requests `size` bytes aligned to `alignment`. `alignment` is a power of
    /// two and a multiple of the pointer size.
    unsafe fn request_memory(size: usize, alignment: usize) -> Pointer<u8>;

    /// Returns a block obtained from [`PlatformSpecificMemory::request_memory`]
    /// with the same `size` and `alignment`.
    unsafe fn return_memory(address: NonNull<u8>, size: usize, alignment: usize);
}

/// Zero sized type that implements [`PlatformSpecificMemory`] for each OS.
struct Platform;

/// Allocator backed by the C runtime heap. Stateless, so it can be freely
/// copied and shared between threads. It is the usual root of an allocator
/// hierarchy and the backend of [`crate::default_heap`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

unsafe impl Allocator for SystemAllocator {
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        _source_info: &AllocationSourceInfo,
    ) -> AllocationResult {
        mem_assert!(
            is_valid_alignment(alignment),
            "The alignment ({}) must be a non-zero power of two",
            alignment
        );

        if size == 0 {
            return AllocationResult::null();
        }

        match unsafe { Platform::request_memory(size, alignment.max(POINTER_SIZE)) } {
            Some(address) => AllocationResult::new(address.as_ptr(), size),
            None => {
                trace!("SystemAllocator failed to allocate {size} bytes aligned to {alignment}");
                AllocationResult::null()
            }
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        Platform::return_memory(ptr, size, alignment.max(POINTER_SIZE));
    }
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(size: usize, alignment: usize) -> Pointer<u8> {
            let mut address = ptr::null_mut();

            // See https://man7.org/linux/man-pages/man3/posix_memalign.3.html
            match libc::posix_memalign(&mut address, alignment, size) {
                0 => NonNull::new(address.cast()),
                _ => None,
            }
        }

        unsafe fn return_memory(address: NonNull<u8>, _size: usize, _alignment: usize) {
            libc::free(address.as_ptr().cast());
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::ptr::NonNull;

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(size: usize, alignment: usize) -> Pointer<u8> {
            // Blocks from `_aligned_malloc` must be released with
            // `_aligned_free`, never with `free`.
            NonNull::new(libc::aligned_malloc(size, alignment).cast())
        }

        unsafe fn return_memory(address: NonNull<u8>, _size: usize, _alignment: usize) {
            libc::aligned_free(address.as_ptr().cast());
        }
    }
}

#[cfg(any(miri, not(any(unix, windows))))]
mod fallback {
    //! Miri has no FFI support and some targets have no C runtime, so the
    //! global allocator stands in. This also lets Miri detect blocks that are
    //! never given back.

    use std::{alloc, ptr::NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    fn to_layout(size: usize, alignment: usize) -> Option<alloc::Layout> {
        alloc::Layout::from_size_align(size, alignment).ok()
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(size: usize, alignment: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc(to_layout(size, alignment)?))
        }

        unsafe fn return_memory(address: NonNull<u8>, size: usize, alignment: usize) {
            if let Some(layout) = to_layout(size, alignment) {
                alloc::dealloc(address.as_ptr(), layout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source_info;

    #[test]
    fn aligned_blocks() {
        let info = source_info!();

        for alignment in [1, 2, 8, 16, 64, 4096] {
            let block = SystemAllocator.allocate(100, alignment, &info);
            assert!(!block.is_null());
            assert_eq!(block.num_bytes, 100);
            assert_eq!(block.ptr.addr() % alignment, 0);

            unsafe {
                block.ptr.write_bytes(0x5A, 100);
                SystemAllocator.deallocate(block.non_null().unwrap(), 100, alignment);
            }
        }
    }

    #[test]
    fn zero_size() {
        assert!(SystemAllocator.allocate(0, 8, &source_info!()).is_null());
    }

    #[test]
    fn impossible_request_fails() {
        let block = SystemAllocator.allocate(usize::MAX / 2, 8, &source_info!());
        assert!(block.is_null());
    }
}

use std::{cell::Cell, marker::PhantomData, ops::Deref, ptr::NonNull};

use log::trace;

use crate::{
    alignment::{align_pointer, is_valid_alignment},
    assertion::mem_assert,
    AllocationResult, AllocationSourceInfo, Allocator,
};

/// Bump allocator over a fixed buffer. Allocating moves a cursor forward,
/// individual deallocation is only possible for the most recent allocation
/// and everything else is freed at once with [`LinearAllocator::clear`] or by
/// rolling back to a [`LinearAllocatorSavePoint`].
///
/// ```text
/// memory_begin               current                      memory_end
///      |                        |                              |
///      v                        v                              v
///      +-------+---+-------+----+------------------------------+
///      |   A   |pad|   B   | C  |          free space          |
///      +-------+---+-------+----+------------------------------+
/// ```
pub struct LinearAllocator<'a> {
    memory_begin: *mut u8,
    memory_end: *mut u8,
    current: Cell<*mut u8>,
    marker: PhantomData<&'a mut [u8]>,
}

// The allocator behaves like the `&mut [u8]` it was built from.
unsafe impl Send for LinearAllocator<'_> {}

impl<'a> LinearAllocator<'a> {
    pub fn new(memory: &'a mut [u8]) -> Self {
        // SAFETY: The slice is valid and borrowed for 'a.
        unsafe { Self::from_raw_parts(memory.as_mut_ptr(), memory.len()) }
    }

    /// Builds the allocator over raw memory.
    ///
    /// # Safety
    ///
    /// `memory` must be valid for reads and writes of `size` bytes for the
    /// whole lifetime `'a` and nothing else may access it meanwhile.
    pub unsafe fn from_raw_parts(memory: *mut u8, size: usize) -> Self {
        Self {
            memory_begin: memory,
            memory_end: memory.wrapping_add(size),
            current: Cell::new(memory),
            marker: PhantomData,
        }
    }

    /// Forgets every allocation. Outstanding pointers must not be used
    /// afterwards.
    pub fn clear(&self) {
        self.current.set(self.memory_begin);
    }

    /// Returns `true` if `allocate(size, alignment)` would succeed right now.
    /// Nothing is reserved.
    pub fn can_service_allocation(&self, size: usize, alignment: usize) -> bool {
        self.aligned_region(size, alignment).is_some()
    }

    /// Bytes between the beginning of the buffer and the cursor, padding
    /// included.
    pub fn used_memory(&self) -> usize {
        self.current.get().addr() - self.memory_begin.addr()
    }

    pub fn total_memory(&self) -> usize {
        self.memory_end.addr() - self.memory_begin.addr()
    }

    /// Captures the current cursor. See [`LinearAllocatorSavePoint`].
    pub fn save(&self) -> LinearAllocatorSavePoint<'_, 'a> {
        LinearAllocatorSavePoint {
            allocator: self,
            restore_point: self.current.get(),
        }
    }

    /// Save point that rolls back automatically when dropped.
    pub fn scope(&self) -> LinearAllocatorScope<'_, 'a> {
        LinearAllocatorScope {
            save_point: self.save(),
        }
    }

    /// Computes where `size` bytes aligned to `alignment` would start and
    /// end if they were allocated now.
    fn aligned_region(&self, size: usize, alignment: usize) -> Option<(*mut u8, *mut u8)> {
        let aligned = align_pointer(self.current.get(), alignment);

        if aligned.addr() > self.memory_end.addr()
            || self.memory_end.addr() - aligned.addr() < size
        {
            return None;
        }

        Some((aligned, aligned.wrapping_add(size)))
    }
}

unsafe impl Allocator for LinearAllocator<'_> {
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

        match self.aligned_region(size, alignment) {
            Some((begin, end)) => {
                self.current.set(end);
                AllocationResult::new(begin, size)
            }
            None => {
                trace!(
                    "LinearAllocator out of memory: {size} bytes requested, {} used of {}",
                    self.used_memory(),
                    self.total_memory()
                );
                AllocationResult::null()
            }
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, _alignment: usize) {
        mem_assert!(
            ptr.as_ptr().addr() >= self.memory_begin.addr()
                && ptr.as_ptr().addr() < self.memory_end.addr(),
            "Pointer {:p} doesn't belong to this LinearAllocator",
            ptr
        );

        // Only the last allocation can be given back.
        if ptr.as_ptr().wrapping_add(size) == self.current.get() {
            self.current.set(ptr.as_ptr());
        }
    }
}

/// Remembers a cursor position so that everything allocated after it can be
/// released at once. Save points must be restored in the reverse order in
/// which they were taken. Restoring consumes the save point, so a save point
/// can't be restored twice.
pub struct LinearAllocatorSavePoint<'l, 'a> {
    allocator: &'l LinearAllocator<'a>,
    restore_point: *mut u8,
}

impl LinearAllocatorSavePoint<'_, '_> {
    /// Rolls the allocator back to this save point.
    pub fn restore(self) {
        self.rollback();
    }

    fn rollback(&self) {
        mem_assert!(
            self.restore_point.addr() <= self.allocator.current.get().addr(),
            "Save points must be restored in reverse order"
        );

        self.allocator.current.set(self.restore_point);
    }
}

/// Scoped version of [`LinearAllocatorSavePoint`]: rolls back on drop and
/// derefs to the allocator so it can be used directly.
///
/// ```rust
/// use memkit::{source_info, Allocator, LinearAllocator};
///
/// let mut memory = [0u8; 128];
/// let arena = LinearAllocator::new(&mut memory);
///
/// {
///     let scope = arena.scope();
///     assert!(!scope.allocate(100, 1, &source_info!()).is_null());
///     assert_eq!(arena.used_memory(), 100);
/// }
///
/// assert_eq!(arena.used_memory(), 0);
/// ```
pub struct LinearAllocatorScope<'l, 'a> {
    save_point: LinearAllocatorSavePoint<'l, 'a>,
}

impl<'a> Deref for LinearAllocatorScope<'_, 'a> {
    type Target = LinearAllocator<'a>;

    fn deref(&self) -> &Self::Target {
        self.save_point.allocator
    }
}

impl Drop for LinearAllocatorScope<'_, '_> {
    fn drop(&mut self) {
        self.save_point.rollback();
    }
}

use std::{cell::Cell, marker::PhantomData, mem, ptr::NonNull};

use log::trace;

use crate::{
    alignment::{align_pointer, is_valid_alignment},
    assertion::mem_assert,
    AllocationResult, AllocationSourceInfo, Allocator,
};

/// Stored right before every allocation so that deallocating can put the
/// stack pointer back where it was, padding included.
#[repr(C)]
struct StackHeader {
    /// Stack pointer before this allocation.
    restore_point: *mut u8,
    /// Bytes handed out to the caller.
    size: usize,
}

const HEADER_SIZE: usize = mem::size_of::<StackHeader>();

/// LIFO allocator over a fixed buffer. Works like a [`crate::LinearAllocator`]
/// except that every allocation can be freed, as long as it is the most
/// recent live one.
///
/// ```text
///                 +-- restore_point ---+
///                 |                    |
///                 v                    |
/// +---------------+-----+--------+-----+--------+------------------+
/// |       A       | pad | Header |  B (size)    |       free       |
/// +---------------+-----+--------+--------------+------------------+
///                                ^              ^
///                             user ptr      stack pointer
/// ```
pub struct StackAllocator<'a> {
    memory_begin: *mut u8,
    memory_end: *mut u8,
    stack_ptr: Cell<*mut u8>,
    marker: PhantomData<&'a mut [u8]>,
}

unsafe impl Send for StackAllocator<'_> {}

impl<'a> StackAllocator<'a> {
    pub fn new(memory: &'a mut [u8]) -> Self {
        let memory_begin = memory.as_mut_ptr();

        Self {
            memory_begin,
            memory_end: memory_begin.wrapping_add(memory.len()),
            stack_ptr: Cell::new(memory_begin),
            marker: PhantomData,
        }
    }

    /// Bytes in use, headers and padding included.
    pub fn used_memory(&self) -> usize {
        self.stack_ptr.get().addr() - self.memory_begin.addr()
    }

    /// Releases everything at once.
    pub fn clear(&self) {
        self.stack_ptr.set(self.memory_begin);
    }
}

unsafe impl Allocator for StackAllocator<'_> {
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

        // The header sits right before the user pointer, so the user pointer
        // must be aligned for the header as well.
        let alignment = alignment.max(mem::align_of::<StackHeader>());
        let stack_ptr = self.stack_ptr.get();
        let user = align_pointer(stack_ptr.wrapping_add(HEADER_SIZE), alignment);

        if user.addr() > self.memory_end.addr() || self.memory_end.addr() - user.addr() < size {
            trace!(
                "StackAllocator out of memory: {size} bytes requested, {} in use",
                self.used_memory()
            );
            return AllocationResult::null();
        }

        unsafe {
            let header = user.sub(HEADER_SIZE).cast::<StackHeader>();
            header.write(StackHeader {
                restore_point: stack_ptr,
                size,
            });
            self.stack_ptr.set(user.add(size));
        }

        AllocationResult::new(user, size)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, _alignment: usize) {
        let ptr = ptr.as_ptr();

        mem_assert!(
            ptr.addr() >= self.memory_begin.addr() + HEADER_SIZE
                && ptr.addr() < self.stack_ptr.get().addr(),
            "Pointer {:p} is not a live allocation of this StackAllocator",
            ptr
        );

        let header = ptr.sub(HEADER_SIZE).cast::<StackHeader>().read();

        mem_assert!(
            header.size == size,
            "Incorrect number of bytes passed in ({} != {})",
            size,
            header.size
        );
        mem_assert!(
            ptr.add(header.size) == self.stack_ptr.get(),
            "StackAllocator must deallocate in reverse order of allocation"
        );

        self.stack_ptr.set(header.restore_point);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{source_info, test_utils::AlignedBuffer};

    #[test]
    fn lifo_restores_stack_pointer() {
        let mut buffer = AlignedBuffer::<256>::new();
        let stack = StackAllocator::new(buffer.as_mut_slice());
        let info = source_info!();

        let a = stack.allocate(10, 1, &info);
        let used_after_a = stack.used_memory();
        let b = stack.allocate(20, 32, &info);

        assert!(!a.is_null());
        assert!(!b.is_null());
        assert_eq!(b.ptr.addr() % 32, 0);
        assert!(b.ptr.addr() >= a.ptr.addr() + 10 + HEADER_SIZE);

        unsafe {
            stack.deallocate(b.non_null().unwrap(), 20, 32);
            assert_eq!(stack.used_memory(), used_after_a);

            stack.deallocate(a.non_null().unwrap(), 10, 1);
            assert_eq!(stack.used_memory(), 0);
        }

        // Same address again once everything is released.
        let again = stack.allocate(10, 1, &info);
        assert_eq!(again.ptr, a.ptr);
    }

    #[test]
    fn exhaustion() {
        let mut buffer = AlignedBuffer::<64>::new();
        let stack = StackAllocator::new(buffer.as_mut_slice());
        let info = source_info!();

        assert!(stack.allocate(64, 1, &info).is_null());
        assert!(!stack.allocate(64 - HEADER_SIZE, 1, &info).is_null());
        assert!(stack.allocate(1, 1, &info).is_null());
        assert!(stack.allocate(0, 1, &info).is_null());

        stack.clear();
        assert_eq!(stack.used_memory(), 0);
    }

    #[test]
    #[should_panic(expected = "reverse order of allocation")]
    fn out_of_order_deallocation() {
        let mut buffer = AlignedBuffer::<256>::new();
        let stack = StackAllocator::new(buffer.as_mut_slice());
        let info = source_info!();

        let a = stack.allocate(16, 8, &info);
        let _b = stack.allocate(16, 8, &info);

        unsafe { stack.deallocate(a.non_null().unwrap(), 16, 8) };
    }

    #[test]
    #[should_panic(expected = "Incorrect number of bytes")]
    fn wrong_size() {
        let mut buffer = AlignedBuffer::<256>::new();
        let stack = StackAllocator::new(buffer.as_mut_slice());

        let a = stack.allocate(16, 8, &source_info!());
        unsafe { stack.deallocate(a.non_null().unwrap(), 8, 8) };
    }
}

use std::{
    marker::PhantomData,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::trace;

use crate::{
    alignment::{align_pointer, is_valid_alignment},
    assertion::mem_assert,
    AllocationResult, AllocationSourceInfo, Allocator,
};

/// Lock free bump allocator. Each thread reserves `size + alignment - 1`
/// bytes with a single `fetch_add` on the cursor, so the worst case padding
/// is always available, then aligns inside its own reservation:
///
/// ```text
///           reservation of thread A          reservation of thread B
///      +----------------------------------+----------------------------+
///      | pad |     A (size bytes)    |slack| pad |  B (size bytes) |    |
///      +----------------------------------+----------------------------+
///      ^                                  ^
///   offset A                           offset B = offset A + required A
/// ```
///
/// The slack at the end of each reservation is handed out as part of the
/// result. Individual deallocation is not supported, memory comes back only
/// through [`ConcurrentLinearAllocator::clear`].
pub struct ConcurrentLinearAllocator<'a> {
    memory_begin: *mut u8,
    capacity: usize,
    /// Offset of the next free byte from `memory_begin`.
    current: AtomicUsize,
    marker: PhantomData<&'a mut [u8]>,
}

unsafe impl Send for ConcurrentLinearAllocator<'_> {}

// Every thread only writes to the reservation it got from `fetch_add`.
unsafe impl Sync for ConcurrentLinearAllocator<'_> {}

impl<'a> ConcurrentLinearAllocator<'a> {
    pub fn new(memory: &'a mut [u8]) -> Self {
        Self {
            memory_begin: memory.as_mut_ptr(),
            capacity: memory.len(),
            current: AtomicUsize::new(0),
            marker: PhantomData,
        }
    }

    /// Forgets every allocation. Must not race with `allocate`.
    pub fn clear(&self) {
        self.current.store(0, Ordering::Release);
    }

    /// Reserved bytes, including padding and slack. Once the allocator fails
    /// a request this reports the full capacity.
    pub fn used_memory(&self) -> usize {
        self.current.load(Ordering::Acquire).min(self.capacity)
    }

    pub fn total_memory(&self) -> usize {
        self.capacity
    }
}

unsafe impl Allocator for ConcurrentLinearAllocator<'_> {
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

        let Some(required) = size.checked_add(alignment - 1) else {
            return AllocationResult::null();
        };

        if required > self.capacity {
            return AllocationResult::null();
        }

        let offset = self.current.fetch_add(required, Ordering::AcqRel);
        let reservation_end = offset.saturating_add(required);

        if offset >= self.capacity || reservation_end > self.capacity {
            // Park the cursor at the end so that it can't keep growing and
            // overflow while everybody else fails too.
            self.current.store(self.capacity, Ordering::Release);
            trace!("ConcurrentLinearAllocator out of memory: {size} bytes requested");
            return AllocationResult::null();
        }

        let reservation = self.memory_begin.wrapping_add(offset);
        let aligned = align_pointer(reservation, alignment);
        let padding = aligned.addr() - reservation.addr();

        AllocationResult::new(aligned, required - padding)
    }

    /// Individual blocks are never given back.
    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _size: usize, _alignment: usize) {}
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use super::*;
    use crate::{source_info, test_utils::AlignedBuffer};

    #[test]
    fn single_thread() {
        let mut buffer = AlignedBuffer::<256>::new();
        let arena = ConcurrentLinearAllocator::new(buffer.as_mut_slice());
        let info = source_info!();

        let a = arena.allocate(10, 8, &info);
        assert!(!a.is_null());
        assert_eq!(a.ptr.addr() % 8, 0);
        assert_eq!(a.num_bytes, 17);

        let b = arena.allocate(16, 16, &info);
        assert!(!b.is_null());
        assert_eq!(b.ptr.addr() % 16, 0);
        assert!(b.num_bytes >= 16);
        assert!(b.ptr.addr() >= a.ptr.addr() + a.num_bytes);

        assert!(arena.allocate(0, 8, &info).is_null());
        assert_eq!(arena.used_memory(), 17 + 31);
    }

    #[test]
    fn exhaustion_and_clear() {
        let mut buffer = AlignedBuffer::<64>::new();
        let arena = ConcurrentLinearAllocator::new(buffer.as_mut_slice());
        let info = source_info!();

        assert!(!arena.allocate(60, 1, &info).is_null());
        assert!(arena.allocate(8, 1, &info).is_null());
        assert_eq!(arena.used_memory(), 64);

        // Deallocation does nothing, clear resets everything.
        let first = arena.allocate(1, 1, &info);
        assert!(first.is_null());

        arena.clear();
        assert_eq!(arena.used_memory(), 0);
        assert!(!arena.allocate(64, 1, &info).is_null());
    }

    #[test]
    fn threads_get_disjoint_blocks() {
        let num_threads = 8;
        let allocations_per_thread = if cfg!(miri) { 4 } else { 64 };
        let block_size = 24;
        let alignment = 8;

        let capacity = num_threads * allocations_per_thread * (block_size + alignment - 1);
        let mut memory = vec![0u8; capacity];
        let arena = ConcurrentLinearAllocator::new(&mut memory);
        let barrier = Barrier::new(num_threads);

        let mut all_blocks = thread::scope(|scope| {
            let handles: Vec<_> = (0..num_threads)
                .map(|thread_id| {
                    let arena = &arena;
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        let mut blocks = Vec::new();
                        for _ in 0..allocations_per_thread {
                            let block = arena.allocate(block_size, alignment, &source_info!());
                            assert!(!block.is_null());
                            assert_eq!(block.ptr.addr() % alignment, 0);
                            unsafe { block.ptr.write_bytes(thread_id as u8, block_size) };
                            blocks.push((block.ptr.addr(), thread_id as u8));
                        }
                        blocks
                    })
                })
                .collect();

            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });

        // Everything fits exactly, so the next request fails.
        assert!(arena.allocate(1, 1, &source_info!()).is_null());

        all_blocks.sort();
        for pair in all_blocks.windows(2) {
            assert!(pair[0].0 + block_size <= pair[1].0);
        }

        for (address, thread_id) in all_blocks {
            let offset = address - memory.as_ptr().addr();
            assert!(memory[offset..offset + block_size]
                .iter()
                .all(|byte| *byte == thread_id));
        }
    }
}

use std::sync::OnceLock;

use crate::{
    platform::SystemAllocator,
    policy::{NoLock, NoTracking},
    AllocatorView, MemoryManager,
};

#[cfg(debug_assertions)]
type HeapMarking = crate::policy::Marked;
#[cfg(debug_assertions)]
type HeapBoundCheck = crate::policy::Checked;

#[cfg(not(debug_assertions))]
type HeapMarking = crate::policy::Unmarked;
#[cfg(not(debug_assertions))]
type HeapBoundCheck = crate::policy::Unchecked;

/// Process wide heap over the C runtime allocator. Debug builds mark memory
/// and surround every block with guard zones, release builds pass requests
/// straight through. No lock is needed because the C runtime is already
/// thread safe.
pub type DefaultHeap =
    MemoryManager<SystemAllocator, HeapMarking, HeapBoundCheck, NoTracking, NoLock>;

static DEFAULT_HEAP: OnceLock<DefaultHeap> = OnceLock::new();

/// Returns the process wide heap, creating it on first use.
pub fn default_heap() -> &'static DefaultHeap {
    DEFAULT_HEAP.get_or_init(|| MemoryManager::new(SystemAllocator))
}

/// Type erased view of [`default_heap`].
pub fn default_heap_view() -> AllocatorView<'static> {
    AllocatorView::new(default_heap())
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::{source_info, Allocator};

    #[test]
    fn single_instance() {
        assert!(std::ptr::eq(default_heap(), default_heap()));
        assert!(default_heap_view().points_to_same(&default_heap_view()));
    }

    #[test]
    fn allocate_from_many_threads() {
        let iterations = if cfg!(miri) { 10 } else { 500 };

        thread::scope(|scope| {
            for thread_id in 0..4u8 {
                scope.spawn(move || {
                    let heap = default_heap();
                    for i in 1..=iterations {
                        let block = heap.allocate(i, 16, &source_info!());
                        assert!(!block.is_null());
                        assert_eq!(block.ptr.addr() % 16, 0);
                        unsafe {
                            block.ptr.write_bytes(thread_id, i);
                            heap.deallocate(block.non_null().unwrap(), i, 16);
                        }
                    }
                });
            }
        });
    }

    #[cfg(debug_assertions)]
    #[test]
    fn debug_heap_marks_memory() {
        let block = default_heap_view().allocate(32, 8, &source_info!());

        unsafe {
            let bytes = std::slice::from_raw_parts(block.ptr, block.num_bytes);
            assert!(bytes
                .iter()
                .all(|byte| *byte == crate::policy::ALLOCATED_BYTE_PATTERN));
            default_heap().deallocate(block.non_null().unwrap(), 32, 8);
        }
    }
}

use std::{cell::Cell, marker::PhantomData, mem, ptr::NonNull};

use log::{debug, trace};

use crate::{
    alignment::{align_pointer, align_size, is_valid_alignment, POINTER_SIZE},
    assertion::mem_assert,
    AllocationResult, AllocationSourceInfo, Allocator, Pointer,
};

/// Every block, free or used, starts with its size.
#[repr(C)]
struct AllocationHeader {
    /// Bytes after the header, so a free block's `next` is part of it.
    size: usize,
}

/// Free blocks reuse the first bytes after the header to link to the next
/// free block. This is how a block looks like in memory:
///
/// ```text
///       used block                 free block
/// +--------------------+    +--------------------+
/// | size               |    | size               |
/// +--------------------+    +--------------------+
/// |                    |    | next free block    |
/// | user data          |    +--------------------+
/// |                    |    | (unused)           |
/// +--------------------+    +--------------------+
/// ```
#[repr(C)]
struct FreeListNode {
    header: AllocationHeader,
    next: Pointer<FreeListNode>,
}

const HEADER_SIZE: usize = mem::size_of::<AllocationHeader>();
const NODE_SIZE: usize = mem::size_of::<FreeListNode>();
const NATURAL_ALIGNMENT: usize = mem::align_of::<FreeListNode>();

/// Over-aligned requests store the distance to the real block in the byte
/// right before the user pointer, so it can't exceed `u8::MAX`.
const MAX_ALIGNMENT: usize = 128;

impl FreeListNode {
    fn begin(node: NonNull<FreeListNode>) -> usize {
        node.as_ptr().addr()
    }

    unsafe fn end(node: NonNull<FreeListNode>) -> usize {
        Self::begin(node) + HEADER_SIZE + node.as_ref().header.size
    }
}

/// General purpose allocator over a fixed buffer. Free blocks form a singly
/// linked list sorted by address. Allocation takes the first block that fits
/// and splits it if the rest is big enough to be a block of its own.
/// Deallocation inserts the block back in address order and merges it with
/// the free blocks right before and right after it, so fragmentation only
/// depends on the allocation pattern:
///
/// ```text
/// free_list
///    |
///    v
/// +------+------+------+------+------+------+
/// | Free | Used | Free | Used | Used | Free |
/// +--|---+------+--^-|-+------+------+--^---+
///    |             | |                  |
///    +-------------+ +------------------+
/// ```
pub struct FreeListAllocator<'a> {
    free_list: Cell<Pointer<FreeListNode>>,
    memory_begin: *mut u8,
    memory_end: *mut u8,
    marker: PhantomData<&'a mut [u8]>,
}

unsafe impl Send for FreeListAllocator<'_> {}

impl<'a> FreeListAllocator<'a> {
    pub fn new(memory: &'a mut [u8]) -> Self {
        let raw_begin = memory.as_mut_ptr();
        let raw_end = raw_begin.wrapping_add(memory.len());

        let memory_begin = align_pointer(raw_begin, NATURAL_ALIGNMENT);
        let usable = raw_end.addr().saturating_sub(memory_begin.addr()) & !(NATURAL_ALIGNMENT - 1);

        mem_assert!(
            usable >= NODE_SIZE,
            "Not enough memory for a free list ({} bytes)",
            memory.len()
        );

        let allocator = Self {
            free_list: Cell::new(None),
            memory_begin,
            memory_end: memory_begin.wrapping_add(usable),
            marker: PhantomData,
        };

        allocator.reset();

        allocator
    }

    /// Turns the whole buffer back into one free block.
    pub fn reset(&self) {
        if self.total_memory() < NODE_SIZE {
            self.free_list.set(None);
            return;
        }

        let node = self.memory_begin.cast::<FreeListNode>();

        unsafe {
            node.write(FreeListNode {
                header: AllocationHeader {
                    size: self.total_memory() - HEADER_SIZE,
                },
                next: None,
            });
        }

        self.free_list.set(NonNull::new(node));
    }

    pub fn total_memory(&self) -> usize {
        self.memory_end.addr() - self.memory_begin.addr()
    }

    /// Number of blocks in the free list.
    pub fn free_block_count(&self) -> usize {
        self.free_blocks().count()
    }

    /// Bytes available in the biggest free block.
    pub fn largest_free_block(&self) -> usize {
        self.free_blocks().max().unwrap_or(0)
    }

    /// Sizes of the free blocks in address order.
    fn free_blocks(&self) -> impl Iterator<Item = usize> + '_ {
        let mut current = self.free_list.get();

        std::iter::from_fn(move || {
            let node = current?;
            // SAFETY: Every node in the list lives inside our buffer.
            unsafe {
                current = node.as_ref().next;
                Some(node.as_ref().header.size)
            }
        })
    }

    /// Requests smaller than a pointer still need room for `next` once they
    /// are freed, and every block keeps headers naturally aligned.
    fn internal_size(size: usize) -> usize {
        align_size(size.max(POINTER_SIZE), NATURAL_ALIGNMENT)
    }

    /// First fit allocation of `size` bytes at the natural alignment. `size`
    /// must come from [`FreeListAllocator::internal_size`].
    unsafe fn allocate_internal(&self, size: usize) -> AllocationResult {
        let mut previous: Pointer<FreeListNode> = None;
        let mut current = self.free_list.get();

        while let Some(mut node) = current {
            let block_size = node.as_ref().header.size;

            if block_size < size {
                previous = current;
                current = node.as_ref().next;
                continue;
            }

            let space_after = block_size - size;

            let replacement = if space_after > NODE_SIZE {
                // Split: the tail end becomes a new free block that takes
                // this block's place in the list.
                let split = node
                    .as_ptr()
                    .cast::<u8>()
                    .add(HEADER_SIZE + size)
                    .cast::<FreeListNode>();
                split.write(FreeListNode {
                    header: AllocationHeader {
                        size: space_after - HEADER_SIZE,
                    },
                    next: node.as_ref().next,
                });
                node.as_mut().header.size = size;

                NonNull::new(split)
            } else {
                node.as_ref().next
            };

            match previous {
                Some(mut previous) => previous.as_mut().next = replacement,
                None => self.free_list.set(replacement),
            }

            let user = node.as_ptr().cast::<u8>().add(HEADER_SIZE);

            return AllocationResult::new(user, node.as_ref().header.size);
        }

        trace!(
            "FreeListAllocator out of memory: {size} bytes requested, largest free block {}",
            self.largest_free_block()
        );

        AllocationResult::null()
    }

    /// Puts the block whose user data starts at `ptr` back in the free list.
    /// `used_bytes` is how much of the block the caller claims to have used.
    unsafe fn deallocate_internal(&self, ptr: *mut u8, used_bytes: usize) {
        mem_assert!(
            ptr.addr() >= self.memory_begin.addr() + HEADER_SIZE
                && ptr.addr() < self.memory_end.addr(),
            "Pointer {:p} doesn't belong to this FreeListAllocator",
            ptr
        );

        let mut node = NonNull::new_unchecked(ptr.sub(HEADER_SIZE).cast::<FreeListNode>());

        mem_assert!(
            used_bytes <= node.as_ref().header.size,
            "Deallocating {} bytes from a block of {} bytes",
            used_bytes,
            node.as_ref().header.size
        );

        let node_begin = FreeListNode::begin(node);
        let node_end = FreeListNode::end(node);

        // Find the free neighbours: `previous` ends at or before the block,
        // `current` starts at or after it.
        let mut previous: Pointer<FreeListNode> = None;
        let mut current = self.free_list.get();

        while let Some(free) = current {
            if FreeListNode::begin(free) >= node_end {
                break;
            }

            mem_assert!(
                FreeListNode::end(free) <= node_begin,
                "Block at {:p} is already free",
                ptr
            );

            previous = current;
            current = free.as_ref().next;
        }

        match current {
            Some(next) if FreeListNode::begin(next) == node_end => {
                node.as_mut().header.size += HEADER_SIZE + next.as_ref().header.size;
                node.as_mut().next = next.as_ref().next;
                debug!("FreeListAllocator merged block at {node_begin:#x} with next");
            }
            _ => node.as_mut().next = current,
        }

        match previous {
            Some(mut previous) if FreeListNode::end(previous) == node_begin => {
                previous.as_mut().header.size += HEADER_SIZE + node.as_ref().header.size;
                previous.as_mut().next = node.as_ref().next;
                debug!("FreeListAllocator merged block at {node_begin:#x} with previous");
            }
            Some(mut previous) => previous.as_mut().next = Some(node),
            None => self.free_list.set(Some(node)),
        }
    }
}

unsafe impl Allocator for FreeListAllocator<'_> {
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

        if alignment <= NATURAL_ALIGNMENT {
            return unsafe { self.allocate_internal(Self::internal_size(size)) };
        }

        mem_assert!(
            alignment <= MAX_ALIGNMENT,
            "Alignment {} is above the maximum of {}",
            alignment,
            MAX_ALIGNMENT
        );

        // Worst case: one byte for the offset plus alignment - 1 of padding.
        let Some(raw_size) = size.checked_add(alignment) else {
            return AllocationResult::null();
        };

        let raw = unsafe { self.allocate_internal(Self::internal_size(raw_size)) };
        if raw.is_null() {
            return raw;
        }

        let user = align_pointer(raw.ptr.wrapping_add(1), alignment);
        let offset = user.addr() - raw.ptr.addr();

        unsafe { user.sub(1).write(offset as u8) };

        AllocationResult::new(user, raw.num_bytes - offset)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        let ptr = ptr.as_ptr();

        if alignment <= NATURAL_ALIGNMENT {
            self.deallocate_internal(ptr, size);
        } else {
            let offset = ptr.sub(1).read() as usize;
            self.deallocate_internal(ptr.sub(offset), size + offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{source_info, test_utils::AlignedBuffer};

    #[test]
    fn starts_with_one_block() {
        let mut buffer = AlignedBuffer::<1024>::new();
        let allocator = FreeListAllocator::new(buffer.as_mut_slice());

        assert_eq!(allocator.total_memory(), 1024);
        assert_eq!(allocator.free_block_count(), 1);
        assert_eq!(allocator.largest_free_block(), 1024 - HEADER_SIZE);
    }

    #[test]
    fn first_fit_and_split() {
        let mut buffer = AlignedBuffer::<1024>::new();
        let allocator = FreeListAllocator::new(buffer.as_mut_slice());
        let info = source_info!();

        let a = allocator.allocate(100, 8, &info);
        assert!(!a.is_null());
        assert_eq!(a.num_bytes, 104);
        assert_eq!(allocator.free_block_count(), 1);
        assert_eq!(
            allocator.largest_free_block(),
            1024 - HEADER_SIZE - 104 - HEADER_SIZE
        );

        let b = allocator.allocate(1, 1, &info);
        assert_eq!(b.num_bytes, POINTER_SIZE.max(NATURAL_ALIGNMENT));
        assert_eq!(b.ptr.addr(), a.ptr.addr() + 104 + HEADER_SIZE);
    }

    #[test]
    fn remainder_too_small_is_not_split() {
        let mut buffer = AlignedBuffer::<128>::new();
        let allocator = FreeListAllocator::new(buffer.as_mut_slice());

        // Leaves exactly NODE_SIZE bytes, not enough for another block.
        let size = 128 - HEADER_SIZE - NODE_SIZE;
        let block = allocator.allocate(size, 8, &source_info!());

        assert_eq!(block.num_bytes, 128 - HEADER_SIZE);
        assert_eq!(allocator.free_block_count(), 0);
        assert!(allocator.allocate(1, 1, &source_info!()).is_null());
    }

    #[test]
    fn coalesce_in_any_order() {
        let mut buffer = AlignedBuffer::<1024>::new();
        let allocator = FreeListAllocator::new(buffer.as_mut_slice());
        let info = source_info!();

        let orders: [[usize; 3]; 4] = [[0, 1, 2], [2, 1, 0], [0, 2, 1], [1, 0, 2]];

        for order in orders {
            let blocks: Vec<_> = (0..3).map(|_| allocator.allocate(64, 8, &info)).collect();
            assert!(blocks.iter().all(|block| !block.is_null()));

            for index in order {
                unsafe { allocator.deallocate(blocks[index].non_null().unwrap(), 64, 8) };
            }

            assert_eq!(allocator.free_block_count(), 1);
            assert_eq!(allocator.largest_free_block(), 1024 - HEADER_SIZE);
        }
    }

    #[test]
    fn holes_are_reused() {
        let mut buffer = AlignedBuffer::<1024>::new();
        let allocator = FreeListAllocator::new(buffer.as_mut_slice());
        let info = source_info!();

        let a = allocator.allocate(64, 8, &info);
        let b = allocator.allocate(64, 8, &info);
        let _c = allocator.allocate(64, 8, &info);

        unsafe { allocator.deallocate(b.non_null().unwrap(), 64, 8) };
        assert_eq!(allocator.free_block_count(), 2);

        let again = allocator.allocate(32, 8, &info);
        assert_eq!(again.ptr, b.ptr);

        unsafe {
            allocator.deallocate(a.non_null().unwrap(), 64, 8);
            allocator.deallocate(again.non_null().unwrap(), again.num_bytes, 8);
        }
    }

    #[test]
    fn over_aligned_requests() {
        let mut buffer = AlignedBuffer::<2048>::new();
        let allocator = FreeListAllocator::new(buffer.as_mut_slice());
        let info = source_info!();

        let mut blocks = Vec::new();
        for alignment in [16, 32, 64, 128] {
            allocator.allocate(3, 1, &info);
            let block = allocator.allocate(40, alignment, &info);
            assert!(!block.is_null());
            assert_eq!(block.ptr.addr() % alignment, 0);
            assert!(block.num_bytes >= 40);
            blocks.push((block, alignment));
        }

        for (block, alignment) in blocks {
            unsafe { allocator.deallocate(block.non_null().unwrap(), block.num_bytes, alignment) };
        }
    }

    #[test]
    fn exhaust_and_recover() {
        let mut buffer = AlignedBuffer::<512>::new();
        let allocator = FreeListAllocator::new(buffer.as_mut_slice());
        let info = source_info!();

        let mut blocks = Vec::new();
        loop {
            let block = allocator.allocate(24, 8, &info);
            if block.is_null() {
                break;
            }
            blocks.push(block);
        }
        assert!(!blocks.is_empty());

        for block in blocks.iter().rev().step_by(2) {
            unsafe { allocator.deallocate(block.non_null().unwrap(), 24, 8) };
        }
        for block in blocks.iter().rev().skip(1).step_by(2) {
            unsafe { allocator.deallocate(block.non_null().unwrap(), 24, 8) };
        }

        assert_eq!(allocator.free_block_count(), 1);
        assert_eq!(allocator.largest_free_block(), 512 - HEADER_SIZE);
    }

    #[test]
    #[should_panic(expected = "is already free")]
    fn double_free() {
        let mut buffer = AlignedBuffer::<256>::new();
        let allocator = FreeListAllocator::new(buffer.as_mut_slice());
        let info = source_info!();

        let a = allocator.allocate(32, 8, &info);
        let _b = allocator.allocate(32, 8, &info);

        unsafe {
            allocator.deallocate(a.non_null().unwrap(), 32, 8);
            allocator.deallocate(a.non_null().unwrap(), 32, 8);
        }
    }
}

use std::{cell::Cell, marker::PhantomData, mem, ptr::NonNull};

use log::trace;

use crate::{
    alignment::{align_pointer, align_size, is_valid_alignment},
    assertion::mem_assert,
    AllocationResult, AllocationSourceInfo, Allocator, Pointer,
};

/// Free blocks store the link to the next free block in their own first
/// bytes, so a free list costs no memory at all:
///
/// ```text
///  pool_head
///     |
///     v
/// +--------+--------+--------+--------+--------+
/// | next --+--------+-> next-+--------+-> None |
/// +--------+--------+--------+--------+--------+
///  block 0  block 1  block 2  block 3  block 4
///           (used)            (used)
/// ```
#[repr(C)]
pub struct PoolBlock {
    pub next: Pointer<PoolBlock>,
}

/// Result of threading a region into a free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSetup {
    pub head: Pointer<PoolBlock>,
    pub tail: Pointer<PoolBlock>,
    pub num_blocks: usize,
}

/// Splits `[memory, memory + memory_size)` into as many `block_size` blocks
/// as fit after aligning the start to `alignment`, and links them in address
/// order. The last block points to `None`.
///
/// # Safety
///
/// The region must be valid for writes. `block_size` must be a multiple of
/// `alignment` and at least `size_of::<PoolBlock>()`, `alignment` at least
/// `align_of::<PoolBlock>()`.
pub unsafe fn setup_pool(
    memory: *mut u8,
    memory_size: usize,
    block_size: usize,
    alignment: usize,
) -> PoolSetup {
    let first = align_pointer(memory, alignment);
    let padding = first.addr() - memory.addr();
    let num_blocks = memory_size.saturating_sub(padding) / block_size;

    if num_blocks == 0 {
        return PoolSetup {
            head: None,
            tail: None,
            num_blocks: 0,
        };
    }

    let block_at = |index: usize| first.add(index * block_size).cast::<PoolBlock>();

    for index in 0..num_blocks - 1 {
        block_at(index).write(PoolBlock {
            next: NonNull::new(block_at(index + 1)),
        });
    }

    let tail = block_at(num_blocks - 1);
    tail.write(PoolBlock { next: None });

    PoolSetup {
        head: NonNull::new(block_at(0)),
        tail: NonNull::new(tail),
        num_blocks,
    }
}

/// Pops the first block of the free list starting at `head`.
///
/// # Safety
///
/// Every block in the list must be a valid [`PoolBlock`].
pub(crate) unsafe fn pop_block(head: &Cell<Pointer<PoolBlock>>) -> Pointer<PoolBlock> {
    let block = head.get()?;
    head.set(block.as_ref().next);
    Some(block)
}

/// Pushes `block` to the front of the free list starting at `head`.
///
/// # Safety
///
/// `block` must be valid for writes of a [`PoolBlock`] and not in the list.
pub(crate) unsafe fn push_block(head: &Cell<Pointer<PoolBlock>>, block: NonNull<PoolBlock>) {
    block.as_ptr().write(PoolBlock { next: head.get() });
    head.set(Some(block));
}

/// Fixed size block allocator over a fixed buffer. Allocation and
/// deallocation are O(1) pushes and pops on an intrusive free list, see
/// [`PoolBlock`]. Every request gets a whole block, so `num_bytes` is always
/// [`PoolAllocator::block_size`].
pub struct PoolAllocator<'a> {
    /// First block, already aligned.
    memory_begin: *mut u8,
    /// One past the last block.
    memory_end: *mut u8,
    /// Distance between consecutive blocks.
    block_size: usize,
    alignment: usize,
    num_blocks: usize,
    pool_head: Cell<Pointer<PoolBlock>>,
    marker: PhantomData<&'a mut [u8]>,
}

unsafe impl Send for PoolAllocator<'_> {}

impl<'a> PoolAllocator<'a> {
    /// Creates a pool of `block_size` blocks aligned to `alignment`. Blocks
    /// are at least as big and as aligned as a pointer, and their size is
    /// rounded up to a multiple of the alignment.
    pub fn new(memory: &'a mut [u8], block_size: usize, alignment: usize) -> Self {
        mem_assert!(
            is_valid_alignment(alignment),
            "The alignment ({}) must be a non-zero power of two",
            alignment
        );

        let alignment = alignment.max(mem::align_of::<PoolBlock>());
        let block_size = align_size(block_size.max(mem::size_of::<PoolBlock>()), alignment);

        let memory_begin = align_pointer(memory.as_mut_ptr(), alignment);
        let padding = memory_begin.addr() - memory.as_ptr().addr();
        let num_blocks = memory.len().saturating_sub(padding) / block_size;

        let pool = Self {
            memory_begin,
            memory_end: memory_begin.wrapping_add(num_blocks * block_size),
            block_size,
            alignment,
            num_blocks,
            pool_head: Cell::new(None),
            marker: PhantomData,
        };

        pool.reset();

        pool
    }

    /// Puts every block back in the free list. Outstanding pointers must not
    /// be used afterwards.
    pub fn reset(&self) {
        // SAFETY: The region was borrowed mutably for 'a and every block in
        // it is about to become free.
        let setup = unsafe {
            setup_pool(
                self.memory_begin,
                self.num_blocks * self.block_size,
                self.block_size,
                self.alignment,
            )
        };

        self.pool_head.set(setup.head);
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn block_count(&self) -> usize {
        self.num_blocks
    }

    /// Index of the block that starts at `ptr`.
    pub fn index_of(&self, ptr: NonNull<u8>) -> usize {
        self.assert_owns(ptr);
        (ptr.as_ptr().addr() - self.memory_begin.addr()) / self.block_size
    }

    /// Block number `index`, whether it is free or not.
    pub fn from_index(&self, index: usize) -> NonNull<u8> {
        mem_assert!(
            index < self.num_blocks,
            "Block index {} out of range (0..{})",
            index,
            self.num_blocks
        );

        // SAFETY: `memory_begin` is not null and the index is in range.
        unsafe { NonNull::new_unchecked(self.memory_begin.add(index * self.block_size)) }
    }

    fn assert_owns(&self, ptr: NonNull<u8>) {
        let address = ptr.as_ptr().addr();

        mem_assert!(
            address >= self.memory_begin.addr() && address < self.memory_end.addr(),
            "Pointer {:p} doesn't belong to this pool",
            ptr
        );
        mem_assert!(
            (address - self.memory_begin.addr()) % self.block_size == 0,
            "Pointer {:p} is not the start of a block",
            ptr
        );
    }
}

unsafe impl Allocator for PoolAllocator<'_> {
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        _source_info: &AllocationSourceInfo,
    ) -> AllocationResult {
        mem_assert!(
            size <= self.block_size,
            "Requested {} bytes from a pool of {} byte blocks",
            size,
            self.block_size
        );
        mem_assert!(
            alignment <= self.alignment,
            "Requested alignment {} is stricter than the pool alignment {}",
            alignment,
            self.alignment
        );

        if size == 0 {
            return AllocationResult::null();
        }

        // SAFETY: Only blocks of this pool are ever pushed to the list.
        match unsafe { pop_block(&self.pool_head) } {
            Some(block) => AllocationResult::new(block.as_ptr().cast(), self.block_size),
            None => {
                trace!("PoolAllocator exhausted ({} blocks)", self.num_blocks);
                AllocationResult::null()
            }
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _size: usize, _alignment: usize) {
        self.assert_owns(ptr);
        push_block(&self.pool_head, ptr.cast());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{source_info, test_utils::AlignedBuffer};

    #[test]
    fn setup_links_blocks_in_address_order() {
        let mut buffer = AlignedBuffer::<256>::new();
        let memory = buffer.as_mut_slice().as_mut_ptr();

        // Start one byte in so the first block has to be aligned.
        let setup = unsafe { setup_pool(memory.wrapping_add(1), 255, 32, 16) };

        assert_eq!(setup.num_blocks, 7);
        let head = setup.head.unwrap();
        assert_eq!(head.as_ptr().addr(), memory.addr() + 16);
        assert_eq!(setup.tail.unwrap().as_ptr().addr(), memory.addr() + 16 + 6 * 32);

        let mut count = 0;
        let mut current = setup.head;
        let mut previous = 0;
        while let Some(block) = current {
            assert!(block.as_ptr().addr() > previous);
            previous = block.as_ptr().addr();
            count += 1;
            current = unsafe { block.as_ref().next };
        }
        assert_eq!(count, 7);
    }

    #[test]
    fn setup_too_small() {
        let mut buffer = AlignedBuffer::<64>::new();
        let setup = unsafe { setup_pool(buffer.as_mut_slice().as_mut_ptr(), 31, 32, 8) };
        assert_eq!(setup.num_blocks, 0);
        assert!(setup.head.is_none());
        assert!(setup.tail.is_none());
    }

    #[test]
    fn allocate_every_block_then_fail() {
        let mut buffer = AlignedBuffer::<1024>::new();
        let pool = PoolAllocator::new(buffer.as_mut_slice(), 24, 8);
        let info = source_info!();

        assert_eq!(pool.block_size(), 24);
        assert_eq!(pool.block_count(), 1024 / 24);

        let blocks: Vec<_> = (0..pool.block_count())
            .map(|_| pool.allocate(24, 8, &info))
            .collect();

        assert!(blocks.iter().all(|block| !block.is_null()));
        assert!(blocks.iter().all(|block| block.num_bytes == 24));
        assert!(pool.allocate(24, 8, &info).is_null());

        // LIFO reuse.
        let last = blocks[5].non_null().unwrap();
        unsafe { pool.deallocate(last, 24, 8) };
        assert_eq!(pool.allocate(1, 1, &info).ptr, last.as_ptr());
    }

    #[test]
    fn block_size_is_rounded_up() {
        let mut buffer = AlignedBuffer::<256>::new();

        let pool = PoolAllocator::new(buffer.as_mut_slice(), 1, 1);
        assert_eq!(pool.block_size(), mem::size_of::<PoolBlock>());
        assert_eq!(pool.alignment(), mem::align_of::<PoolBlock>());
        drop(pool);

        let pool = PoolAllocator::new(buffer.as_mut_slice(), 20, 16);
        assert_eq!(pool.block_size(), 32);
        assert_eq!(pool.block_count(), 8);
    }

    #[test]
    fn index_round_trip() {
        let mut buffer = AlignedBuffer::<512>::new();
        let pool = PoolAllocator::new(buffer.as_mut_slice(), 64, 64);

        for index in 0..pool.block_count() {
            assert_eq!(pool.index_of(pool.from_index(index)), index);
        }

        let first = pool.allocate(64, 64, &source_info!());
        assert_eq!(pool.index_of(first.non_null().unwrap()), 0);
    }

    #[test]
    fn reset_frees_everything() {
        let mut buffer = AlignedBuffer::<128>::new();
        let pool = PoolAllocator::new(buffer.as_mut_slice(), 32, 8);
        let info = source_info!();

        while !pool.allocate(32, 8, &info).is_null() {}
        pool.reset();

        let first = pool.allocate(32, 8, &info);
        assert_eq!(first.ptr, pool.from_index(0).as_ptr());
    }

    #[test]
    #[should_panic(expected = "doesn't belong to this pool")]
    fn foreign_pointer() {
        let mut buffer = AlignedBuffer::<128>::new();
        let pool = PoolAllocator::new(buffer.as_mut_slice(), 32, 8);
        let mut other = [0u64; 4];

        unsafe { pool.deallocate(NonNull::from(&mut other).cast(), 32, 8) };
    }

    #[test]
    #[should_panic(expected = "bytes from a pool of")]
    fn oversized_request() {
        let mut buffer = AlignedBuffer::<128>::new();
        let pool = PoolAllocator::new(buffer.as_mut_slice(), 32, 8);
        pool.allocate(33, 8, &source_info!());
    }
}

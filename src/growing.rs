use std::{cell::Cell, mem, ptr::NonNull};

use log::trace;

use crate::{
    alignment::{align_size, is_valid_alignment},
    assertion::mem_assert,
    pool::{pop_block, push_block, setup_pool},
    AllocationResult, AllocationSourceInfo, Allocator, PoolBlock, Pointer,
};

/// Written at the end of every chunk to link all chunks together.
#[repr(C)]
struct ChunkFooter {
    next: Pointer<ChunkFooter>,
}

const FOOTER_SIZE: usize = mem::size_of::<ChunkFooter>();

/// Pool allocator that asks a parent allocator for a new chunk of blocks
/// whenever it runs out. Chunks are only returned to the parent by
/// [`GrowingPoolAllocator::free_memory`] or on drop.
///
/// Each chunk is a run of blocks followed by a footer:
///
/// ```text
///  chunks
///    |
///    v
/// +-------+-------+-------+--------+      +-------+-------+-------+--------+
/// | block | block | block | footer-+----> | block | block | block | footer-+-> None
/// +-------+-------+-------+--------+      +-------+-------+-------+--------+
/// <---- chunk_memory_size ---->
/// ```
///
/// Free blocks of all chunks share a single free list, see [`PoolBlock`].
pub struct GrowingPoolAllocator<P: Allocator> {
    parent: P,
    /// Distance between consecutive blocks.
    block_size: usize,
    alignment: usize,
    /// Bytes of blocks per chunk, the footer comes right after.
    chunk_memory_size: usize,
    chunks: Cell<Pointer<ChunkFooter>>,
    num_chunks: Cell<usize>,
    pool_head: Cell<Pointer<PoolBlock>>,
}

unsafe impl<P: Allocator + Send> Send for GrowingPoolAllocator<P> {}

impl<P: Allocator> GrowingPoolAllocator<P> {
    /// No memory is requested until the first allocation.
    pub fn new(parent: P, block_size: usize, alignment: usize, blocks_per_chunk: usize) -> Self {
        mem_assert!(block_size > 0, "Block size must be greater than zero");
        mem_assert!(blocks_per_chunk > 0, "A chunk needs at least one block");
        mem_assert!(
            is_valid_alignment(alignment),
            "The alignment ({}) must be a non-zero power of two",
            alignment
        );

        let alignment = alignment
            .max(mem::align_of::<PoolBlock>())
            .max(mem::align_of::<ChunkFooter>());
        let block_size = align_size(block_size.max(mem::size_of::<PoolBlock>()), alignment);

        Self {
            parent,
            block_size,
            alignment,
            chunk_memory_size: block_size * blocks_per_chunk,
            chunks: Cell::new(None),
            num_chunks: Cell::new(0),
            pool_head: Cell::new(None),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Chunks currently owned by this pool.
    pub fn chunk_count(&self) -> usize {
        self.num_chunks.get()
    }

    pub fn parent(&self) -> &P {
        &self.parent
    }

    fn chunk_allocation_size(&self) -> usize {
        self.chunk_memory_size + FOOTER_SIZE
    }

    /// First byte of the chunk that ends with `footer`.
    unsafe fn chunk_begin(&self, footer: NonNull<ChunkFooter>) -> *mut u8 {
        footer.as_ptr().cast::<u8>().sub(self.chunk_memory_size)
    }

    /// Requests one more chunk from the parent and threads its blocks into
    /// the free list. Returns `false` if the parent is out of memory.
    fn grow(&self, source_info: &AllocationSourceInfo) -> bool {
        let chunk = self.parent.allocate(
            self.chunk_allocation_size(),
            self.alignment,
            source_info,
        );

        if chunk.is_null() {
            trace!(
                "GrowingPoolAllocator parent refused a chunk of {} bytes",
                self.chunk_allocation_size()
            );
            return false;
        }

        unsafe {
            let footer = chunk.ptr.add(self.chunk_memory_size).cast::<ChunkFooter>();
            footer.write(ChunkFooter {
                next: self.chunks.get(),
            });
            self.chunks.set(NonNull::new(footer));
            self.num_chunks.set(self.num_chunks.get() + 1);

            self.link_chunk(chunk.ptr);
        }

        trace!(
            "GrowingPoolAllocator grew to {} chunks of {} bytes",
            self.num_chunks.get(),
            self.chunk_allocation_size()
        );

        true
    }

    /// Pushes every block of the chunk starting at `chunk` to the free list.
    unsafe fn link_chunk(&self, chunk: *mut u8) {
        let setup = setup_pool(chunk, self.chunk_memory_size, self.block_size, self.alignment);

        if let Some(mut tail) = setup.tail {
            tail.as_mut().next = self.pool_head.get();
            self.pool_head.set(setup.head);
        }
    }

    /// Puts every block of every chunk back in the free list while keeping
    /// the chunks. Outstanding pointers must not be used afterwards.
    pub fn clear(&self) {
        self.pool_head.set(None);

        let mut current = self.chunks.get();
        while let Some(footer) = current {
            unsafe {
                current = footer.as_ref().next;
                self.link_chunk(self.chunk_begin(footer));
            }
        }
    }

    /// Returns every chunk to the parent. Calling it again is a no-op.
    pub fn free_memory(&self) {
        let mut current = self.chunks.take();

        if current.is_some() {
            trace!(
                "GrowingPoolAllocator releasing {} chunks",
                self.num_chunks.get()
            );
        }

        while let Some(footer) = current {
            unsafe {
                current = footer.as_ref().next;
                let chunk = self.chunk_begin(footer);
                self.parent.deallocate(
                    NonNull::new_unchecked(chunk),
                    self.chunk_allocation_size(),
                    self.alignment,
                );
            }
        }

        self.pool_head.set(None);
        self.num_chunks.set(0);
    }
}

unsafe impl<P: Allocator> Allocator for GrowingPoolAllocator<P> {
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        source_info: &AllocationSourceInfo,
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

        loop {
            // SAFETY: Only blocks of our own chunks are in the list.
            if let Some(block) = unsafe { pop_block(&self.pool_head) } {
                return AllocationResult::new(block.as_ptr().cast(), self.block_size);
            }

            if !self.grow(source_info) {
                return AllocationResult::null();
            }
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, _alignment: usize) {
        mem_assert!(
            size <= self.block_size,
            "That allocation did not come from this allocator ({} bytes, blocks are {})",
            size,
            self.block_size
        );
        mem_assert!(
            ptr.as_ptr().addr() % self.alignment == 0,
            "Pointer {:p} is not aligned to the pool alignment {}",
            ptr,
            self.alignment
        );

        push_block(&self.pool_head, ptr.cast());
    }
}

impl<P: Allocator> Drop for GrowingPoolAllocator<P> {
    fn drop(&mut self) {
        self.free_memory();
    }
}

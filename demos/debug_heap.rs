use memkit::{
    policy::{ALLOCATED_BYTE_PATTERN, GUARD_BYTE_PATTERN},
    source_info, Allocator, Checked, CountingTracking, FreeListAllocator, Marked, MemoryManager,
    MutexLock, ScopedBuffer,
};

type DebugFreeList<'a> =
    MemoryManager<FreeListAllocator<'a>, Marked, Checked, CountingTracking, MutexLock>;

fn main() {
    let mut memory = vec![0u8; 64 * 1024];
    let heap = DebugFreeList::new(FreeListAllocator::new(&mut memory));

    let block = heap.allocate(24, 8, &source_info!());
    unsafe {
        println!(
            "Fresh memory is marked: {:#x} (expected {:#x})",
            block.ptr.read(),
            ALLOCATED_BYTE_PATTERN
        );
        println!(
            "Byte right after the block is a guard: {:#x} (expected {:#x})",
            block.ptr.add(block.num_bytes).read(),
            GUARD_BYTE_PATTERN
        );
        heap.deallocate(block.non_null().unwrap(), 24, 8);
    }

    // Share the heap between threads, the mutex serializes access.
    std::thread::scope(|scope| {
        for id in 0..4 {
            let heap = &heap;
            scope.spawn(move || {
                let mut buffer = ScopedBuffer::<u32, _>::new_in(heap);
                for len in 1..=64 {
                    buffer.resize(len).unwrap();
                    buffer[len - 1] = id;
                }
            });
        }
    });

    let tracking = heap.tracking();
    println!(
        "{} allocations, {} live, peak {} bytes",
        tracking.total_allocations(),
        tracking.live_allocations(),
        tracking.peak_bytes()
    );

    println!(
        "Free list is back to {} block(s)",
        heap.with_inner(|free_list| free_list.free_block_count())
    );

    println!("\nCorrupting a guard byte, this should panic:");
    let block = heap.allocate(16, 8, &source_info!());
    unsafe {
        block.ptr.add(block.num_bytes).write(0);
        heap.deallocate(block.non_null().unwrap(), 16, 8);
    }
}

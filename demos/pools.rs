use memkit::{
    default_heap_view, source_info, Allocator, FreeListAllocator, GrowingPoolAllocator,
    PoolAllocator,
};

#[derive(Debug)]
struct Node {
    value: u64,
    next: Option<std::ptr::NonNull<Node>>,
}

fn main() {
    let node_size = std::mem::size_of::<Node>();
    let node_alignment = std::mem::align_of::<Node>();

    // Fixed pool over a local buffer.
    let mut memory = vec![0u8; 16 * node_size + node_alignment];
    let pool = PoolAllocator::new(&mut memory, node_size, node_alignment);
    println!(
        "Pool with {} blocks of {} bytes",
        pool.block_count(),
        pool.block_size()
    );

    let mut head: Option<std::ptr::NonNull<Node>> = None;
    for value in 0.. {
        let block = pool.allocate(node_size, node_alignment, &source_info!());
        let Some(ptr) = block.non_null() else {
            println!("Pool exhausted after {value} nodes");
            break;
        };

        let node = ptr.cast::<Node>();
        unsafe { node.as_ptr().write(Node { value, next: head }) };
        head = Some(node);
    }

    while let Some(node) = head {
        unsafe {
            println!("Node {} in block {}", node.as_ref().value, pool.index_of(node.cast()));
            head = node.as_ref().next;
            pool.deallocate(node.cast(), node_size, node_alignment);
        }
    }

    // Growing pool that takes its chunks from the default heap.
    let growing = GrowingPoolAllocator::new(default_heap_view(), node_size, node_alignment, 8);
    let blocks: Vec<_> = (0..20)
        .map(|_| growing.allocate(node_size, node_alignment, &source_info!()))
        .collect();
    println!("\nGrowing pool: 20 blocks in {} chunks", growing.chunk_count());

    for block in blocks {
        unsafe { growing.deallocate(block.non_null().unwrap(), node_size, node_alignment) };
    }
    growing.free_memory();
    println!("Growing pool after free_memory: {} chunks", growing.chunk_count());

    // Free list with mixed sizes.
    let mut memory = vec![0u8; 4096];
    let free_list = FreeListAllocator::new(&mut memory);
    let info = source_info!();

    let sizes = [100, 37, 512, 8, 64];
    let blocks: Vec<_> = sizes
        .iter()
        .map(|size| (free_list.allocate(*size, 8, &info), *size))
        .collect();
    println!(
        "\nFree list after {} allocations: {} free blocks, largest {} bytes",
        blocks.len(),
        free_list.free_block_count(),
        free_list.largest_free_block()
    );

    for (block, size) in blocks.into_iter().step_by(2) {
        unsafe { free_list.deallocate(block.non_null().unwrap(), size, 8) };
    }
    println!(
        "Free list with holes: {} free blocks, largest {} bytes",
        free_list.free_block_count(),
        free_list.largest_free_block()
    );
}

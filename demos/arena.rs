use memkit::{source_info, Allocator, LinearAllocator, MemoryRequirements, StackAllocator};

/// A particle system laid out in one block: positions, velocities and a
/// handful of flags, each array properly aligned.
fn particles(arena: &LinearAllocator) {
    const COUNT: usize = 32;

    let mut requirements = MemoryRequirements::new();
    let positions = requirements.append_aligned::<[f32; 4]>(COUNT, 16).unwrap();
    let velocities = requirements.append_aligned::<[f32; 4]>(COUNT, 16).unwrap();
    let flags = requirements.append::<u8>(COUNT).unwrap();

    println!(
        "Particle block needs {} bytes aligned to {}",
        requirements.size, requirements.alignment
    );

    let Ok(base) = requirements.allocate(arena) else {
        println!("Arena is too small for the particle block");
        return;
    };

    unsafe {
        let positions = MemoryRequirements::place::<[f32; 4]>(base, positions);
        let velocities = MemoryRequirements::place::<[f32; 4]>(base, velocities);
        let flags = MemoryRequirements::place::<u8>(base, flags);

        for i in 0..COUNT {
            positions.add(i).write([i as f32, 0.0, 0.0, 1.0]);
            velocities.add(i).write([0.0, 1.0, 0.0, 0.0]);
            flags.add(i).write(1);
        }

        println!("Last particle at {:?}", positions.add(COUNT - 1).read());
    }
}

fn main() {
    let mut memory = vec![0u8; 4096];
    let arena = LinearAllocator::new(&mut memory);

    // Per frame scratch memory, released when the scope ends.
    for frame in 0..3 {
        let scope = arena.scope();
        particles(&scope);
        let scratch = scope.allocate(100 * (frame + 1), 8, &source_info!());
        println!(
            "Frame {frame}: scratch at {:p}, arena uses {} of {} bytes",
            scratch.ptr,
            arena.used_memory(),
            arena.total_memory()
        );
    }

    println!("After all frames the arena uses {} bytes\n", arena.used_memory());

    let mut memory = vec![0u8; 1024];
    let stack = StackAllocator::new(&mut memory);
    let info = source_info!();

    let a = stack.allocate(100, 8, &info);
    let b = stack.allocate(200, 64, &info);
    println!("Stack: A at {:p}, B at {:p}, {} bytes used", a.ptr, b.ptr, stack.used_memory());

    unsafe {
        stack.deallocate(b.non_null().unwrap(), 200, 64);
        println!("Stack: B freed, {} bytes used", stack.used_memory());
        stack.deallocate(a.non_null().unwrap(), 100, 8);
        println!("Stack: A freed, {} bytes used", stack.used_memory());
    }
}

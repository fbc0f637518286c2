//! # memkit
//!
//! A family of allocation strategies that all speak the same two-function
//! language:
//!
//! ```text
//! allocate(size, alignment, source_info) -> AllocationResult { ptr, num_bytes }
//! deallocate(ptr, size, alignment)
//! ```
//!
//! Every strategy implements [`Allocator`] directly, so generic code can use
//! them with zero indirection. When the concrete type can't be known (stored
//! in a struct, passed across a module boundary, used as the parent of another
//! allocator) any allocator can be turned into an [`AllocatorView`], a
//! copyable `(state pointer, dispatch functions)` pair.
//!
//! ```text
//!                        +---------------------------+
//!                        |       AllocatorView       |  type erased, Copy
//!                        +-------------+-------------+
//!                                      |
//!         +----------------------------+----------------------------+
//!         |                            |                            |
//! +-------+-------+          +---------+---------+          +-------+-------+
//! | MemoryManager |  wraps   |      Strategy     |  parent  | GrowingPool   |
//! | guards, marks +--------> | Linear, Stack,    | <--------+ asks a parent |
//! | tracking, lock|          | Pool, FreeList    |          | for chunks    |
//! +---------------+          +-------------------+          +---------------+
//! ```
//!
//! Strategies ([`LinearAllocator`], [`StackAllocator`], [`PoolAllocator`],
//! [`GrowingPoolAllocator`], [`FreeListAllocator`]) work over memory owned by
//! the caller or by a parent allocator and never touch the system heap on
//! their own. [`MemoryManager`] decorates any of them with guard bytes,
//! allocation marking, tracking hooks and locking without changing the
//! strategy itself. [`default_heap`] is a process wide manager over the C
//! runtime allocator.
//!
//! ## Failure model
//!
//! Running out of memory is not exceptional: every allocator returns
//! [`AllocationResult::null`] and the caller checks
//! [`AllocationResult::is_null`]. Misusing the API (freeing out of order,
//! passing foreign pointers, corrupting guard bytes) is a bug in the caller
//! and is reported by an assertion that panics, see the `assertions` feature.
//!
//! ## Threads
//!
//! None of the strategies are thread safe, they use [`std::cell::Cell`]
//! internally and are therefore `!Sync`. Wrap them in a [`MemoryManager`]
//! with [`MutexLock`] to share them, or use [`ConcurrentLinearAllocator`]
//! which is lock free.
//!
//! ## Quick start
//!
//! ```rust
//! use memkit::{source_info, Allocator, LinearAllocator};
//!
//! let mut memory = [0u8; 256];
//! let arena = LinearAllocator::new(&mut memory);
//!
//! let block = arena.allocate(64, 8, &source_info!());
//! assert!(!block.is_null());
//! assert!(block.num_bytes >= 64);
//!
//! arena.clear();
//! assert_eq!(arena.used_memory(), 0);
//! ```

use std::ptr::NonNull;

mod assertion;

pub mod alignment;
pub mod api;
mod allocator;
mod concurrent;
mod error;
mod freelist;
mod growing;
mod heap;
mod linear;
mod manager;
pub mod platform;
pub mod policy;
mod pool;
mod requirements;
mod scoped_buffer;
mod stack;

#[cfg(test)]
mod test_utils;

/// Non-null pointer to `T`. Intrusive links (free blocks, chunks) use this
/// instead of `*mut T` so that the end of a list has to be handled
/// explicitly.
pub type Pointer<T> = Option<NonNull<T>>;

pub use allocator::{AllocationResult, AllocationSourceInfo, Allocator, AllocatorView};
pub use concurrent::ConcurrentLinearAllocator;
pub use error::Error;
pub use freelist::FreeListAllocator;
pub use growing::GrowingPoolAllocator;
pub use heap::{default_heap, default_heap_view, DefaultHeap};
pub use linear::{LinearAllocator, LinearAllocatorSavePoint, LinearAllocatorScope};
pub use manager::MemoryManager;
pub use policy::{
    Checked, CountingTracking, LogTracking, Marked, MutexLock, NoLock, NoTracking, Unchecked,
    Unmarked,
};
pub use pool::{setup_pool, PoolAllocator, PoolBlock, PoolSetup};
pub use requirements::MemoryRequirements;
pub use scoped_buffer::ScopedBuffer;
pub use stack::StackAllocator;

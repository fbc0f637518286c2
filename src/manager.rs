use std::{marker::PhantomData, mem, ptr::NonNull};

use crate::{
    alignment::is_valid_alignment,
    assertion::mem_assert,
    policy::{
        BoundCheckPolicy, LockPolicy, MarkPolicy, NoLock, NoTracking, ThreadSafeWith,
        TrackAllocate, TrackDeallocate, TrackingPolicy, Unchecked, Unmarked,
    },
    AllocationResult, AllocationSourceInfo, Allocator,
};

/// Decorates an allocator with debugging and threading policies without
/// touching the allocator itself:
///
/// - `M`: [`MarkPolicy`], fills new and freed memory with known patterns.
/// - `B`: [`BoundCheckPolicy`], surrounds every block with guard zones.
/// - `T`: [`TrackingPolicy`], observes allocations and deallocations.
/// - `L`: [`LockPolicy`], serializes access.
///
/// With bounds checking enabled every allocation looks like this, where `G`
/// is the (raised) alignment of the request:
///
/// ```text
/// +-----------+-------------+-------------------------+-------------+
/// | user size | front guard |        user data        | back guard  |
/// +-----------+-------------+-------------------------+-------------+
/// <--- G ----><---- G -----> ^                         <---- G ---->
///                            |
///                            +-- pointer returned to the caller
/// ```
///
/// The first zone stores the usable size so that deallocation can find the
/// back guard and knows the whole extent of the block, even when the caller
/// passes back the size it requested instead of the size it got. Without
/// bounds checking the guards have size zero. The size header is kept as
/// long as marking or tracking needs it, and only a manager with every policy
/// disabled passes requests straight through.
pub struct MemoryManager<S, M = Unmarked, B = Unchecked, T = NoTracking, L = NoLock> {
    allocator: S,
    tracking: T,
    lock: L,
    policies: PhantomData<fn() -> (M, B)>,
}

impl<S, M, B, T, L> MemoryManager<S, M, B, T, L>
where
    S: Allocator,
    M: MarkPolicy,
    B: BoundCheckPolicy,
    T: TrackingPolicy,
    L: LockPolicy,
{
    pub fn new(allocator: S) -> Self {
        Self::with_policies(allocator, T::default(), L::default())
    }

    /// Uses the given tracking and lock instances instead of the defaults.
    pub fn with_policies(allocator: S, tracking: T, lock: L) -> Self {
        Self {
            allocator,
            tracking,
            lock,
            policies: PhantomData,
        }
    }

    pub fn tracking(&self) -> &T {
        &self.tracking
    }

    /// Runs `f` on the wrapped allocator while holding the lock.
    ///
    /// `f` must not call back into this manager: with [`MutexLock`] the lock
    /// is not reentrant and the thread deadlocks.
    ///
    /// [`MutexLock`]: crate::policy::MutexLock
    pub fn with_inner<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        let _guard = self.lock.lock();
        f(&self.allocator)
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.allocator
    }

    pub fn into_inner(self) -> S {
        self.allocator
    }

    /// Zone sizes for a request aligned to `alignment`.
    fn zones(alignment: usize) -> Zones {
        if !(B::ENABLED || M::ENABLED || T::ENABLED) {
            return Zones {
                header: 0,
                guard: 0,
                alignment,
            };
        }

        let alignment = alignment.max(mem::align_of::<usize>());

        Zones {
            header: alignment,
            guard: if B::ENABLED { alignment } else { 0 },
            alignment,
        }
    }
}

/// Bytes the manager adds around every user block.
#[derive(Clone, Copy)]
struct Zones {
    /// Stores the usable size of the block, zero when no policy needs it.
    header: usize,
    /// Size of each of the two guard zones.
    guard: usize,
    /// Alignment requested from the wrapped allocator.
    alignment: usize,
}

impl Zones {
    #[inline]
    fn overhead(&self) -> usize {
        self.header + 2 * self.guard
    }
}

impl<S: Allocator, M, B, T> MemoryManager<S, M, B, T, NoLock> {
    /// Direct access to the wrapped allocator, only without a lock.
    pub fn inner(&self) -> &S {
        &self.allocator
    }
}

unsafe impl<S, M, B, T, L> Allocator for MemoryManager<S, M, B, T, L>
where
    S: Allocator,
    M: MarkPolicy,
    B: BoundCheckPolicy,
    T: TrackingPolicy,
    L: LockPolicy,
{
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        source_info: &AllocationSourceInfo,
    ) -> AllocationResult {
        mem_assert!(
            is_valid_alignment(alignment),
            "The alignment ({}) must be a non-zero power of two",
            alignment
        );

        if size == 0 {
            return AllocationResult::null();
        }

        let zones = Self::zones(alignment);
        let Some(total_size) = size.checked_add(zones.overhead()) else {
            return AllocationResult::null();
        };

        let _guard = self.lock.lock();

        let allocation = self
            .allocator
            .allocate(total_size, zones.alignment, source_info);
        if allocation.is_null() {
            return AllocationResult::null();
        }

        // Strategies may hand out more than requested, the surplus belongs to
        // the caller.
        let user_size = allocation.num_bytes - zones.overhead();

        unsafe {
            let size_header = allocation.ptr;
            let front_guard = size_header.add(zones.header);
            let user = front_guard.add(zones.guard);
            let back_guard = user.add(user_size);

            if zones.header != 0 {
                size_header.cast::<usize>().write(user_size);
            }
            B::write_guard(front_guard, zones.guard);
            M::mark_allocated(user, user_size);
            B::write_guard(back_guard, zones.guard);

            self.tracking.track_allocate(&TrackAllocate {
                allocation,
                requested_bytes: total_size,
                alignment: zones.alignment,
                source_info: *source_info,
            });

            AllocationResult::new(user, user_size)
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        let zones = Self::zones(alignment);
        let user = ptr.as_ptr();
        let front_guard = user.sub(zones.guard);
        let size_header = front_guard.sub(zones.header);

        let _guard = self.lock.lock();

        // Callers may pass back anything between the size they requested and
        // the size they got, the header knows the real extent.
        let user_size = if zones.header != 0 {
            let user_size = size_header.cast::<usize>().read();
            mem_assert!(
                size <= user_size,
                "Deallocating {} bytes from a block of {} bytes",
                size,
                user_size
            );
            user_size
        } else {
            size
        };

        B::check_guard(front_guard, zones.guard);
        B::check_guard(user.add(user_size), zones.guard);

        M::mark_freed(user, user_size);

        let total_size = user_size + zones.overhead();
        let base = NonNull::new_unchecked(size_header);

        self.tracking.track_deallocate(&TrackDeallocate {
            ptr: base,
            num_bytes: total_size,
            alignment: zones.alignment,
        });

        self.allocator.deallocate(base, total_size, zones.alignment);
    }
}

// Every access to the allocator goes through the lock, so the lock decides
// what the allocator needs: `Send` behind a mutex, `Sync` without one.
unsafe impl<S, M, B, T, L> Sync for MemoryManager<S, M, B, T, L>
where
    T: Sync,
    L: ThreadSafeWith<S> + Sync,
{
}

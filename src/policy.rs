//! Policies plugged into [`crate::MemoryManager`]. Each concern is a trait
//! with a "do nothing" implementation that compiles away entirely, so a
//! manager only pays for what it enables.
//!
//! | Concern      | Off           | On                                  |
//! |--------------|---------------|-------------------------------------|
//! | Marking      | [`Unmarked`]  | [`Marked`]                          |
//! | Bounds       | [`Unchecked`] | [`Checked`]                         |
//! | Tracking     | [`NoTracking`]| [`LogTracking`], [`CountingTracking`] |
//! | Locking      | [`NoLock`]    | [`MutexLock`]                       |

use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use log::trace;

use crate::{assertion, AllocationResult, AllocationSourceInfo};

/// Fills guard zones around allocations.
pub const GUARD_BYTE_PATTERN: u8 = 0xAB;

/// Fills freshly allocated memory.
pub const ALLOCATED_BYTE_PATTERN: u8 = 0xCD;

/// Fills memory that was just deallocated.
pub const FREED_BYTE_PATTERN: u8 = 0xDD;

/// Whether allocated and freed bytes get overwritten with a recognizable
/// pattern, which makes reads of uninitialized or dangling memory obvious in
/// a debugger.
pub trait MarkPolicy {
    const ENABLED: bool;

    /// # Safety
    ///
    /// `bytes` must be valid for writes of `num_bytes` bytes.
    #[inline]
    unsafe fn mark_allocated(bytes: *mut u8, num_bytes: usize) {
        if Self::ENABLED {
            bytes.write_bytes(ALLOCATED_BYTE_PATTERN, num_bytes);
        }
    }

    /// # Safety
    ///
    /// `bytes` must be valid for writes of `num_bytes` bytes.
    #[inline]
    unsafe fn mark_freed(bytes: *mut u8, num_bytes: usize) {
        if Self::ENABLED {
            bytes.write_bytes(FREED_BYTE_PATTERN, num_bytes);
        }
    }
}

/// Fill allocations with [`ALLOCATED_BYTE_PATTERN`] and
/// [`FREED_BYTE_PATTERN`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Marked;

/// Leave memory contents alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unmarked;

impl MarkPolicy for Marked {
    const ENABLED: bool = true;
}

impl MarkPolicy for Unmarked {
    const ENABLED: bool = false;
}

/// Whether allocations are surrounded by guard zones that are verified on
/// deallocation. A mismatch means something wrote outside of its block.
pub trait BoundCheckPolicy {
    const ENABLED: bool;

    /// # Safety
    ///
    /// `guard` must be valid for writes of `guard_size` bytes.
    #[inline]
    unsafe fn write_guard(guard: *mut u8, guard_size: usize) {
        if Self::ENABLED {
            guard.write_bytes(GUARD_BYTE_PATTERN, guard_size);
        }
    }

    /// Heap corruption is always fatal, regardless of the `assertions`
    /// feature.
    ///
    /// # Safety
    ///
    /// `guard` must be valid for reads of `guard_size` bytes.
    #[inline]
    unsafe fn check_guard(guard: *const u8, guard_size: usize) {
        if !Self::ENABLED {
            return;
        }

        for offset in 0..guard_size {
            if guard.add(offset).read() != GUARD_BYTE_PATTERN {
                assertion::assert_failed(
                    "guard byte == GUARD_BYTE_PATTERN",
                    file!(),
                    line!(),
                    format_args!("Memory guard corrupted at {:p}", guard.add(offset)),
                );
            }
        }
    }
}

/// Surround allocations with [`GUARD_BYTE_PATTERN`] zones.
#[derive(Debug, Default, Clone, Copy)]
pub struct Checked;

/// No guard zones.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unchecked;

impl BoundCheckPolicy for Checked {
    const ENABLED: bool = true;
}

impl BoundCheckPolicy for Unchecked {
    const ENABLED: bool = false;
}

/// Passed to [`TrackingPolicy::track_allocate`].
#[derive(Debug, Clone, Copy)]
pub struct TrackAllocate {
    /// What the wrapped allocator returned, guard zones included.
    pub allocation: AllocationResult,
    /// Bytes requested from the wrapped allocator.
    pub requested_bytes: usize,
    pub alignment: usize,
    pub source_info: AllocationSourceInfo,
}

/// Passed to [`TrackingPolicy::track_deallocate`].
#[derive(Debug, Clone, Copy)]
pub struct TrackDeallocate {
    /// Pointer given back to the wrapped allocator.
    pub ptr: NonNull<u8>,
    pub num_bytes: usize,
    pub alignment: usize,
}

/// Observes every successful allocation and every deallocation of a manager.
/// Hooks run while the manager's lock is held.
pub trait TrackingPolicy: Default {
    /// Whether the hooks do anything. Enabled trackers make the manager keep
    /// a size header so both hooks see the same extent for a block.
    const ENABLED: bool = true;

    fn track_allocate(&self, _info: &TrackAllocate) {}

    fn track_deallocate(&self, _info: &TrackDeallocate) {}
}

#[derive(Debug, Default)]
pub struct NoTracking;

impl TrackingPolicy for NoTracking {
    const ENABLED: bool = false;
}

/// Emits a `trace` record for every allocation and deallocation.
#[derive(Debug, Default)]
pub struct LogTracking;

impl TrackingPolicy for LogTracking {
    fn track_allocate(&self, info: &TrackAllocate) {
        trace!(
            "allocate {:p} ({} bytes, requested {}, alignment {}) at {}",
            info.allocation.ptr,
            info.allocation.num_bytes,
            info.requested_bytes,
            info.alignment,
            info.source_info
        );
    }

    fn track_deallocate(&self, info: &TrackDeallocate) {
        trace!(
            "deallocate {:p} ({} bytes, alignment {})",
            info.ptr,
            info.num_bytes,
            info.alignment
        );
    }
}

/// Counts allocations and bytes. Byte counts are the sizes handed out by the
/// wrapped allocator, so they include guard zones and any surplus.
#[derive(Debug, Default)]
pub struct CountingTracking {
    total_allocations: AtomicUsize,
    total_deallocations: AtomicUsize,
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
}

impl CountingTracking {
    pub fn total_allocations(&self) -> usize {
        self.total_allocations.load(Ordering::Relaxed)
    }

    pub fn total_deallocations(&self) -> usize {
        self.total_deallocations.load(Ordering::Relaxed)
    }

    pub fn live_allocations(&self) -> usize {
        self.total_allocations() - self.total_deallocations()
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Highest value [`CountingTracking::live_bytes`] ever reached.
    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes.load(Ordering::Relaxed)
    }
}

impl TrackingPolicy for CountingTracking {
    fn track_allocate(&self, info: &TrackAllocate) {
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        let live = self
            .live_bytes
            .fetch_add(info.allocation.num_bytes, Ordering::Relaxed)
            + info.allocation.num_bytes;
        self.peak_bytes.fetch_max(live, Ordering::Relaxed);
    }

    fn track_deallocate(&self, info: &TrackDeallocate) {
        self.total_deallocations.fetch_add(1, Ordering::Relaxed);
        // Never wraps, even if the hooks are driven by hand with mismatched
        // sizes.
        let _ = self
            .live_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |live| {
                Some(live.saturating_sub(info.num_bytes))
            });
    }
}

/// Serializes access to a manager. The guard is held for the whole
/// allocation or deallocation.
pub trait LockPolicy: Default {
    type Guard<'a>
    where
        Self: 'a;

    fn lock(&self) -> Self::Guard<'_>;
}

/// States what an allocator of type `S` needs for a manager guarded by this
/// lock to be shared between threads. `NoLock` needs `S: Sync`, locks that
/// serialize every call only need `S: Send`.
///
/// # Safety
///
/// Implementations for `S: Send` must guarantee that two guards returned by
/// [`LockPolicy::lock`] are never alive at the same time on different threads.
pub unsafe trait ThreadSafeWith<S: ?Sized>: LockPolicy {}

/// Single threaded use only.
#[derive(Debug, Default)]
pub struct NoLock;

impl LockPolicy for NoLock {
    type Guard<'a> = ();

    #[inline]
    fn lock(&self) -> Self::Guard<'_> {}
}

unsafe impl<S: Sync + ?Sized> ThreadSafeWith<S> for NoLock {}

/// Standard mutex. A panic while the lock is held (a failed assertion, for
/// example) doesn't make the manager unusable.
#[derive(Debug, Default)]
pub struct MutexLock(Mutex<()>);

impl LockPolicy for MutexLock {
    type Guard<'a> = MutexGuard<'a, ()>;

    fn lock(&self) -> Self::Guard<'_> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

unsafe impl<S: Send + ?Sized> ThreadSafeWith<S> for MutexLock {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marking() {
        let mut bytes = [0u8; 16];

        unsafe {
            Unmarked::mark_allocated(bytes.as_mut_ptr(), 16);
            assert!(bytes.iter().all(|byte| *byte == 0));

            Marked::mark_allocated(bytes.as_mut_ptr(), 8);
            assert!(bytes[..8].iter().all(|byte| *byte == ALLOCATED_BYTE_PATTERN));
            assert!(bytes[8..].iter().all(|byte| *byte == 0));

            Marked::mark_freed(bytes.as_mut_ptr(), 16);
            assert!(bytes.iter().all(|byte| *byte == FREED_BYTE_PATTERN));
        }
    }

    #[test]
    fn guards() {
        let mut guard = [0u8; 8];

        unsafe {
            Unchecked::write_guard(guard.as_mut_ptr(), 8);
            Unchecked::check_guard(guard.as_ptr(), 8);

            Checked::write_guard(guard.as_mut_ptr(), 8);
            assert_eq!(guard, [GUARD_BYTE_PATTERN; 8]);
            Checked::check_guard(guard.as_ptr(), 8);
        }
    }

    #[test]
    #[should_panic(expected = "Memory guard corrupted")]
    fn corrupted_guard() {
        let mut guard = [GUARD_BYTE_PATTERN; 8];
        guard[5] = 0;

        unsafe { Checked::check_guard(guard.as_ptr(), 8) };
    }

    #[test]
    fn counting() {
        let tracking = CountingTracking::default();
        let mut byte = 0u8;
        let ptr = NonNull::from(&mut byte);

        let allocate = |bytes| TrackAllocate {
            allocation: AllocationResult::new(ptr.as_ptr(), bytes),
            requested_bytes: bytes,
            alignment: 1,
            source_info: AllocationSourceInfo::default(),
        };
        let deallocate = |bytes| TrackDeallocate {
            ptr,
            num_bytes: bytes,
            alignment: 1,
        };

        tracking.track_allocate(&allocate(100));
        tracking.track_allocate(&allocate(50));
        tracking.track_deallocate(&deallocate(100));
        tracking.track_allocate(&allocate(20));

        assert_eq!(tracking.total_allocations(), 3);
        assert_eq!(tracking.total_deallocations(), 1);
        assert_eq!(tracking.live_allocations(), 2);
        assert_eq!(tracking.live_bytes(), 70);
        assert_eq!(tracking.peak_bytes(), 150);
    }

    #[test]
    fn counting_never_wraps() {
        let tracking = CountingTracking::default();
        let mut byte = 0u8;
        let ptr = NonNull::from(&mut byte);

        tracking.track_allocate(&TrackAllocate {
            allocation: AllocationResult::new(ptr.as_ptr(), 20),
            requested_bytes: 20,
            alignment: 1,
            source_info: AllocationSourceInfo::default(),
        });
        tracking.track_deallocate(&TrackDeallocate {
            ptr,
            num_bytes: 64,
            alignment: 1,
        });

        assert_eq!(tracking.live_bytes(), 0);
        assert_eq!(tracking.live_allocations(), 0);
    }

    #[test]
    fn mutex_lock_survives_poisoning() {
        let lock = MutexLock::default();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = lock.lock();
            panic!("poison");
        }));

        assert!(result.is_err());
        drop(lock.lock());
    }
}

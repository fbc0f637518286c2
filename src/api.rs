//! Typed helpers on top of [`Allocator`]: construct a value or an array in
//! memory obtained from any allocator, and destroy it again.
//!
//! ```rust
//! use memkit::{api, default_heap};
//!
//! let heap = default_heap();
//!
//! let value = api::allocate_object(heap, String::from("hello")).unwrap();
//! let array = api::allocate_array_with(heap, 4, |i| i * 10).unwrap();
//!
//! unsafe {
//!     assert_eq!(value.as_ref(), "hello");
//!     assert_eq!(array.as_ref(), &[0, 10, 20, 30]);
//!
//!     api::deallocate_object(heap, value);
//!     api::deallocate_array(heap, array);
//! }
//! ```

use std::{
    mem::{self, MaybeUninit},
    ptr::{self, NonNull},
};

use crate::{AllocationSourceInfo, Allocator};

/// Moves `value` into memory obtained from `allocator`. Returns `None` (and
/// drops `value`) if the allocator is out of memory.
#[track_caller]
pub fn allocate_object<T, A: Allocator + ?Sized>(allocator: &A, value: T) -> Option<NonNull<T>> {
    if mem::size_of::<T>() == 0 {
        mem::forget(value);
        return Some(NonNull::dangling());
    }

    let ptr = allocator
        .allocate(
            mem::size_of::<T>(),
            mem::align_of::<T>(),
            &AllocationSourceInfo::caller(),
        )
        .non_null()?
        .cast::<T>();

    unsafe { ptr.as_ptr().write(value) };

    Some(ptr)
}

/// Drops the value and gives its memory back.
///
/// # Safety
///
/// `ptr` must come from [`allocate_object`] with the same allocator and must
/// not be used afterwards.
pub unsafe fn deallocate_object<T, A: Allocator + ?Sized>(allocator: &A, ptr: NonNull<T>) {
    ptr::drop_in_place(ptr.as_ptr());

    if mem::size_of::<T>() != 0 {
        allocator.deallocate(ptr.cast(), mem::size_of::<T>(), mem::align_of::<T>());
    }
}

/// Allocates room for `len` values of `T` without initializing them.
#[track_caller]
pub fn allocate_array<T, A: Allocator + ?Sized>(
    allocator: &A,
    len: usize,
) -> Option<NonNull<[MaybeUninit<T>]>> {
    let size = mem::size_of::<T>().checked_mul(len)?;

    let ptr = if size == 0 {
        NonNull::dangling()
    } else {
        allocator
            .allocate(size, mem::align_of::<T>(), &AllocationSourceInfo::caller())
            .non_null()?
            .cast()
    };

    Some(NonNull::slice_from_raw_parts(ptr, len))
}

/// Allocates an array of `len` values where element `i` is `f(i)`.
#[track_caller]
pub fn allocate_array_with<T, A: Allocator + ?Sized>(
    allocator: &A,
    len: usize,
    mut f: impl FnMut(usize) -> T,
) -> Option<NonNull<[T]>> {
    let array = allocate_array::<T, A>(allocator, len)?;
    let first = array.cast::<T>();

    for index in 0..len {
        // SAFETY: `index < len`. If `f` panics the elements written so far
        // and the memory leak, which is safe.
        unsafe { first.add(index).write(f(index)) };
    }

    Some(NonNull::slice_from_raw_parts(first, len))
}

/// Allocates an array of `len` default values.
#[track_caller]
pub fn allocate_array_default<T: Default, A: Allocator + ?Sized>(
    allocator: &A,
    len: usize,
) -> Option<NonNull<[T]>> {
    allocate_array_with(allocator, len, |_| T::default())
}

/// Drops every element of the array and gives its memory back. Arrays of
/// [`MaybeUninit`] are released without dropping anything.
///
/// # Safety
///
/// `array` must come from one of the array functions of this module with the
/// same allocator, all of its elements must be initialized (unless `T` is
/// [`MaybeUninit`]) and it must not be used afterwards.
pub unsafe fn deallocate_array<T, A: Allocator + ?Sized>(allocator: &A, array: NonNull<[T]>) {
    ptr::drop_in_place(array.as_ptr());

    let size = mem::size_of::<T>() * array.len();
    if size != 0 {
        allocator.deallocate(array.cast(), size, mem::align_of::<T>());
    }
}

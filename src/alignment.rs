//! Alignment arithmetic shared by every allocator in this crate. Quick
//! reminder of how memory alignment works:
//!
//! ```text
//!      +-------------+
//! 0x00 | First byte  |
//!      +-------------+
//! 0x01 | Second byte |
//!      +-------------+
//! 0x02 |     ...     |
//!      +-------------+
//! ...  |     ...     |
//!      +-------------+
//! 0x0F |     ...     |
//!      +-------------+
//! ```
//!
//! An address `A` is N-aligned if `A` is a multiple of `N`, where `N` is a
//! power of two. Because `N` is a power of two, `N - 1` is a mask of all the
//! bits below `N`, so rounding up to the next multiple is a single add and a
//! single and:
//!
//! ```text
//! (value + (N - 1)) & !(N - 1)
//! ```
//!
//! The same trick works for sizes and for the integer representation of
//! pointers, which is all we need for bump pointers, block strides and guard
//! zones.

use std::mem;

use crate::assertion::mem_assert;

/// Pointer size in bytes on the current machine (or target architecture).
pub const POINTER_SIZE: usize = mem::size_of::<usize>();

/// An address aligned to this value can hold any type that is not explicitly
/// over-aligned. Equivalent to C's `alignof(max_align_t)`: 16 bytes on 64 bit
/// targets, 8 on most 32 bit ones.
pub const DEFAULT_ALIGNMENT: usize = mem::align_of::<MaxAlign>();

/// Stand-in for C's `max_align_t`.
#[allow(dead_code)]
#[repr(C)]
union MaxAlign {
    integer: u128,
    float: f64,
    pointer: *const u8,
}

/// Returns `true` if `alignment` is a non-zero power of two.
#[inline]
pub const fn is_valid_alignment(alignment: usize) -> bool {
    alignment > 0 && (alignment & (alignment - 1)) == 0
}

/// Returns `true` if `size` is a multiple of `alignment`.
#[inline]
pub fn is_size_aligned(size: usize, alignment: usize) -> bool {
    mem_assert!(
        is_valid_alignment(alignment),
        "The alignment ({}) must be a non-zero power of two",
        alignment
    );

    size & (alignment - 1) == 0
}

/// Rounds `size` up to the next multiple of `alignment`.
///
/// # Examples
///
/// ```rust
/// use memkit::alignment::align_size;
///
/// assert_eq!(align_size(13, 8), 16);
/// assert_eq!(align_size(16, 8), 16);
/// assert_eq!(align_size(0, 64), 0);
/// ```
#[inline]
pub fn align_size(size: usize, alignment: usize) -> usize {
    mem_assert!(
        is_valid_alignment(alignment),
        "The alignment ({}) must be a non-zero power of two",
        alignment
    );

    let mask = alignment - 1;

    (size + mask) & !mask
}

/// Returns `true` if the address of `ptr` is a multiple of `alignment`.
#[inline]
pub fn is_pointer_aligned<T>(ptr: *const T, alignment: usize) -> bool {
    is_size_aligned(ptr.addr(), alignment)
}

/// Moves `ptr` forward to the next address that is a multiple of `alignment`.
/// Provenance of `ptr` is preserved, only the address changes.
#[inline]
pub fn align_pointer(ptr: *mut u8, alignment: usize) -> *mut u8 {
    ptr.map_addr(|address| align_size(address, alignment))
}

/// Number of bytes between `ptr` and the next `alignment` aligned address.
#[inline]
pub fn pointer_align_offset(ptr: *const u8, alignment: usize) -> usize {
    align_size(ptr.addr(), alignment) - ptr.addr()
}

/// Carves an aligned region of `size` bytes out of the free region
/// `[*ptr, *ptr + *space)`.
///
/// On success `*ptr` is moved to the aligned address, `*space` shrinks by the
/// padding that was skipped and the aligned pointer is returned. If the region
/// is too small nothing is modified and `None` is returned. Same contract as
/// C++ `std::align`.
///
/// ```text
///   *ptr                  aligned               *ptr + *space
///    |                       |                        |
///    v                       v                        v
///    +-----------------------+------------+-----------+
///    |        padding        |    size    |   rest    |
///    +-----------------------+------------+-----------+
///                            <------ new *space ------>
/// ```
pub fn standard_align(
    alignment: usize,
    size: usize,
    ptr: &mut *mut u8,
    space: &mut usize,
) -> Option<*mut u8> {
    let aligned = align_pointer(*ptr, alignment);
    let offset = aligned.addr() - ptr.addr();

    if *space >= size.checked_add(offset)? {
        *ptr = aligned;
        *space -= offset;
        Some(aligned)
    } else {
        None
    }
}

use std::{alloc::Layout, mem, ptr::NonNull};

use crate::{
    alignment::{is_pointer_aligned, is_valid_alignment},
    assertion::mem_assert,
    source_info, Allocator, Error,
};

/// Accumulates the size and alignment of a single block that is going to
/// hold several differently typed arrays back to back. Each append pads the
/// running size to the alignment of the new element type and returns the
/// offset where that array starts:
///
/// ```text
/// append::<i32>(1)          -> offset 0
/// append::<u8>(100)         -> offset 4
/// append_aligned::<f32>(1, 16) -> offset 112
///
/// +------+--------------------+---------+-----+
/// | i32  |     100 x u8       | padding | f32 |
/// +------+--------------------+---------+-----+
/// 0      4                    104       112   116
/// ```
///
/// The final [`MemoryRequirements::size`] and
/// [`MemoryRequirements::alignment`] are then used for one allocation, and the
/// offsets locate each array inside it with [`MemoryRequirements::place`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: usize,
    pub alignment: usize,
}

impl Default for MemoryRequirements {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRequirements {
    pub const fn new() -> Self {
        Self {
            size: 0,
            alignment: 1,
        }
    }

    /// Reserves `element_count` elements of `element_size` bytes aligned to
    /// `element_alignment` and returns the offset of the first one.
    pub fn append_raw(
        &mut self,
        element_size: usize,
        element_count: usize,
        element_alignment: usize,
    ) -> Result<usize, Error> {
        if !is_valid_alignment(element_alignment) {
            return Err(Error::InvalidAlignment(element_alignment));
        }

        let mask = element_alignment - 1;
        let offset = self.size.checked_add(mask).ok_or(Error::Overflow)? & !mask;
        let bytes = element_size
            .checked_mul(element_count)
            .ok_or(Error::Overflow)?;

        self.size = offset.checked_add(bytes).ok_or(Error::Overflow)?;
        self.alignment = self.alignment.max(element_alignment);

        Ok(offset)
    }

    /// Reserves `count` values of `T` at the natural alignment of `T`.
    pub fn append<T>(&mut self, count: usize) -> Result<usize, Error> {
        self.append_raw(mem::size_of::<T>(), count, mem::align_of::<T>())
    }

    /// Same as [`MemoryRequirements::append`] but the array starts at an
    /// address aligned to at least `alignment`.
    pub fn append_aligned<T>(&mut self, count: usize, alignment: usize) -> Result<usize, Error> {
        self.append_raw(
            mem::size_of::<T>(),
            count,
            alignment.max(mem::align_of::<T>()),
        )
    }

    pub fn layout(&self) -> Result<Layout, Error> {
        Ok(Layout::from_size_align(self.size, self.alignment)?)
    }

    /// Requests one block that satisfies these requirements.
    pub fn allocate<A: Allocator + ?Sized>(&self, allocator: &A) -> Result<NonNull<u8>, Error> {
        allocator
            .allocate(self.size, self.alignment, &source_info!())
            .non_null()
            .ok_or(Error::OutOfMemory {
                size: self.size,
                alignment: self.alignment,
            })
    }

    /// Locates the array that was appended at `offset` inside a block
    /// allocated for these requirements.
    ///
    /// # Safety
    ///
    /// `base` must point to a live block of at least `self.size` bytes and
    /// `offset` must be a value returned by one of the append functions.
    pub unsafe fn place<T>(base: NonNull<u8>, offset: usize) -> NonNull<T> {
        let ptr = base.add(offset).cast::<T>();
        mem_assert!(
            is_pointer_aligned(ptr.as_ptr(), mem::align_of::<T>()),
            "Misaligned placement at offset {}",
            offset
        );

        ptr
    }
}

use std::{
    fmt,
    mem::{self, MaybeUninit},
    ops::{Deref, DerefMut},
    ptr::{self, NonNull},
};

use crate::{api, default_heap, Allocator, DefaultHeap, Error};

/// Resizable array that lives in memory from a given allocator and gives it
/// back when dropped. Unlike [`Vec`] it never over-allocates: the buffer
/// always holds exactly [`ScopedBuffer::len`] elements, and every resize is
/// one new allocation plus a move of the elements that survive.
///
/// ```rust
/// use memkit::ScopedBuffer;
///
/// let mut buffer = ScopedBuffer::<u32>::new();
/// buffer.resize(4).unwrap();
/// buffer[3] = 7;
///
/// buffer.resize(8).unwrap();
/// assert_eq!(&buffer[..], &[0, 0, 0, 7, 0, 0, 0, 0]);
/// ```
pub struct ScopedBuffer<T, A: Allocator = &'static DefaultHeap> {
    allocator: A,
    buffer: NonNull<T>,
    len: usize,
}

impl<T> ScopedBuffer<T> {
    /// Empty buffer over the [`default_heap`].
    pub fn new() -> Self {
        Self::new_in(default_heap())
    }
}

impl<T> Default for ScopedBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, A: Allocator> ScopedBuffer<T, A> {
    /// Empty buffer, nothing is allocated until the first resize.
    pub fn new_in(allocator: A) -> Self {
        Self {
            allocator,
            buffer: NonNull::dangling(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Resizes to `new_len` elements. Surviving elements are moved to the new
    /// block, extra elements are dropped and new ones are created with `f`.
    /// On failure the buffer is left untouched.
    pub fn resize_with(&mut self, new_len: usize, mut f: impl FnMut() -> T) -> Result<(), Error> {
        if new_len == self.len {
            return Ok(());
        }

        let new_buffer = api::allocate_array::<T, A>(&self.allocator, new_len)
            .ok_or(Error::OutOfMemory {
                size: mem::size_of::<T>().saturating_mul(new_len),
                alignment: mem::align_of::<T>(),
            })?
            .cast::<T>();

        let old_buffer = self.buffer;
        let old_len = self.len;
        let moved = old_len.min(new_len);

        unsafe {
            ptr::copy_nonoverlapping(old_buffer.as_ptr(), new_buffer.as_ptr(), moved);

            self.buffer = new_buffer;
            self.len = moved;

            self.release(old_buffer, old_len, moved);

            // Length grows one element at a time so a panic in `f` doesn't
            // leave uninitialized elements behind.
            while self.len < new_len {
                self.buffer.add(self.len).write(f());
                self.len += 1;
            }
        }

        Ok(())
    }

    /// Drops every element and frees the memory. The buffer can still be
    /// resized afterwards.
    pub fn destroy(&mut self) {
        let old_buffer = mem::replace(&mut self.buffer, NonNull::dangling());
        let old_len = mem::take(&mut self.len);

        unsafe { self.release(old_buffer, old_len, 0) };
    }

    /// Drops the elements `[live_from, len)` of `buffer` and gives its memory
    /// back. Elements before `live_from` were moved out already.
    unsafe fn release(&self, buffer: NonNull<T>, len: usize, live_from: usize) {
        ptr::drop_in_place(ptr::slice_from_raw_parts_mut(
            buffer.as_ptr().add(live_from),
            len - live_from,
        ));

        api::deallocate_array(
            &self.allocator,
            NonNull::slice_from_raw_parts(buffer.cast::<MaybeUninit<T>>(), len),
        );
    }
}

impl<T: Default, A: Allocator> ScopedBuffer<T, A> {
    /// Buffer of `len` default values.
    pub fn with_len_in(allocator: A, len: usize) -> Result<Self, Error> {
        let mut buffer = Self::new_in(allocator);
        buffer.resize(len)?;
        Ok(buffer)
    }

    /// Resizes to `new_len`, filling new slots with `T::default()`.
    pub fn resize(&mut self, new_len: usize) -> Result<(), Error> {
        self.resize_with(new_len, T::default)
    }
}

impl<T, A: Allocator> Deref for ScopedBuffer<T, A> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.buffer.as_ptr(), self.len) }
    }
}

impl<T, A: Allocator> DerefMut for ScopedBuffer<T, A> {
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.buffer.as_ptr(), self.len) }
    }
}

impl<T: fmt::Debug, A: Allocator> fmt::Debug for ScopedBuffer<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T, A: Allocator> Drop for ScopedBuffer<T, A> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use super::*;
    use crate::{
        platform::SystemAllocator,
        policy::{CountingTracking, NoLock, Unchecked, Unmarked},
        test_utils::AlignedBuffer,
        LinearAllocator, MemoryManager,
    };

    type Counting = MemoryManager<SystemAllocator, Unmarked, Unchecked, CountingTracking, NoLock>;

    struct DropCounter(Rc<Cell<usize>>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn grow_and_shrink_keep_elements() {
        let allocator = Counting::new(SystemAllocator);
        let mut buffer = ScopedBuffer::<String, _>::with_len_in(&allocator, 2).unwrap();

        buffer[0] = "first".into();
        buffer[1] = "second".into();

        buffer.resize(5).unwrap();
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer[0], "first");
        assert_eq!(buffer[1], "second");
        assert!(buffer[2..].iter().all(String::is_empty));

        buffer.resize(1).unwrap();
        assert_eq!(&buffer[..], &["first".to_string()]);
        assert_eq!(allocator.tracking().live_allocations(), 1);

        drop(buffer);
        assert_eq!(allocator.tracking().live_allocations(), 0);
    }

    #[test]
    fn drops_each_element_once() {
        let allocator = Counting::new(SystemAllocator);
        let drops = Rc::new(Cell::new(0));

        let mut buffer = ScopedBuffer::new_in(&allocator);
        buffer.resize_with(4, || DropCounter(drops.clone())).unwrap();
        assert_eq!(drops.get(), 0);

        buffer.resize_with(6, || DropCounter(drops.clone())).unwrap();
        assert_eq!(drops.get(), 0);

        buffer.resize_with(2, || unreachable!()).unwrap();
        assert_eq!(drops.get(), 4);

        buffer.destroy();
        assert_eq!(drops.get(), 6);
        assert!(buffer.is_empty());
        assert_eq!(allocator.tracking().live_allocations(), 0);
    }

    #[test]
    fn failed_resize_leaves_buffer_untouched() {
        let mut memory = AlignedBuffer::<64>::new();
        let arena = LinearAllocator::new(memory.as_mut_slice());

        let mut buffer = ScopedBuffer::<u64, _>::with_len_in(&arena, 4).unwrap();
        buffer.copy_from_slice(&[1, 2, 3, 4]);

        assert_eq!(
            buffer.resize(16),
            Err(Error::OutOfMemory {
                size: 128,
                alignment: mem::align_of::<u64>()
            })
        );
        assert_eq!(&buffer[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn default_heap_buffer() {
        let mut buffer = ScopedBuffer::<u8>::default();
        assert!(buffer.is_empty());

        buffer.resize(100).unwrap();
        buffer.fill(9);
        assert_eq!(buffer.iter().map(|byte| *byte as usize).sum::<usize>(), 900);
        assert_eq!(format!("{:?}", &buffer[..2]), "[9, 9]");
    }
}

use std::{fmt, marker::PhantomData, panic::Location, ptr::NonNull};

/// A successful allocation is a pointer plus the number of usable bytes, which
/// may be larger than what was requested. A null pointer or a zero byte count
/// means the allocation failed, see [`AllocationResult::is_null`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationResult {
    /// First byte of the usable block.
    pub ptr: *mut u8,
    /// Usable bytes starting at `ptr`, always `>=` the requested size.
    pub num_bytes: usize,
}

impl AllocationResult {
    /// The failed allocation.
    pub const fn null() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            num_bytes: 0,
        }
    }

    pub const fn new(ptr: *mut u8, num_bytes: usize) -> Self {
        Self { ptr, num_bytes }
    }

    /// Every caller has to check this before touching `ptr`.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_null() || self.num_bytes == 0
    }

    /// Returns the pointer if the allocation succeeded.
    #[inline]
    pub fn non_null(&self) -> Option<NonNull<u8>> {
        if self.is_null() {
            None
        } else {
            NonNull::new(self.ptr)
        }
    }

    /// The whole usable block as a slice pointer.
    #[inline]
    pub fn as_slice_ptr(&self) -> Option<NonNull<[u8]>> {
        self.non_null()
            .map(|ptr| NonNull::slice_from_raw_parts(ptr, self.num_bytes))
    }
}

impl Default for AllocationResult {
    fn default() -> Self {
        Self::null()
    }
}

/// Where an allocation came from. Purely diagnostic: tracking policies may
/// record it, allocators never look at it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AllocationSourceInfo {
    pub file: &'static str,
    pub function: &'static str,
    pub line: u32,
}

impl AllocationSourceInfo {
    pub const fn new(file: &'static str, function: &'static str, line: u32) -> Self {
        Self {
            file,
            function,
            line,
        }
    }

    /// Source info of whoever called the function that calls this one, as
    /// long as the chain is annotated with `#[track_caller]`.
    #[track_caller]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self::new(location.file(), "", location.line())
    }
}

impl fmt::Display for AllocationSourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.function.is_empty() {
            write!(f, "{}:{}", self.file, self.line)
        } else {
            write!(f, "{}:{} ({})", self.file, self.line, self.function)
        }
    }
}

/// Builds an [`AllocationSourceInfo`] for the current file, module and line.
#[macro_export]
macro_rules! source_info {
    () => {
        $crate::AllocationSourceInfo::new(file!(), module_path!(), line!())
    };
}

/// The allocator contract. Every strategy in this crate implements this
/// trait, which is the zero overhead "static" way of using an allocator:
/// generic code calls the concrete type directly. [`AllocatorView`] is the
/// type erased way.
///
/// Methods take `&self`. Strategies keep their bookkeeping in
/// [`std::cell::Cell`], which keeps them `!Sync` unless they are wrapped in
/// something that serializes access.
///
/// # Safety
///
/// Implementations must guarantee that a non null result points to at least
/// `num_bytes >= size` usable bytes aligned to at least `alignment`, and that
/// those bytes don't overlap any other live allocation until they are given
/// back with [`Allocator::deallocate`]. Requests of `size == 0` return
/// [`AllocationResult::null`].
pub unsafe trait Allocator {
    /// Requests `size` bytes aligned to `alignment`, which must be a non zero
    /// power of two. Returns [`AllocationResult::null`] if the request can't
    /// be satisfied.
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        source_info: &AllocationSourceInfo,
    ) -> AllocationResult;

    /// Gives back memory obtained from [`Allocator::allocate`].
    ///
    /// # Safety
    ///
    /// - `ptr` must be exactly the pointer returned by `allocate` on this
    ///   allocator and must not have been deallocated already.
    /// - `size` must be between the requested size and the returned
    ///   `num_bytes`.
    /// - `alignment` must be the alignment used to allocate.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, alignment: usize);

    /// Type erased view of this allocator.
    fn view(&self) -> AllocatorView<'_>
    where
        Self: Sized,
    {
        AllocatorView::new(self)
    }
}

unsafe impl<A: Allocator + ?Sized> Allocator for &A {
    #[inline]
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        source_info: &AllocationSourceInfo,
    ) -> AllocationResult {
        (**self).allocate(size, alignment, source_info)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        (**self).deallocate(ptr, size, alignment)
    }
}

type AllocateFn =
    unsafe fn(NonNull<()>, usize, usize, &AllocationSourceInfo) -> AllocationResult;

type DeallocateFn = unsafe fn(NonNull<()>, NonNull<u8>, usize, usize);

/// Type erased, non-owning handle to some [`Allocator`]. It is just the
/// address of the allocator plus two functions that know its concrete type:
///
/// ```text
/// +---------------+
/// | state         | ------> LinearAllocator / PoolAllocator / ...
/// +---------------+
/// | allocate_fn   | ------> allocate_thunk::<ConcreteType>
/// +---------------+
/// | deallocate_fn | ------> deallocate_thunk::<ConcreteType>
/// +---------------+
/// ```
///
/// The lifetime ties the view to the borrow of the allocator, so the
/// allocator always outlives its views.
#[derive(Clone, Copy)]
pub struct AllocatorView<'a> {
    state: NonNull<()>,
    allocate_fn: AllocateFn,
    deallocate_fn: DeallocateFn,
    marker: PhantomData<&'a ()>,
}

impl<'a> AllocatorView<'a> {
    pub fn new<A: Allocator>(allocator: &'a A) -> Self {
        unsafe fn allocate_thunk<A: Allocator>(
            state: NonNull<()>,
            size: usize,
            alignment: usize,
            source_info: &AllocationSourceInfo,
        ) -> AllocationResult {
            state.cast::<A>().as_ref().allocate(size, alignment, source_info)
        }

        unsafe fn deallocate_thunk<A: Allocator>(
            state: NonNull<()>,
            ptr: NonNull<u8>,
            size: usize,
            alignment: usize,
        ) {
            state.cast::<A>().as_ref().deallocate(ptr, size, alignment)
        }

        Self {
            state: NonNull::from(allocator).cast(),
            allocate_fn: allocate_thunk::<A>,
            deallocate_fn: deallocate_thunk::<A>,
            marker: PhantomData,
        }
    }

    /// Returns `true` if both views refer to the same allocator object.
    pub fn points_to_same(&self, other: &AllocatorView<'_>) -> bool {
        self.state == other.state
    }
}

impl<'a, A: Allocator> From<&'a A> for AllocatorView<'a> {
    fn from(allocator: &'a A) -> Self {
        AllocatorView::new(allocator)
    }
}

unsafe impl Allocator for AllocatorView<'_> {
    #[inline]
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        source_info: &AllocationSourceInfo,
    ) -> AllocationResult {
        // SAFETY: `state` was created from a `&'a A` and `allocate_fn` was
        // instantiated for that same `A`.
        unsafe { (self.allocate_fn)(self.state, size, alignment, source_info) }
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, alignment: usize) {
        (self.deallocate_fn)(self.state, ptr, size, alignment)
    }

    fn view(&self) -> AllocatorView<'_> {
        *self
    }
}

impl fmt::Debug for AllocatorView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorView")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

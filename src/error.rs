use thiserror::Error;

/// Failures of operations that are not plain allocation requests. Running out
/// of memory inside an allocator is reported with
/// [`crate::AllocationResult::null`] instead, see [`crate::Allocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Size arithmetic would not fit in a `usize`.
    #[error("memory size computation overflowed")]
    Overflow,

    /// Alignments must be non-zero powers of two.
    #[error("alignment {0} is not a non-zero power of two")]
    InvalidAlignment(usize),

    /// The size and alignment pair can't be described by [`std::alloc::Layout`].
    #[error("invalid memory layout")]
    Layout,

    /// The allocator returned a null allocation.
    #[error("out of memory allocating {size} bytes aligned to {alignment}")]
    OutOfMemory { size: usize, alignment: usize },
}

impl From<std::alloc::LayoutError> for Error {
    fn from(_: std::alloc::LayoutError) -> Self {
        Error::Layout
    }
}

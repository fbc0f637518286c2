//! Contract violations. A caller that hands us a foreign pointer, frees out of
//! order or scribbles over guard bytes has a bug, there is nothing sensible we
//! can return to it. So instead of an error value we report the failed
//! expression with its location and panic. Build with `panic = "abort"` to get
//! the classic "print and abort" behaviour.
//!
//! The checks can be compiled out by disabling the `assertions` feature, in
//! which case violating a precondition is undefined behaviour.

/// Asserts a precondition of the allocator API.
///
/// ```text
/// mem_assert!(size <= self.block_size, "Block size is {} (not {})", self.block_size, size);
/// ```
macro_rules! mem_assert {
    ($expr:expr, $($arg:tt)+) => {
        if cfg!(feature = "assertions") && !($expr) {
            $crate::assertion::assert_failed(
                stringify!($expr),
                file!(),
                line!(),
                format_args!($($arg)+),
            );
        }
    };
}

pub(crate) use mem_assert;

/// Slow path of [`mem_assert!`], kept out of line so the check itself stays
/// small enough to inline in the allocation fast paths.
#[cold]
#[inline(never)]
#[track_caller]
pub(crate) fn assert_failed(
    expression: &str,
    file: &str,
    line: u32,
    message: std::fmt::Arguments<'_>,
) -> ! {
    log::error!("Memory[{file}:{line}] Assertion '{expression}' failed, {message}.");
    panic!("Memory[{file}:{line}] Assertion '{expression}' failed, {message}.");
}

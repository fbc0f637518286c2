/// Stack buffer with a known alignment, so that tests can make exact
/// assertions about padding and block counts.
#[repr(C, align(64))]
pub(crate) struct AlignedBuffer<const N: usize>([u8; N]);

impl<const N: usize> AlignedBuffer<N> {
    pub fn new() -> Self {
        Self([0; N])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }
}

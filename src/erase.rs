//! In-place erasure of caller-owned plaintext.
//!
//! Every write goes through [`zeroize`], so it cannot be optimized away even
//! though the buffer is never read again.

use core::slice;

use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Controls how much of a buffer's bookkeeping is erased along with its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZeroOptions {
    /// Also reset the owner's recorded length to zero, so that the length of
    /// the secret cannot be read back afterwards. Only owning containers
    /// (`String`, `Vec<u8>`) have a length to reset; for borrowed slices this
    /// flag has no effect.
    pub erase_length: bool,
}

impl Default for ZeroOptions {
    fn default() -> Self {
        Self { erase_length: true }
    }
}

/// A block of plaintext characters owned by the caller that can be wiped in place.
pub trait PlaintextBuffer {
    /// Current contents of the buffer.
    fn plaintext(&self) -> &[u8];

    /// Overwrites every byte of the buffer with zero.
    fn zero_with(&mut self, options: ZeroOptions);

    /// Overwrites every byte of the buffer with zero, resetting its length.
    #[inline]
    fn zero(&mut self) {
        self.zero_with(ZeroOptions::default())
    }
}

impl PlaintextBuffer for [u8] {
    fn plaintext(&self) -> &[u8] {
        self
    }

    fn zero_with(&mut self, _options: ZeroOptions) {
        self.zeroize();
    }
}

impl PlaintextBuffer for str {
    fn plaintext(&self) -> &[u8] {
        self.as_bytes()
    }

    fn zero_with(&mut self, options: ZeroOptions) {
        // NUL bytes are valid UTF-8.
        unsafe { self.as_bytes_mut() }.zero_with(options);
    }
}

impl PlaintextBuffer for Vec<u8> {
    fn plaintext(&self) -> &[u8] {
        self.as_slice()
    }

    fn zero_with(&mut self, options: ZeroOptions) {
        self.as_mut_slice().zeroize();
        // Bytes left behind by earlier truncations live past `len`.
        self.spare_capacity_mut().zeroize();

        if options.erase_length {
            self.clear();
        }
    }
}

impl PlaintextBuffer for String {
    fn plaintext(&self) -> &[u8] {
        self.as_bytes()
    }

    fn zero_with(&mut self, options: ZeroOptions) {
        // NUL bytes are valid UTF-8.
        unsafe { self.as_mut_vec() }.zero_with(options);
    }
}

/// Erases `buffer` in place with the default [`ZeroOptions`].
///
/// Usable on any plaintext the caller owns, independently of [`SecureString`](crate::SecureString).
#[inline]
pub fn zero<B: PlaintextBuffer + ?Sized>(buffer: &mut B) {
    buffer.zero();
}

/// Erases `len` bytes starting at `ptr`.
///
/// # Errors
/// Returns [`Error::InvalidArgument`] if `ptr` is null.
///
/// # Safety
/// `ptr` must be valid for writes of `len` bytes and must not be aliased
/// by any live reference for the duration of the call.
pub unsafe fn zero_raw(ptr: *mut u8, len: usize) -> Result<()> {
    if ptr.is_null() {
        return Err(Error::InvalidArgument("buffer pointer is null"));
    }

    slice::from_raw_parts_mut(ptr, len).zeroize();
    Ok(())
}

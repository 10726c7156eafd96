use core::{marker::PhantomData, ptr::NonNull, slice};

/// A raw, non-null pointer to `len` bytes that the possessor owns exclusively.
///
/// This is the byte-region counterpart of the standard library's internal
/// `Unique<T>`: it carries no lifetime, but asserts that nobody else aliases
/// the referent, which is what lets the secret memory types be `Send + Sync`.
#[derive(Clone, Copy)]
pub struct RawRegion {
    pointer: NonNull<u8>,
    len: usize,
    _marker: PhantomData<[u8]>,
}

impl RawRegion {
    /// Creates a region of `len` bytes starting at `pointer`.
    #[inline]
    pub const fn new(pointer: NonNull<u8>, len: usize) -> Self {
        RawRegion {
            pointer,
            len,
            _marker: PhantomData,
        }
    }

    /// Acquires the underlying `NonNull` pointer.
    #[inline]
    pub const fn as_non_null(self) -> NonNull<u8> {
        self.pointer
    }

    /// Borrows the region as a byte slice.
    ///
    /// # Safety
    /// The region must be mapped and readable for the whole lifetime `'a`.
    #[inline]
    pub unsafe fn as_slice<'a>(self) -> &'a [u8] {
        slice::from_raw_parts(self.pointer.as_ptr(), self.len)
    }

    /// Borrows the region as a mutable byte slice.
    ///
    /// # Safety
    /// The region must be mapped and writable for the whole lifetime `'a`,
    /// and no other reference to it may be alive meanwhile.
    #[inline]
    pub unsafe fn as_mut_slice<'a>(self) -> &'a mut [u8] {
        slice::from_raw_parts_mut(self.pointer.as_ptr(), self.len)
    }
}

/// `RawRegion` is `Send` because the bytes it references are unaliased.
/// The aliasing invariant is unenforced by the type system; the owning
/// memory type must enforce it.
unsafe impl Send for RawRegion {}

/// `RawRegion` is `Sync` because shared access only ever reads the bytes.
unsafe impl Sync for RawRegion {}

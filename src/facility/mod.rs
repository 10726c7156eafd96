//! The secure-memory facility a [`SecureString`](crate::SecureString) stores its
//! secret in.
//!
//! A facility allocates a block, encrypts plaintext into it in place,
//! decrypts it on demand into a temporary buffer and frees it again. Hosts
//! that have a native encrypted-memory primitive can implement
//! [`SecureMemoryFacility`] over it; everywhere else [`SoftwareFacility`]
//! is used.

use std::io;

pub mod software;

pub use software::SoftwareFacility;

/// Allocate-and-encrypt, decrypt-to-temporary and free over some secured memory.
pub trait SecureMemoryFacility {
    /// Opaque handle to an encrypted block.
    type Sealed;

    /// A temporary plaintext buffer produced by [`unseal`](Self::unseal).
    ///
    /// Its address must stay stable while it is alive. Callers zero it
    /// through `AsMut` before handing it to [`discard`](Self::discard).
    type Revealed: AsRef<[u8]> + AsMut<[u8]>;

    /// Allocates a block sized to `plaintext`, copies it in and encrypts it in place.
    fn seal(&self, plaintext: &[u8]) -> io::Result<Self::Sealed>;

    /// Decrypts `sealed` into a newly allocated temporary buffer.
    fn unseal(&self, sealed: &Self::Sealed) -> io::Result<Self::Revealed>;

    /// Releases a temporary buffer returned by [`unseal`](Self::unseal).
    fn discard(&self, revealed: Self::Revealed) -> io::Result<()>;

    /// Releases an encrypted block.
    fn free(&self, sealed: Self::Sealed) -> io::Result<()>;
}

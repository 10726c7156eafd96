use std::io;

mod ffi;
#[cfg(target_family = "unix")]
mod unix;
#[cfg(target_family = "windows")]
mod windows;

#[cfg(target_family = "unix")]
pub use unix::{
    UnixSecretMemory as PlatformSecretMemory, UnixSecretMemoryMut as PlatformSecretMemoryMut,
};
#[cfg(target_family = "windows")]
pub use windows::{
    WindowsSecretMemory as PlatformSecretMemory, WindowsSecretMemoryMut as PlatformSecretMemoryMut,
};

/// What to do when the operating system refuses to lock secret pages in RAM.
///
/// Locking is subject to per-process limits (`RLIMIT_MEMLOCK` on Unix, the
/// working set size on Windows), so strict locking can make allocations fail
/// in constrained environments such as containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockPolicy {
    /// Fail the allocation if the pages cannot be locked.
    Required,
    /// Keep the allocation unlocked and emit a warning.
    #[default]
    BestEffort,
}

/// Trait representing secret memory that allows read-only access.
///
/// Implementors of this trait should ensure that the memory is secured
/// and not accessible by unauthorized processes or memory dumps.
pub trait SecretMemory: AsRef<[u8]> {
    /// Provides a byte slice view of the secret memory.
    /// This function is a convenience wrapper around the `AsRef` implementation.
    #[inline]
    fn as_bytes(&self) -> &[u8] {
        self.as_ref()
    }

    /// Zeroes and unmaps the memory, reporting the first OS failure.
    ///
    /// Dropping the value performs the same steps but can only log failures.
    fn free(self) -> io::Result<()>
    where
        Self: Sized;
}

/// Trait representing secret memory that allows mutable access.
///
/// Memory allocated via this trait can later be converted into
/// a read-only form to further protect the data.
pub trait SecretMemoryMut: AsMut<[u8]> + SecretMemory + Sized {
    /// Associated immutable memory type to convert
    /// to when read-only access is required.
    type ReadOnly: SecretMemory + TryFrom<Self, Error = io::Error>;

    /// Allocates a new zero-filled memory region of `len` bytes.
    ///
    /// A length of zero is valid, the backing mapping is always at least one page.
    fn allocate(len: usize, policy: LockPolicy) -> io::Result<Self>;

    /// Converts the memory allocation to a read-only version, consuming the
    /// original mutable allocation. On failure the memory is zeroed and freed.
    #[inline]
    fn into_read_only(self) -> io::Result<Self::ReadOnly> {
        Self::ReadOnly::try_from(self)
    }

    /// Provides a mutable byte slice view of the secret memory.
    /// This function is a convenience wrapper around the `AsMut` implementation.
    #[inline]
    fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.as_mut()
    }
}

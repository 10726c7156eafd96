use core::mem::ManuallyDrop;
use std::io;

use libc::{PROT_READ, PROT_WRITE};
use tracing::{error, warn};
use zeroize::Zeroize;

use super::{ffi, LockPolicy, SecretMemory, SecretMemoryMut};
use crate::util::RawRegion;

/// `madvise` pair used to keep secret pages out of core dumps, and to undo it.
#[cfg(any(target_os = "linux", target_os = "android"))]
const DUMP_ADVICE: Option<(i32, i32)> = Some((libc::MADV_DONTDUMP, libc::MADV_DODUMP));
#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
const DUMP_ADVICE: Option<(i32, i32)> = Some((libc::MADV_NOCORE, libc::MADV_CORE));
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "dragonfly"
)))]
const DUMP_ADVICE: Option<(i32, i32)> = None;

#[cfg(target_os = "linux")]
fn memfd_secret_available() -> bool {
    static AVAILABLE: std::sync::OnceLock<bool> = std::sync::OnceLock::new();
    *AVAILABLE.get_or_init(ffi::unix::memfd_secret_available)
}

/// A page-granular mapping shared by the mutable and read-only forms.
///
/// `region` covers the caller-visible bytes, `mapped` the whole mapping.
/// Dropping a `Mapping` zeroes and unmaps it.
struct Mapping {
    region: RawRegion,
    mapped: usize,
    writable: bool,
    locked: bool,
    dump_excluded: bool,
}

impl Mapping {
    fn new(len: usize, policy: LockPolicy) -> io::Result<Self> {
        let mapped = ffi::mapping_len(len)?;

        if let Some(mapping) = Self::new_secret_fd(len, mapped) {
            return Ok(mapping);
        }

        let ptr = ffi::unix::mmap_anonymous(mapped, PROT_READ | PROT_WRITE)?.cast::<u8>();
        let mut mapping = Self {
            region: RawRegion::new(ptr, len),
            mapped,
            writable: true,
            locked: false,
            dump_excluded: false,
        };

        // Early returns below drop `mapping`, which unmaps it.
        match ffi::unix::mlock(ptr, mapped) {
            Ok(()) => mapping.locked = true,
            Err(err) if policy == LockPolicy::BestEffort => {
                warn!(error = %err, "Unable to lock secret memory, it may be swapped to disk")
            }
            Err(err) => return Err(err),
        }

        if let Some((exclude, _)) = DUMP_ADVICE {
            ffi::unix::madvise(ptr, mapped, exclude)?;
            mapping.dump_excluded = true;
        }

        Ok(mapping)
    }

    /// Maps `memfd_secret` pages. They are unswappable and absent from the
    /// kernel's direct map, so no locking or dump advice is applied.
    #[cfg(target_os = "linux")]
    fn new_secret_fd(len: usize, mapped: usize) -> Option<Self> {
        if !memfd_secret_available() {
            return None;
        }

        match ffi::unix::mmap_memfd_secret(mapped, PROT_READ | PROT_WRITE) {
            Ok(ptr) => Some(Self {
                region: RawRegion::new(ptr.cast(), len),
                mapped,
                writable: true,
                locked: false,
                dump_excluded: false,
            }),
            Err(err) => {
                tracing::debug!(
                    error = %err,
                    "memfd_secret mapping failed, using anonymous memory"
                );
                None
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn new_secret_fd(_len: usize, _mapped: usize) -> Option<Self> {
        None
    }

    fn make_read_only(&mut self) -> io::Result<()> {
        ffi::unix::mprotect(self.region.as_non_null(), self.mapped, PROT_READ)?;
        self.writable = false;
        Ok(())
    }

    fn release(self) -> io::Result<()> {
        let mut this = ManuallyDrop::new(self);
        this.release_in_place()
    }

    fn release_in_place(&mut self) -> io::Result<()> {
        let ptr = self.region.as_non_null();

        // NOTE Protection acts on an entire page, not a section.
        if !self.writable {
            ffi::unix::mprotect(ptr, self.mapped, PROT_READ | PROT_WRITE)?;
            self.writable = true;
        }

        Zeroize::zeroize(unsafe { RawRegion::new(ptr, self.mapped).as_mut_slice() });

        // May fail (unchecked)
        if let (true, Some((_, include))) = (self.dump_excluded, DUMP_ADVICE) {
            let _ = ffi::unix::madvise(ptr, self.mapped, include);
        }
        if self.locked {
            let _ = ffi::unix::munlock(ptr, self.mapped);
        }

        ffi::unix::munmap(ptr, self.mapped)
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Err(err) = self.release_in_place() {
            error!(error = %err, "Failed to release secret memory");
        }
    }
}

/// A mutable secret memory allocation on Unix-based systems.
///
/// The memory is obtained from `memfd_secret` when the Linux kernel offers
/// it, otherwise from an anonymous private mapping that is `mlock`ed and
/// excluded from core dumps.
pub struct UnixSecretMemoryMut {
    mapping: Mapping,
}

impl SecretMemory for UnixSecretMemoryMut {
    fn free(self) -> io::Result<()> {
        self.mapping.release()
    }
}

impl SecretMemoryMut for UnixSecretMemoryMut {
    type ReadOnly = UnixSecretMemory;

    fn allocate(len: usize, policy: LockPolicy) -> io::Result<Self> {
        Mapping::new(len, policy).map(|mapping| Self { mapping })
    }
}

impl AsRef<[u8]> for UnixSecretMemoryMut {
    fn as_ref(&self) -> &[u8] {
        unsafe { self.mapping.region.as_slice() }
    }
}

impl AsMut<[u8]> for UnixSecretMemoryMut {
    fn as_mut(&mut self) -> &mut [u8] {
        unsafe { self.mapping.region.as_mut_slice() }
    }
}

/// A read-only secret memory allocation on Unix-based systems.
///
/// Obtained from [`UnixSecretMemoryMut`] by revoking write access with `mprotect`.
pub struct UnixSecretMemory {
    mapping: Mapping,
}

impl SecretMemory for UnixSecretMemory {
    fn free(self) -> io::Result<()> {
        self.mapping.release()
    }
}

impl AsRef<[u8]> for UnixSecretMemory {
    fn as_ref(&self) -> &[u8] {
        unsafe { self.mapping.region.as_slice() }
    }
}

impl TryFrom<UnixSecretMemoryMut> for UnixSecretMemory {
    type Error = io::Error;

    fn try_from(value: UnixSecretMemoryMut) -> Result<Self, Self::Error> {
        let UnixSecretMemoryMut { mut mapping } = value;
        // On error `mapping` is dropped, freeing the memory
        mapping.make_read_only()?;
        Ok(Self { mapping })
    }
}

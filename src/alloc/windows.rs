use core::mem::ManuallyDrop;
use std::io;

use tracing::{error, warn};
use windows_sys::Win32::System::Memory::{PAGE_READONLY, PAGE_READWRITE};
use zeroize::Zeroize;

use super::{ffi, LockPolicy, SecretMemory, SecretMemoryMut};
use crate::util::RawRegion;

/// A committed `VirtualAlloc` region shared by the mutable and read-only forms.
///
/// Dropping a `Mapping` zeroes and releases it.
struct Mapping {
    region: RawRegion,
    mapped: usize,
    writable: bool,
    locked: bool,
}

impl Mapping {
    fn new(len: usize, policy: LockPolicy) -> io::Result<Self> {
        let mapped = ffi::mapping_len(len)?;
        let ptr = ffi::windows::virtual_alloc(mapped)?.cast::<u8>();

        let mut mapping = Self {
            region: RawRegion::new(ptr, len),
            mapped,
            writable: true,
            locked: false,
        };

        // An early return drops `mapping`, which releases it.
        match ffi::windows::virtual_lock(ptr, mapped) {
            Ok(()) => mapping.locked = true,
            Err(err) if policy == LockPolicy::BestEffort => {
                warn!(error = %err, "Unable to lock secret memory, it may be paged out")
            }
            Err(err) => return Err(err),
        }

        Ok(mapping)
    }

    fn make_read_only(&mut self) -> io::Result<()> {
        ffi::windows::virtual_protect(self.region.as_non_null(), self.mapped, PAGE_READONLY)?;
        self.writable = false;
        Ok(())
    }

    fn release(self) -> io::Result<()> {
        let mut this = ManuallyDrop::new(self);
        this.release_in_place()
    }

    fn release_in_place(&mut self) -> io::Result<()> {
        let ptr = self.region.as_non_null();

        if !self.writable {
            ffi::windows::virtual_protect(ptr, self.mapped, PAGE_READWRITE)?;
            self.writable = true;
        }

        Zeroize::zeroize(unsafe { RawRegion::new(ptr, self.mapped).as_mut_slice() });

        // May fail (unchecked)
        if self.locked {
            let _ = ffi::windows::virtual_unlock(ptr, self.mapped);
        }

        ffi::windows::virtual_free(ptr)
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Err(err) = self.release_in_place() {
            error!(error = %err, "Failed to release secret memory");
        }
    }
}

/// A mutable secret memory allocation on Windows systems.
///
/// The memory is secured using `VirtualAlloc` and `VirtualLock`. It can be
/// converted into a read-only version once modifications are no longer needed.
pub struct WindowsSecretMemoryMut {
    mapping: Mapping,
}

impl SecretMemory for WindowsSecretMemoryMut {
    fn free(self) -> io::Result<()> {
        self.mapping.release()
    }
}

impl SecretMemoryMut for WindowsSecretMemoryMut {
    type ReadOnly = WindowsSecretMemory;

    fn allocate(len: usize, policy: LockPolicy) -> io::Result<Self> {
        Mapping::new(len, policy).map(|mapping| Self { mapping })
    }
}

impl AsRef<[u8]> for WindowsSecretMemoryMut {
    fn as_ref(&self) -> &[u8] {
        unsafe { self.mapping.region.as_slice() }
    }
}

impl AsMut<[u8]> for WindowsSecretMemoryMut {
    fn as_mut(&mut self) -> &mut [u8] {
        unsafe { self.mapping.region.as_mut_slice() }
    }
}

/// A read-only secret memory allocation on Windows systems.
///
/// Obtained from [`WindowsSecretMemoryMut`] through `VirtualProtect`.
pub struct WindowsSecretMemory {
    mapping: Mapping,
}

impl SecretMemory for WindowsSecretMemory {
    fn free(self) -> io::Result<()> {
        self.mapping.release()
    }
}

impl AsRef<[u8]> for WindowsSecretMemory {
    fn as_ref(&self) -> &[u8] {
        unsafe { self.mapping.region.as_slice() }
    }
}

impl TryFrom<WindowsSecretMemoryMut> for WindowsSecretMemory {
    type Error = io::Error;

    fn try_from(value: WindowsSecretMemoryMut) -> Result<Self, Self::Error> {
        let WindowsSecretMemoryMut { mut mapping } = value;
        // Calls the `mapping` destructor on error, freeing the allocation
        mapping.make_read_only()?;
        Ok(Self { mapping })
    }
}

use core::ptr::{self, NonNull};
use std::io;

/// Creates a memory-mapped region backed by a Linux secret memory file.
///
/// Wraps the `SYS_memfd_secret`, `ftruncate` and `mmap` system calls.
/// Pages of such a region are removed from the kernel's direct map and
/// are never swapped out.
///
/// # Arguments
///
/// * `len` - The length of the memory region.
/// * `prot` - Memory protection flags.
///
/// # Returns
///
/// * A result containing a non-null pointer to the memory region on success,
///   or an I/O error on failure.
#[cfg(target_os = "linux")]
pub fn mmap_memfd_secret(len: usize, prot: i32) -> io::Result<NonNull<[u8]>> {
    let fd = match unsafe { libc::syscall(libc::SYS_memfd_secret, 0) } {
        -1 => return Err(io::Error::last_os_error()),
        fd => fd as libc::c_int,
    };

    let result = match unsafe { libc::ftruncate(fd, len as libc::off_t) } {
        -1 => Err(io::Error::last_os_error()),
        _ => self::mmap_impl(len, prot, libc::MAP_SHARED, fd),
    };

    unsafe { libc::close(fd) };
    result
}

/// Checks if the `memfd_secret` system call is usable on the current system.
///
/// The call is refused with `ENOSYS` on kernels built without
/// `CONFIG_SECRETMEM`, and with `EPERM`/`ENOMEM` when it is disabled at boot
/// or filtered by a sandbox. Any failure counts as unavailable.
///
/// # Returns
///
/// * Boolean indicating whether `memfd_secret` is supported or not.
#[cfg(target_os = "linux")]
pub fn memfd_secret_available() -> bool {
    match unsafe { libc::syscall(libc::SYS_memfd_secret, 0) } {
        -1 => false,
        fd => {
            unsafe { libc::close(fd as libc::c_int) };
            true
        }
    }
}

/// Maps an anonymous, private memory region into the process's address space.
///
/// Wraps the `mmap` system call.
///
/// # Arguments
///
/// * `len` - The length of the memory region.
/// * `prot` - Memory protection flags.
///
/// # Returns
///
/// * A result containing a non-null pointer to the memory region on success,
///   or an I/O error on failure.
pub fn mmap_anonymous(len: usize, prot: i32) -> io::Result<NonNull<[u8]>> {
    self::mmap_impl(len, prot, libc::MAP_PRIVATE | libc::MAP_ANON, -1)
}

/// Changes the access protection of a memory region.
///
/// Wraps the `mprotect` system call.
///
/// # Arguments
///
/// * `ptr` - A non-null, page-aligned pointer to the memory region.
/// * `len` - The length of the memory region.
/// * `prot` - The new protection flags.
///
/// # Returns
///
/// * A result indicating success or an I/O error on failure.
pub fn mprotect(ptr: NonNull<u8>, len: usize, prot: i32) -> io::Result<()> {
    match unsafe { libc::mprotect(ptr.as_ptr() as _, len, prot) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Provides advice about the use of memory.
///
/// Wraps the `madvise` system call.
///
/// # Arguments
///
/// * `ptr` - A non-null pointer to the memory region.
/// * `len` - The length of the memory region.
/// * `advice` - The advice to be given.
///
/// # Returns
///
/// * A result indicating success or an I/O error on failure.
pub fn madvise(ptr: NonNull<u8>, len: usize, advice: i32) -> io::Result<()> {
    match unsafe { libc::madvise(ptr.as_ptr() as _, len, advice) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Locks a memory region, preventing it from being paged out to swap.
///
/// Wraps the `mlock` system call.
///
/// # Arguments
///
/// * `ptr` - A non-null pointer to the memory region.
/// * `len` - The length of the memory region.
///
/// # Returns
///
/// * A result indicating success or an I/O error on failure.
pub fn mlock(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    match unsafe { libc::mlock(ptr.as_ptr() as _, len) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Unlocks a memory region, allowing it to be paged out to swap.
///
/// Wraps the `munlock` system call.
///
/// # Arguments
///
/// * `ptr` - A non-null pointer to the memory region.
/// * `len` - The length of the memory region.
///
/// # Returns
///
/// * A result indicating success or an I/O error on failure.
pub fn munlock(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    match unsafe { libc::munlock(ptr.as_ptr() as _, len) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Unmaps a memory region within the process's address space.
///
/// Wraps the `munmap` system call.
///
/// # Arguments
///
/// * `ptr` - A non-null pointer to the memory region.
/// * `len` - The length of the memory region.
///
/// # Returns
///
/// * A result indicating success or an I/O error on failure.
pub fn munmap(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    match unsafe { libc::munmap(ptr.as_ptr() as _, len) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Used by `mmap_anonymous` and `mmap_memfd_secret` functions
#[inline]
fn mmap_impl(len: usize, prot: i32, flags: i32, fd: i32) -> io::Result<NonNull<[u8]>> {
    match unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, fd, 0) } {
        libc::MAP_FAILED => Err(io::Error::last_os_error()),
        ptr => {
            let ptr = unsafe { NonNull::new_unchecked(ptr as *mut u8) };
            Ok(NonNull::slice_from_raw_parts(ptr, len))
        }
    }
}

/// Retrieves the system's page size.
///
/// Wraps the `sysconf` system call on Unix-like systems
/// and `vm_page_size` on macOS.
///
/// # Returns
///
/// * The size of a memory page in bytes.
#[inline]
pub(super) fn page_size() -> usize {
    #[cfg(target_os = "macos")]
    unsafe {
        libc::vm_page_size as usize
    }
    #[cfg(not(target_os = "macos"))]
    unsafe {
        libc::sysconf(libc::_SC_PAGESIZE) as usize
    }
}

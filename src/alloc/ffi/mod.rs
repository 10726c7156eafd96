use std::{io, sync::OnceLock};

#[cfg(target_family = "unix")]
pub mod unix;
#[cfg(target_family = "windows")]
pub mod windows;

/// Retrieves the system's page size.
///
/// # Platform-specific behavior
/// - **Unix-based systems (Linux, macOS, etc.):**
///   - On macOS, this function uses `libc::vm_page_size` to determine the page size.
///   - On other Unix systems, it uses `libc::sysconf` to get the page size.
///
/// - **Windows:** The function retrieves the page size by calling `GetSystemInfo`
///   and extracting the `dwPageSize` field from the `SYSTEM_INFO` structure.
///
/// # Returns
///
/// * The size of a memory page in bytes.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    #[cfg(target_family = "unix")]
    {
        *PAGE_SIZE.get_or_init(self::unix::page_size)
    }
    #[cfg(target_family = "windows")]
    {
        *PAGE_SIZE.get_or_init(self::windows::page_size)
    }
}

/// Rounds `len` up to a whole number of pages, never less than one page.
///
/// # Returns
///
/// * The mapping length in bytes, or an `InvalidInput` error when the
///   rounded length would not fit in an `isize`.
pub fn mapping_len(len: usize) -> io::Result<usize> {
    let page = self::page_size();
    let pages = len.max(1).checked_add(page - 1).map(|n| n / page);

    match pages.and_then(|pages| pages.checked_mul(page)) {
        Some(mapped) if mapped <= isize::MAX as usize => Ok(mapped),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "length out of bounds",
        )),
    }
}

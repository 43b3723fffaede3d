//! Linux perf ring mapping

use crate::buffer::{Region, SharedBuffer};
use crate::error::{CaptureError, CaptureResult};
use std::os::fd::RawFd;
use std::ptr::NonNull;
use syscap_core::BufferId;
use tracing::{debug, info};

/// System page size
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Map the ring of an already opened perf event fd
///
/// The mapping is one metadata page followed by `data_pages` pages of data;
/// `data_pages` must be a power of two. The data region location is taken
/// from the descriptor page the kernel filled in.
pub fn map_perf_buffer(id: BufferId, fd: RawFd, data_pages: usize) -> CaptureResult<SharedBuffer> {
    if data_pages == 0 || !data_pages.is_power_of_two() {
        return Err(CaptureError::InvalidLayout(format!(
            "{} data pages is not a power of two",
            data_pages
        )));
    }

    let page = page_size();
    let len = page
        .checked_mul(data_pages + 1)
        .ok_or_else(|| CaptureError::InvalidLayout("mapping size overflows".to_string()))?;

    // SAFETY: plain shared mapping of an fd we do not own; the result is
    // checked before use.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(CaptureError::Io(std::io::Error::last_os_error()));
    }
    let base = NonNull::new(addr as *mut u8)
        .ok_or_else(|| CaptureError::InvalidLayout("mmap returned null".to_string()))?;
    debug!(buffer = id, fd, len, "mapped perf ring");

    // SAFETY: the mapping is live, `len` bytes long and now owned by the region
    let region = unsafe { Region::from_mmap(base, len)? };
    info!(
        buffer = id,
        data_size = region.data_size(),
        "perf ring ready"
    );
    Ok(SharedBuffer::from_region(id, region))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
    }

    #[test]
    fn test_rejects_odd_page_count() {
        assert!(matches!(
            map_perf_buffer(0, -1, 3),
            Err(CaptureError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_bad_fd_is_io_error() {
        assert!(matches!(
            map_perf_buffer(0, -1, 1),
            Err(CaptureError::Io(_))
        ));
    }
}

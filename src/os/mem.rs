use std::{
    fmt, io,
    ptr::{self, NonNull},
    sync::LazyLock,
};

use libc::{mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use log::{debug, error};

use crate::util::{hint::cold, num::round_up};

static PAGE_SIZE: LazyLock<usize> = LazyLock::new(page_size::get);

/// The OS page size, which every reservation is rounded up to
pub fn os_page_size() -> usize {
    *PAGE_SIZE
}

#[non_exhaustive]
#[derive(Debug)]
pub enum VmError {
    /// The OS refused to hand out the region
    ReservationFailed(io::Error),
    /// Someone asked for nothing
    ZeroSized,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::ReservationFailed(e) => write!(f, "VM reservation failed: {e}"),
            VmError::ZeroSized => write!(f, "attempted to reserve 0 bytes"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::ReservationFailed(e) => Some(e),
            VmError::ZeroSized => None,
        }
    }
}

/// Where pages come from. Implementations hand out committed, read/write
/// memory that stays at the same address until it is released.
pub trait VirtualMemory {
    /// Reserve at least `size` bytes of committed read/write memory. The
    /// returned region is aligned to at least the OS page size.
    fn reserve(&self, size: usize) -> Result<NonNull<u8>, VmError>;

    /// # Safety
    ///
    /// - `ptr` must have been returned by `reserve(size)` on this same
    ///   collaborator, and not released since
    /// - Nothing may touch the region afterwards
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize);
}

/// Anonymous private `mmap()` regions.
#[derive(Clone, Copy, Debug, Default)]
pub struct Mmap;

impl VirtualMemory for Mmap {
    fn reserve(&self, size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ZeroSized);
        }
        let size = round_up(size, os_page_size());
        // SAFETY: anonymous mapping with no hint address, we never pass a
        // file descriptor so there is nothing else to uphold.
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_ANONYMOUS | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            return cold(|| {
                let e = io::Error::last_os_error();
                error!("mmap({size}) failed: {e}");
                Err(VmError::ReservationFailed(e))
            });
        }
        debug!("mmap({size}) -> {ptr:p}");
        NonNull::new(ptr as *mut u8).ok_or_else(|| {
            VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::Other,
                "mmap() returned the null page",
            ))
        })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        let size = round_up(size, os_page_size());
        // SAFETY:
        // - The address is a multiple of the page size, because it came from
        //   `reserve()`
        // - `size` rounds the same way it did at reservation time, so all of
        //   the mapping (and only the mapping) goes away
        let rc = unsafe { munmap(ptr.as_ptr() as _, size) };
        if rc != 0 {
            cold(|| error!("munmap({:p}, {size}) failed: {}", ptr, io::Error::last_os_error()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmap_region_is_page_aligned_and_writable() {
        let size = 4096 + 40;
        let ptr = Mmap.reserve(size).expect("mmap should succeed");
        assert_eq!(ptr.as_ptr() as usize % os_page_size(), 0);
        unsafe {
            ptr.as_ptr().write_bytes(0xab, size);
            assert_eq!(ptr.as_ptr().add(size - 1).read(), 0xab);
            Mmap.release(ptr, size);
        }
    }

    #[test]
    fn zero_sized_reservation_is_refused() {
        assert!(matches!(Mmap.reserve(0), Err(VmError::ZeroSized)));
    }
}

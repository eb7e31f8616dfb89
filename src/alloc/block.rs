use std::{mem, ptr::NonNull};

use crate::util::num::units_for;

use super::page::BLOCK_SIZE;

/// Every allocation starts with its requested size, stored as a `u32`
pub const HEADER_SIZE: usize = mem::size_of::<u32>();

/// Blocks needed to hold `size` user bytes plus the header
pub fn blocks_for(size: usize) -> usize {
    units_for(size + HEADER_SIZE, BLOCK_SIZE)
}

/// A claimed block run, seen from the inside: where the header lives and
/// how many bytes the user asked for. Only [`BlockHandle::user_ptr()`] ever
/// leaves the allocator.
///
/// ```plaintext
/// +--------------------+ <- base (block aligned)
/// | u32 size header    | HEADER_SIZE bytes
/// +--------------------+ <- user_ptr
/// | requested bytes    | size bytes
/// +--------------------+
/// | slack up to the    |
/// | next block         |
/// +--------------------+
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHandle {
    base: NonNull<u8>,
    size: u32,
}

impl BlockHandle {
    /// Stamp the header for a fresh allocation of `size` bytes at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be the start of a claimed run of at least
    /// `blocks_for(size)` blocks.
    pub unsafe fn init(base: NonNull<u8>, size: u32) -> Self {
        // SAFETY: the run is at least one block, so the header fits. Blocks
        // are only 32-byte aligned relative to the page, so stay unaligned.
        unsafe { base.cast::<u32>().as_ptr().write_unaligned(size) };
        Self { base, size }
    }

    /// Recover the handle from a pointer we handed out.
    ///
    /// # Safety
    ///
    /// `user_ptr` must have come from [`BlockHandle::user_ptr()`] on a run
    /// that is still claimed.
    pub unsafe fn from_user_ptr(user_ptr: NonNull<u8>) -> Self {
        // SAFETY: caller guarantees the header sits right before `user_ptr`
        let base = unsafe { NonNull::new_unchecked(user_ptr.as_ptr().sub(HEADER_SIZE)) };
        let size = unsafe { base.cast::<u32>().as_ptr().read_unaligned() };
        Self { base, size }
    }

    /// Address of the header
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// The size recorded in the header
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// How many blocks this handle's run spans
    pub fn blocks(&self) -> usize {
        blocks_for(self.size())
    }

    /// The pointer the caller gets
    pub fn user_ptr(&self) -> NonNull<u8> {
        // SAFETY: the header is inside the run, so one-past-the-header is at
        // worst one past the end of it
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(HEADER_SIZE)) }
    }
}

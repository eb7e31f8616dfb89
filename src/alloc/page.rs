//! A [`Page`] is one reservation from the [`VirtualMemory`] collaborator,
//! laid out like this:
//!
//! ```plaintext
//! +--------------------+ <- reservation start (OS page aligned)
//! | block 0            | BLOCK_SIZE bytes
//! | block 1            |
//! .                    .
//! | block 127          |
//! +--------------------+ <- PAGE_SIZE
//! | PageTail           | bitmap, free count, neighbour links
//! +--------------------+
//! ```
//!
//! [`VirtualMemory`]: crate::os::mem::VirtualMemory

use std::{mem, ptr::NonNull};

use super::bitvec::BlockBitMap;

/// Size of one block, the smallest unit handed out
pub const BLOCK_SIZE: usize = 32;

/// Number of blocks in one page arena
pub const BLOCKS_PER_PAGE: usize = 128;

/// Usable bytes in one page arena
pub const PAGE_SIZE: usize = BLOCKS_PER_PAGE * BLOCK_SIZE;

/// Bytes requested from the OS for every page, tail included
pub const PAGE_RESERVATION: usize = mem::size_of::<Page>();

pub type PageBitMap = BlockBitMap<{ BLOCKS_PER_PAGE / 64 }>;

/// Bookkeeping stored right after the arena.
#[repr(C)]
pub struct PageTail {
    pub(crate) bit_map: PageBitMap,
    pub(crate) free_block_count: u32,
    /// Newer neighbour (towards the chain head)
    pub(crate) prev_page: Option<NonNull<Page>>,
    /// Older neighbour (away from the chain head)
    pub(crate) next_page: Option<NonNull<Page>>,
}

impl PageTail {
    pub const fn empty() -> Self {
        Self {
            bit_map: PageBitMap::new(),
            free_block_count: BLOCKS_PER_PAGE as u32,
            prev_page: None,
            next_page: None,
        }
    }
}

#[repr(C)]
pub struct Page {
    block: [u8; PAGE_SIZE],
    pub(crate) tail: PageTail,
}

impl Page {
    /// First byte of the arena
    pub fn arena_start(&self) -> usize {
        self.block.as_ptr() as usize
    }

    /// Does `addr` point into this page's arena?
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.arena_start();
        addr >= start && addr < start + PAGE_SIZE
    }

    pub fn free_block_count(&self) -> usize {
        self.tail.free_block_count as usize
    }

    pub fn bit_map(&self) -> &PageBitMap {
        &self.tail.bit_map
    }

    /// Address of block `index`
    pub fn block_address(&mut self, index: usize) -> NonNull<u8> {
        debug_assert!(index < BLOCKS_PER_PAGE);
        // SAFETY: `index` is within the arena, and the arena is part of a
        // live reservation so the pointer cannot be null.
        unsafe { NonNull::new_unchecked(self.block.as_mut_ptr().add(index * BLOCK_SIZE)) }
    }

    /// Which block `addr` falls in. `addr` must be inside the arena.
    pub fn block_index(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr));
        (addr - self.arena_start()) / BLOCK_SIZE
    }

    /// Cheap reject: could this page possibly hold `needed` blocks? A `true`
    /// here says nothing about fragmentation.
    pub fn may_fit(&self, needed: usize) -> bool {
        self.free_block_count() >= needed
    }

    /// First-fit claim of `needed` consecutive blocks, returning the index of
    /// the first one.
    pub fn claim_run(&mut self, needed: usize) -> Option<usize> {
        if !self.may_fit(needed) {
            return None;
        }
        let start = self.tail.bit_map.find_free_run(needed)?;
        self.mark_run(start, needed);
        Some(start)
    }

    /// Mark `[start, start + needed)` used and charge it to the free count.
    pub fn mark_run(&mut self, start: usize, needed: usize) {
        debug_assert!(!(start..start + needed).any(|i| self.tail.bit_map.get(i)));
        self.tail.bit_map.set_range_high(start, needed);
        self.tail.free_block_count -= needed as u32;
    }

    /// Give `[start, start + len)` back.
    pub fn release_run(&mut self, start: usize, len: usize) {
        debug_assert!(self.tail.bit_map.range_is_high(start, len));
        self.tail.bit_map.set_range_low(start, len);
        self.tail.free_block_count += len as u32;
    }

    /// Does the free count agree with the bitmap?
    pub fn is_consistent(&self) -> bool {
        self.free_block_count() == self.tail.bit_map.count_low()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed_page() -> Box<Page> {
        Box::new(Page {
            block: [0; PAGE_SIZE],
            tail: PageTail::empty(),
        })
    }

    #[test]
    fn layout_puts_tail_after_arena() {
        assert_eq!(mem::offset_of!(Page, tail), PAGE_SIZE);
        assert!(PAGE_RESERVATION > PAGE_SIZE);
    }

    #[test]
    fn claim_and_release_keep_count_in_sync() {
        let mut page = boxed_page();
        assert_eq!(page.claim_run(3), Some(0));
        assert_eq!(page.claim_run(2), Some(3));
        assert_eq!(page.free_block_count(), BLOCKS_PER_PAGE - 5);
        assert!(page.is_consistent());

        page.release_run(0, 3);
        assert_eq!(page.free_block_count(), BLOCKS_PER_PAGE - 2);
        assert_eq!(page.claim_run(1), Some(0));
        assert!(page.is_consistent());
    }

    #[test]
    fn full_page_rejects_without_scanning() {
        let mut page = boxed_page();
        assert_eq!(page.claim_run(BLOCKS_PER_PAGE), Some(0));
        assert_eq!(page.free_block_count(), 0);
        assert!(!page.may_fit(1));
        assert_eq!(page.claim_run(1), None);
    }

    #[test]
    fn block_addresses_map_back_to_indices() {
        let mut page = boxed_page();
        let addr = page.block_address(17).as_ptr() as usize;
        assert!(page.contains(addr));
        assert_eq!(page.block_index(addr), 17);
        assert_eq!(page.block_index(addr + BLOCK_SIZE - 1), 17);
        assert!(!page.contains(page.arena_start() + PAGE_SIZE));
    }
}

//! Per-page block bitmap. Bit `i` describes block `i` of the page arena:
//! `1` means the block is in use, `0` means it is free. Bits are stored
//! lsb-first inside each chunk, so block 0 is bit 0 of chunk 0.

use std::fmt;

pub type BitChunk = u64;

fn index_offset(index: usize) -> (usize, usize) {
    let chunk_index = index / BitChunk::BITS as usize;
    let bit_offset = index % BitChunk::BITS as usize;
    (chunk_index, bit_offset)
}

/// A fixed-size bitmap of `N` chunks, i.e. `N * 64` blocks.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BlockBitMap<const N: usize> {
    chunks: [BitChunk; N],
}

impl<const N: usize> BlockBitMap<N> {
    /// How many blocks this bitmap can describe
    pub const BITS: usize = N * BitChunk::BITS as usize;

    /// An all-free bitmap
    pub const fn new() -> Self {
        Self { chunks: [0; N] }
    }

    /// Is block `index` in use?
    pub fn get(&self, index: usize) -> bool {
        let (chunk_index, bit_index) = index_offset(index);
        (self.chunks[chunk_index] >> bit_index) & 1 == 1
    }

    /// Set the bit at `index` to `1`
    pub fn set_high(&mut self, index: usize) {
        let (chunk_index, bit_index) = index_offset(index);
        self.chunks[chunk_index] |= 1 << bit_index;
    }

    /// Set the bit at `index` to `0`
    pub fn set_low(&mut self, index: usize) {
        let (chunk_index, bit_index) = index_offset(index);
        self.chunks[chunk_index] &= !(1 << bit_index);
    }

    /// Mark `[start, start + len)` as used.
    ///
    /// # Panics
    /// - If the range runs off the end of the bitmap
    pub fn set_range_high(&mut self, start: usize, len: usize) {
        assert!(start + len <= Self::BITS, "bit range out of bounds");
        for index in start..start + len {
            self.set_high(index);
        }
    }

    /// Mark `[start, start + len)` as free.
    ///
    /// # Panics
    /// - If the range runs off the end of the bitmap
    pub fn set_range_low(&mut self, start: usize, len: usize) {
        assert!(start + len <= Self::BITS, "bit range out of bounds");
        for index in start..start + len {
            self.set_low(index);
        }
    }

    /// Are all of `[start, start + len)` in use?
    pub fn range_is_high(&self, start: usize, len: usize) -> bool {
        start + len <= Self::BITS && (start..start + len).all(|index| self.get(index))
    }

    /// Number of free blocks
    pub fn count_low(&self) -> usize {
        self.chunks.iter().map(|c| c.count_zeros() as usize).sum()
    }

    /// Linear first-fit scan: the start of the first run of at least
    /// `needed` consecutive free blocks.
    pub fn find_free_run(&self, needed: usize) -> Option<usize> {
        if needed == 0 || needed > Self::BITS {
            return None;
        }
        let mut run_start = 0;
        let mut run_len = 0;
        for index in 0..Self::BITS {
            if self.get(index) {
                run_len = 0;
                run_start = index + 1;
            } else {
                run_len += 1;
                if run_len == needed {
                    return Some(run_start);
                }
            }
        }
        None
    }

    pub fn chunks(&self) -> &[BitChunk; N] {
        &self.chunks
    }
}

impl<const N: usize> Default for BlockBitMap<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Debug for BlockBitMap<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for chunk in self.chunks.iter() {
            write!(f, "{chunk:064b} ")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Map = BlockBitMap<2>;

    #[test]
    fn set_and_clear_single_bits() {
        let mut map = Map::new();
        map.set_high(0);
        map.set_high(63);
        map.set_high(64);
        assert!(map.get(0) && map.get(63) && map.get(64));
        assert!(!map.get(1));
        assert_eq!(map.chunks()[0], 1 | (1 << 63));
        assert_eq!(map.chunks()[1], 1);
        map.set_low(63);
        assert!(!map.get(63));
        assert_eq!(map.count_low(), 128 - 2);
    }

    #[test]
    fn range_crosses_chunk_boundary() {
        let mut map = Map::new();
        map.set_range_high(60, 8);
        assert!(map.range_is_high(60, 8));
        assert!(!map.get(59));
        assert!(!map.get(68));
        assert_eq!(map.count_low(), 120);
        map.set_range_low(60, 8);
        assert_eq!(map, Map::new());
    }

    #[test]
    fn first_fit_returns_run_start_not_scan_cursor() {
        let mut map = Map::new();
        // used: 0..3, free: 3..5, used: 5, free: 6..
        map.set_range_high(0, 3);
        map.set_high(5);
        assert_eq!(map.find_free_run(1), Some(3));
        assert_eq!(map.find_free_run(2), Some(3));
        assert_eq!(map.find_free_run(3), Some(6));
    }

    #[test]
    fn first_fit_fails_on_fragmented_map() {
        let mut map = Map::new();
        for index in (0..128).step_by(2) {
            map.set_high(index);
        }
        assert_eq!(map.count_low(), 64);
        assert_eq!(map.find_free_run(1), Some(1));
        assert_eq!(map.find_free_run(2), None);
    }

    #[test]
    fn full_map_has_no_run() {
        let mut map = Map::new();
        map.set_range_high(0, 128);
        assert_eq!(map.count_low(), 0);
        assert_eq!(map.find_free_run(1), None);
        assert_eq!(Map::new().find_free_run(128), Some(0));
        assert_eq!(Map::new().find_free_run(129), None);
    }
}

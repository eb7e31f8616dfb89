/// Test if `addr` is aligned to a multiple of `align`
pub fn aligned_to(addr: usize, align: usize) -> bool {
    addr % align == 0
}

/// Test if `[addr, addr + len)` lies inside `[lo, hi)`
pub fn within(addr: usize, len: usize, lo: usize, hi: usize) -> bool {
    addr >= lo && addr.checked_add(len).is_some_and(|end| end <= hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_rejects_straddling_and_wrapping_ranges() {
        assert!(within(0x100, 0x10, 0x100, 0x110));
        assert!(!within(0x101, 0x10, 0x100, 0x110));
        assert!(!within(0xff, 0x1, 0x100, 0x110));
        assert!(!within(usize::MAX - 4, 16, 0, usize::MAX));
    }

    #[test]
    fn aligned_to_checks_the_low_bits() {
        assert!(aligned_to(0x1000, 8));
        assert!(!aligned_to(0x1004, 8));
    }
}

/// Round up `n` to the nearest `to`
pub fn round_up(n: usize, to: usize) -> usize {
    to * n.div_ceil(to)
}

/// How many `granule`-sized units it takes to hold `n` bytes
pub fn units_for(n: usize, granule: usize) -> usize {
    n.div_ceil(granule)
}

use bitintr::{Pdep, Tzcnt};

/// Number of set bits in `val` at or below `pos`.
pub fn bitrank(val: u64, pos: u64) -> u64 {
    if pos >= 63 {
        val.count_ones() as u64
    } else {
        (val & ((2 << pos) - 1)).count_ones() as u64
    }
}

/// Number of set bits in `val` ignoring the low `ignore` bits.
pub fn popcntv(val: u64, ignore: u64) -> u64 {
    if ignore % 64 != 0 {
        (val & !bitmask(ignore % 64)).count_ones() as u64
    } else {
        val.count_ones() as u64
    }
}

/// Position of the `rank`-th (zero based) set bit of `val`, 64 if there is none.
pub fn bitselect(val: u64, rank: u64) -> u64 {
    if rank >= 64 {
        return 64;
    }
    (1u64 << rank).pdep(val).tzcnt()
}

pub fn bitselectv(val: u64, ignore: u64, rank: u64) -> u64 {
    bitselect(val & !bitmask(ignore % 64), rank)
}

pub fn bitmask(nbits: u64) -> u64 {
    if nbits >= 64 {
        u64::MAX
    } else {
        (1 << nbits) - 1
    }
}

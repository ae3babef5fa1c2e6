//! Arbitrary-width integers at arbitrary bit offsets inside a word array.
//!
//! Fields are little endian within the array: bit `i` of the field lives at
//! absolute bit `offset + i`, and a field may straddle two adjacent words.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::utils::bitmask;

pub fn get(words: &[AtomicU64], bit_offset: u64, width: u64) -> u64 {
    if width == 0 {
        return 0;
    }
    let word = (bit_offset / 64) as usize;
    let shift = bit_offset % 64;
    let mut value = words[word].load(Ordering::Relaxed) >> shift;
    if shift + width > 64 {
        value |= words[word + 1].load(Ordering::Relaxed) << (64 - shift);
    }
    value & bitmask(width)
}

pub fn set(words: &[AtomicU64], bit_offset: u64, width: u64, value: u64) {
    if width == 0 {
        return;
    }
    let value = value & bitmask(width);
    let word = (bit_offset / 64) as usize;
    let shift = bit_offset % 64;
    let low_mask = bitmask(width) << shift;
    let current = words[word].load(Ordering::Relaxed);
    words[word].store((current & !low_mask) | (value << shift), Ordering::Relaxed);
    if shift + width > 64 {
        let written = 64 - shift;
        let high_mask = bitmask(width - written);
        let current = words[word + 1].load(Ordering::Relaxed);
        words[word + 1].store((current & !high_mask) | (value >> written), Ordering::Relaxed);
    }
}

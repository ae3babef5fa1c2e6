use crate::utils::bitmask;

/// Seeded invertible permutation of `key_bits`-wide integers.
///
/// Each step of the mix is a bijection modulo `2^key_bits`, so the whole
/// chain is, and stored hashes can be turned back into keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReversibleHasher {
    mask: u64,
    seed: u64,
}

impl ReversibleHasher {
    pub fn new(key_bits: u64, seed: u64) -> Self {
        let mask = bitmask(key_bits);
        Self {
            mask,
            seed: seed & mask,
        }
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    pub fn key_bits(&self) -> u64 {
        self.mask.count_ones() as u64
    }

    pub fn hash(&self, key: u64) -> u64 {
        let m = self.mask;
        let mut key = (key ^ self.seed) & m;
        key = (!key).wrapping_add(key << 21) & m; // key = (key << 21) - key - 1;
        key = key ^ (key >> 24);
        key = (key.wrapping_add(key << 3)).wrapping_add(key << 8) & m; // key * 265
        key = key ^ (key >> 14);
        key = (key.wrapping_add(key << 2)).wrapping_add(key << 4) & m; // key * 21
        key = key ^ (key >> 28);
        key = key.wrapping_add(key << 31) & m;
        key
    }

    pub fn invert(&self, hash: u64) -> u64 {
        let m = self.mask;
        let mut tmp: u64;
        let mut key = hash & m;

        // Invert key = key + (key << 31)
        tmp = key.wrapping_sub(key << 31);
        key = key.wrapping_sub(tmp << 31) & m;

        // Invert key = key ^ (key >> 28)
        tmp = key ^ key >> 28;
        key = key ^ tmp >> 28;

        // Invert key *= 21
        key = key.wrapping_mul(14933078535860113213) & m;

        // Invert key = key ^ (key >> 14)
        tmp = key ^ key >> 14;
        tmp = key ^ tmp >> 14;
        tmp = key ^ tmp >> 14;
        key = key ^ tmp >> 14;

        // Invert key *= 265
        key = key.wrapping_mul(15244667743933553977) & m;

        // Invert key = key ^ (key >> 24)
        tmp = key ^ key >> 24;
        key = key ^ tmp >> 24;

        // Invert key = (~key) + (key << 21)
        tmp = !key;
        tmp = !(key.wrapping_sub(tmp << 21));
        tmp = !(key.wrapping_sub(tmp << 21));
        key = !(key.wrapping_sub(tmp << 21)) & m;

        (key ^ self.seed) & m
    }
}

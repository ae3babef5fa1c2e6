use std::sync::atomic::{AtomicU64, Ordering};

use super::{bitfield, Blocks};

const OFFSET_WORD: usize = 0;
const OCCUPIEDS_WORD: usize = 1;
const RUNENDS_WORD: usize = 2;
const COUNTS_WORD: usize = 3;
pub const BLOCK_HEADER_WORDS: usize = 4;

/// View of a block array laid out as consecutive word groups:
///
/// `[offset, occupieds, runends, counts, slots...]`
///
/// where the slot area is `bits_per_slot` words holding 64 packed slots.
#[derive(Clone, Copy)]
pub struct PackedBlocks<'a> {
    words: &'a [AtomicU64],
    bits_per_slot: u64,
    num_blocks: usize,
}

impl<'a> PackedBlocks<'a> {
    pub fn new(words: &'a [AtomicU64], bits_per_slot: u64, num_blocks: usize) -> Self {
        debug_assert!(words.len() >= Self::words_needed(num_blocks, bits_per_slot));
        Self {
            words,
            bits_per_slot,
            num_blocks,
        }
    }

    pub fn words_per_block(bits_per_slot: u64) -> usize {
        BLOCK_HEADER_WORDS + bits_per_slot as usize
    }

    pub fn words_needed(num_blocks: usize, bits_per_slot: u64) -> usize {
        num_blocks * Self::words_per_block(bits_per_slot)
    }

    fn header(&self, block: usize, word: usize) -> &AtomicU64 {
        &self.words[block * Self::words_per_block(self.bits_per_slot) + word]
    }

    fn slot_words(&self, block: usize) -> &[AtomicU64] {
        let start = block * Self::words_per_block(self.bits_per_slot) + BLOCK_HEADER_WORDS;
        &self.words[start..start + self.bits_per_slot as usize]
    }

    fn update_bit(&self, word: &AtomicU64, slot: usize, bit: bool) {
        if bit {
            word.fetch_or(1 << slot, Ordering::Relaxed);
        } else {
            word.fetch_and(!(1 << slot), Ordering::Relaxed);
        }
    }

    /// Copies slot value, runend and count bits from one position to another.
    /// The occupied bitmap belongs to quotients, not slots, and is untouched.
    pub fn move_slot(&self, from: u64, to: u64) {
        self.set_slot(to, self.slot(from));
        self.set_runend(to, self.is_runend(from));
        self.set_count(to, self.is_count(from));
    }

    /// Marks a slot as vacated.
    pub fn clear_slot(&self, position: u64) {
        self.set_slot(position, 0);
        self.set_runend(position, false);
        self.set_count(position, false);
    }

    pub fn clear(&self) {
        let len = Self::words_needed(self.num_blocks, self.bits_per_slot);
        for word in &self.words[..len] {
            word.store(0, Ordering::Relaxed);
        }
    }
}

impl Blocks for PackedBlocks<'_> {
    fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    fn offset_by_block(&self, block: usize) -> u64 {
        self.header(block, OFFSET_WORD).load(Ordering::Relaxed)
    }

    fn set_offset_by_block(&self, block: usize, offset: u64) {
        self.header(block, OFFSET_WORD).store(offset, Ordering::Relaxed)
    }

    fn occupieds_by_block(&self, block: usize) -> u64 {
        self.header(block, OCCUPIEDS_WORD).load(Ordering::Relaxed)
    }

    fn runends_by_block(&self, block: usize) -> u64 {
        self.header(block, RUNENDS_WORD).load(Ordering::Relaxed)
    }

    fn counts_by_block(&self, block: usize) -> u64 {
        self.header(block, COUNTS_WORD).load(Ordering::Relaxed)
    }

    fn set_occupied_by_block(&self, block: usize, slot: usize, bit: bool) {
        self.update_bit(self.header(block, OCCUPIEDS_WORD), slot, bit)
    }

    fn set_runend_by_block(&self, block: usize, slot: usize, bit: bool) {
        self.update_bit(self.header(block, RUNENDS_WORD), slot, bit)
    }

    fn set_count_by_block(&self, block: usize, slot: usize, bit: bool) {
        self.update_bit(self.header(block, COUNTS_WORD), slot, bit)
    }

    fn slot(&self, position: u64) -> u64 {
        let (block, slot) = Self::split_quotient(position);
        bitfield::get(
            self.slot_words(block),
            slot as u64 * self.bits_per_slot,
            self.bits_per_slot,
        )
    }

    fn set_slot(&self, position: u64, value: u64) {
        let (block, slot) = Self::split_quotient(position);
        bitfield::set(
            self.slot_words(block),
            slot as u64 * self.bits_per_slot,
            self.bits_per_slot,
            value,
        )
    }
}

impl std::fmt::Debug for PackedBlocks<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for block in 0..self.num_blocks {
            writeln!(
                f,
                "block {block}: offset {} occ {:064b} run {:064b} cnt {:064b}",
                self.offset_by_block(block),
                self.occupieds_by_block(block).reverse_bits(),
                self.runends_by_block(block).reverse_bits(),
                self.counts_by_block(block).reverse_bits(),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(num_blocks: usize, bits_per_slot: u64) -> Vec<AtomicU64> {
        (0..PackedBlocks::words_needed(num_blocks, bits_per_slot))
            .map(|_| AtomicU64::new(0))
            .collect()
    }

    /// Lays out runs given as `(quotient, length)` with each run starting at
    /// `max(quotient, end of previous run + 1)`, then fixes offsets.
    fn layout(blocks: &PackedBlocks, runs: &[(u64, u64)]) {
        let mut next_free = 0;
        for &(quotient, len) in runs {
            let start = quotient.max(next_free);
            blocks.set_occupied(quotient, true);
            for position in start..start + len {
                blocks.set_slot(position, quotient);
            }
            blocks.set_runend(start + len - 1, true);
            next_free = start + len;
        }
        blocks.rebuild_offsets(1, blocks.num_blocks() - 1);
    }

    #[test]
    fn slots_round_trip_at_odd_widths() {
        let words = storage(2, 13);
        let blocks = PackedBlocks::new(&words, 13, 2);
        for position in 0..128 {
            blocks.set_slot(position, position * 37 % 8191);
        }
        for position in 0..128 {
            assert_eq!(blocks.slot(position), position * 37 % 8191);
        }
    }

    #[test]
    fn run_end_on_empty_blocks_is_identity() {
        let words = storage(2, 8);
        let blocks = PackedBlocks::new(&words, 8, 2);
        for q in 0..128 {
            assert_eq!(blocks.run_end(q), q);
            assert!(blocks.is_empty_slot(q));
        }
        assert_eq!(blocks.find_first_empty_slot(5, 128), Some(5));
        assert_eq!(blocks.next_occupied(0, 128), None);
    }

    #[test]
    fn runs_shifted_across_a_block_boundary() {
        let words = storage(3, 8);
        let blocks = PackedBlocks::new(&words, 8, 3);
        // cluster starting at 60 spills four slots into block 1
        layout(&blocks, &[(3, 2), (60, 3), (61, 5), (70, 1)]);
        assert_eq!(blocks.offset_by_block(1), 4);
        assert_eq!(blocks.offset_by_block(2), 0);

        assert_eq!(blocks.run_end(3), 4);
        assert_eq!(blocks.run_start(3), 3);
        assert_eq!(blocks.run_end(60), 62);
        assert_eq!(blocks.run_start(61), 63);
        assert_eq!(blocks.run_end(61), 67);
        assert_eq!(blocks.run_end(64), 67);
        assert_eq!(blocks.run_start(70), 70);
        assert_eq!(blocks.run_end(70), 70);
        assert_eq!(blocks.run_end(68), 68);

        assert!(!blocks.is_empty_slot(66));
        assert!(blocks.is_empty_slot(68));
        assert!(blocks.is_empty_slot(5));
        assert_eq!(blocks.find_first_empty_slot(60, 192), Some(68));
        assert_eq!(blocks.find_first_empty_slot(70, 192), Some(71));
        assert_eq!(blocks.find_first_empty_slot(3, 4), None);

        assert_eq!(blocks.next_occupied(0, 192), Some(3));
        assert_eq!(blocks.next_occupied(4, 192), Some(60));
        assert_eq!(blocks.next_occupied(62, 192), Some(70));
        assert_eq!(blocks.next_occupied(71, 192), None);
        assert_eq!(blocks.next_occupied(4, 60), None);
    }

    #[test]
    fn offsets_spanning_whole_blocks() {
        let words = storage(4, 4);
        let blocks = PackedBlocks::new(&words, 4, 4);
        layout(&blocks, &[(10, 150)]);
        assert_eq!(blocks.offset_by_block(1), 96);
        assert_eq!(blocks.offset_by_block(2), 32);
        assert_eq!(blocks.offset_by_block(3), 0);
        assert_eq!(blocks.run_end(10), 159);
        assert_eq!(blocks.run_end(100), 159);
        assert_eq!(blocks.find_first_empty_slot(11, 256), Some(160));
    }
}

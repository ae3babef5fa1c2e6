use crate::{
    utils::{bitmask, bitrank, bitselect, bitselectv, popcntv},
    SLOTS_PER_BLOCK,
};

pub mod bitfield;
pub mod packed_blocks;

pub use packed_blocks::PackedBlocks;

/// Block metadata plus slot access.
///
/// Implementors provide the raw per-block words; the rank/select algorithms
/// that locate runs and free slots are default methods on top of them.
/// Setters take `&self`: the words are atomics and writers are serialized by
/// the region locks of the filter that owns them.
pub trait Blocks {
    fn num_blocks(&self) -> usize;

    fn offset_by_block(&self, block: usize) -> u64;
    fn set_offset_by_block(&self, block: usize, offset: u64);

    fn occupieds_by_block(&self, block: usize) -> u64;
    fn runends_by_block(&self, block: usize) -> u64;
    fn counts_by_block(&self, block: usize) -> u64;

    fn set_occupied_by_block(&self, block: usize, slot: usize, bit: bool);
    fn set_runend_by_block(&self, block: usize, slot: usize, bit: bool);
    fn set_count_by_block(&self, block: usize, slot: usize, bit: bool);

    fn slot(&self, position: u64) -> u64;
    fn set_slot(&self, position: u64, value: u64);

    fn num_slots(&self) -> u64 {
        (self.num_blocks() * SLOTS_PER_BLOCK) as u64
    }

    fn split_quotient(quotient: u64) -> (usize, usize)
    where
        Self: Sized,
    {
        let block_index = (quotient / SLOTS_PER_BLOCK as u64) as usize;
        let slot_index = (quotient % SLOTS_PER_BLOCK as u64) as usize;
        (block_index, slot_index)
    }

    fn is_occupied(&self, position: u64) -> bool
    where
        Self: Sized,
    {
        let (block, slot) = Self::split_quotient(position);
        self.occupieds_by_block(block) & (1 << slot) != 0
    }

    fn is_runend(&self, position: u64) -> bool
    where
        Self: Sized,
    {
        let (block, slot) = Self::split_quotient(position);
        self.runends_by_block(block) & (1 << slot) != 0
    }

    fn is_count(&self, position: u64) -> bool
    where
        Self: Sized,
    {
        let (block, slot) = Self::split_quotient(position);
        self.counts_by_block(block) & (1 << slot) != 0
    }

    fn set_occupied(&self, position: u64, bit: bool)
    where
        Self: Sized,
    {
        let (block, slot) = Self::split_quotient(position);
        self.set_occupied_by_block(block, slot, bit)
    }

    fn set_runend(&self, position: u64, bit: bool)
    where
        Self: Sized,
    {
        let (block, slot) = Self::split_quotient(position);
        self.set_runend_by_block(block, slot, bit)
    }

    fn set_count(&self, position: u64, bit: bool)
    where
        Self: Sized,
    {
        let (block, slot) = Self::split_quotient(position);
        self.set_count_by_block(block, slot, bit)
    }

    /// End of the last run whose quotient is `<= quotient`, or `quotient`
    /// itself when no such run reaches that far.
    fn run_end(&self, quotient: u64) -> u64
    where
        Self: Sized,
    {
        let (block_index, slot_index) = Self::split_quotient(quotient);
        let block_offset = self.offset_by_block(block_index);
        let intrablock_rank = bitrank(self.occupieds_by_block(block_index), slot_index as u64);

        if intrablock_rank == 0 {
            if block_offset <= slot_index as u64 {
                return quotient;
            } else {
                return (SLOTS_PER_BLOCK * block_index) as u64 + block_offset - 1;
            }
        }

        let mut runend_block_index = block_index + (block_offset / SLOTS_PER_BLOCK as u64) as usize;
        let mut runend_ignore_bits = block_offset % SLOTS_PER_BLOCK as u64;
        let mut runend_rank = intrablock_rank - 1;
        if runend_block_index >= self.num_blocks() {
            return self.num_slots() - 1;
        }
        let mut runend_block_offset = bitselectv(
            self.runends_by_block(runend_block_index),
            runend_ignore_bits,
            runend_rank,
        );

        while runend_block_offset == SLOTS_PER_BLOCK as u64 {
            runend_rank -= popcntv(self.runends_by_block(runend_block_index), runend_ignore_bits);
            runend_block_index += 1;
            runend_ignore_bits = 0;
            if runend_block_index >= self.num_blocks() {
                return self.num_slots() - 1;
            }
            runend_block_offset = bitselect(self.runends_by_block(runend_block_index), runend_rank);
        }

        let runend_index = (SLOTS_PER_BLOCK * runend_block_index) as u64 + runend_block_offset;
        runend_index.max(quotient)
    }

    /// First slot a run homed at `quotient` occupies, or would occupy.
    fn run_start(&self, quotient: u64) -> u64
    where
        Self: Sized,
    {
        if quotient == 0 {
            0
        } else {
            (self.run_end(quotient - 1) + 1).max(quotient)
        }
    }

    #[cfg(test)]
    fn is_empty_slot(&self, position: u64) -> bool
    where
        Self: Sized,
    {
        self.run_end(position) == position && !self.is_runend(position)
    }

    /// First empty slot at or after `from` and strictly below `limit`.
    fn find_first_empty_slot(&self, mut from: u64, limit: u64) -> Option<u64>
    where
        Self: Sized,
    {
        while from < limit {
            let end = self.run_end(from);
            if end == from && !self.is_runend(from) {
                return Some(from);
            }
            from = end.max(from) + 1;
        }
        None
    }

    /// Smallest occupied quotient in `[from, limit)`.
    fn next_occupied(&self, from: u64, limit: u64) -> Option<u64>
    where
        Self: Sized,
    {
        if from >= limit {
            return None;
        }
        let (mut block_index, slot_index) = Self::split_quotient(from);
        let mut bits = self.occupieds_by_block(block_index) & !bitmask(slot_index as u64);
        loop {
            if bits != 0 {
                let quotient = (block_index * SLOTS_PER_BLOCK) as u64 + bits.trailing_zeros() as u64;
                return (quotient < limit).then_some(quotient);
            }
            block_index += 1;
            if block_index >= self.num_blocks() || (block_index * SLOTS_PER_BLOCK) as u64 >= limit {
                return None;
            }
            bits = self.occupieds_by_block(block_index);
        }
    }

    /// Offset a block should carry given the bitmaps of every earlier block
    /// and the offset of its predecessor.
    fn block_offset(&self, block: usize) -> u64
    where
        Self: Sized,
    {
        if block == 0 {
            return 0;
        }
        let start = (block * SLOTS_PER_BLOCK) as u64;
        self.run_end(start - 1) + 1 - start
    }

    /// Recomputes the stored offsets of blocks `first..=last`, in order.
    fn rebuild_offsets(&self, first: usize, last: usize)
    where
        Self: Sized,
    {
        let last = last.min(self.num_blocks().saturating_sub(1));
        for block in first.max(1)..=last {
            self.set_offset_by_block(block, self.block_offset(block));
        }
    }
}

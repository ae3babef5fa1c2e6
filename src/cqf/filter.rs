//! Insert, query and removal on a single filter.
//!
//! A record is one remainder with its tag and count. The first slot holds
//! `remainder | tag | fixed counter`; counts that do not fit the fixed
//! counter continue in the following slots as base `2^bits_per_slot` digits,
//! each marked in the `counts` bitmap.

use std::sync::atomic::Ordering;

use super::Cqf;
use crate::blocks::{Blocks, PackedBlocks};
use crate::error::{CqfError, Result};
use crate::locks::LockMode;
use crate::utils::bitmask;
use crate::SLOTS_PER_BLOCK;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Decoded {
    pub remainder: u64,
    pub tag: u64,
    pub count: u64,
    /// Slots the record spans.
    pub len: u64,
}

enum Probe {
    Found {
        position: u64,
        run_start: u64,
        record: Decoded,
    },
    Vacant {
        position: u64,
        kind: Vacancy,
    },
}

#[derive(Clone, Copy)]
enum Vacancy {
    /// The quotient has no run yet.
    NewRun,
    /// Before an existing record of the run.
    Inside,
    /// After the last record of the run.
    Tail,
}

impl Cqf {
    fn slot_value(&self, remainder: u64, tag: u64, fixed: u64) -> u64 {
        let g = &self.geometry;
        (remainder << (g.tag_bits + g.fixed_counter_bits)) | (tag << g.fixed_counter_bits) | fixed
    }

    pub(crate) fn decode(&self, blocks: &PackedBlocks, position: u64) -> Decoded {
        let g = &self.geometry;
        let slot = blocks.slot(position);
        let fixed = slot & bitmask(g.fixed_counter_bits);
        let tag = (slot >> g.fixed_counter_bits) & bitmask(g.tag_bits);
        let remainder = slot >> (g.tag_bits + g.fixed_counter_bits);

        let limit = blocks.num_slots();
        let mut len = 1;
        let mut extension = 0u64;
        let mut shift = 0u64;
        while !blocks.is_runend(position + len - 1)
            && position + len < limit
            && blocks.is_count(position + len)
        {
            if shift < 64 {
                extension |= blocks.slot(position + len) << shift;
            }
            shift += g.bits_per_slot;
            len += 1;
        }
        Decoded {
            remainder,
            tag,
            count: fixed.saturating_add(extension).saturating_add(1),
            len,
        }
    }

    pub(crate) fn encode(&self, remainder: u64, tag: u64, count: u64) -> Vec<u64> {
        debug_assert!(count > 0);
        let g = &self.geometry;
        let value = count - 1;
        let inline = bitmask(g.fixed_counter_bits);
        if value <= inline {
            return vec![self.slot_value(remainder, tag, value)];
        }
        let mut slots = vec![self.slot_value(remainder, tag, inline)];
        let mut extension = value - inline;
        while extension > 0 {
            slots.push(extension & bitmask(g.bits_per_slot));
            extension = extension.checked_shr(g.bits_per_slot as u32).unwrap_or(0);
        }
        slots
    }

    /// Most slots one record can take.
    fn max_record_len(&self) -> u64 {
        1 + 64u64.div_ceil(self.geometry.bits_per_slot)
    }

    fn probe(&self, blocks: &PackedBlocks, quotient: u64, remainder: u64) -> Probe {
        let run_start = blocks.run_start(quotient);
        if !blocks.is_occupied(quotient) {
            return Probe::Vacant {
                position: run_start,
                kind: Vacancy::NewRun,
            };
        }
        let limit = blocks.num_slots();
        let mut position = run_start;
        while position < limit {
            let record = self.decode(blocks, position);
            if record.remainder == remainder {
                return Probe::Found {
                    position,
                    run_start,
                    record,
                };
            }
            if record.remainder > remainder {
                return Probe::Vacant {
                    position,
                    kind: Vacancy::Inside,
                };
            }
            let end = position + record.len - 1;
            if blocks.is_runend(end) {
                return Probe::Vacant {
                    position: end + 1,
                    kind: Vacancy::Tail,
                };
            }
            position = end + 1;
        }
        Probe::Vacant {
            position: limit,
            kind: Vacancy::Tail,
        }
    }

    /// Claims `needed` slots against the occupancy ceiling. Concurrent
    /// writers in other lock regions see the claim before any slot moves.
    fn reserve_slots(&self, needed: u64) -> Result<()> {
        let ceiling = self.geometry.maximum_occupied_slots;
        self.counters
            .nused_slots
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                (used + needed <= ceiling).then_some(used + needed)
            })
            .map(|_| ())
            .map_err(|used| CqfError::CapacityExhausted {
                needed,
                available: ceiling.saturating_sub(used),
            })
    }

    fn release_slots(&self, k: u64) {
        self.counters.nused_slots.fetch_sub(k, Ordering::Relaxed);
    }

    /// Reserves `k` slots, then opens them at `position`.
    fn claim_room(&self, blocks: &PackedBlocks, position: u64, k: u64) -> Result<u64> {
        self.reserve_slots(k)?;
        self.make_room(blocks, position, k).inspect_err(|_| self.release_slots(k))
    }

    /// Opens `k` slots at `position` by shifting everything up to the `k`-th
    /// empty slot at or after it to the right. Returns the last slot written.
    fn make_room(&self, blocks: &PackedBlocks, position: u64, k: u64) -> Result<u64> {
        let limit = self.geometry.xnslots;
        let mut empties = Vec::with_capacity(k as usize);
        let mut from = position;
        for _ in 0..k {
            match blocks.find_first_empty_slot(from, limit) {
                Some(empty) => {
                    empties.push(empty);
                    from = empty + 1;
                }
                None => {
                    return Err(CqfError::CapacityExhausted {
                        needed: k,
                        available: empties.len() as u64,
                    })
                }
            }
        }
        for j in (0..empties.len()).rev() {
            let start = if j == 0 { position } else { empties[j - 1] + 1 };
            let distance = k - j as u64;
            for i in (start..empties[j]).rev() {
                blocks.move_slot(i, i + distance);
            }
        }
        Ok(empties.last().copied().unwrap_or(position))
    }

    /// Closes the `k` slot gap at `gap`, sliding the rest of the cluster left.
    /// `tail_continues` means the slots right after the gap still belong to
    /// the run of `quotient`. Returns the last slot touched.
    fn close_gap(
        &self,
        blocks: &PackedBlocks,
        quotient: u64,
        gap: u64,
        k: u64,
        tail_continues: bool,
    ) -> u64 {
        let mut write = gap;
        let mut read = gap + k;
        if tail_continues {
            loop {
                let end = blocks.is_runend(read);
                blocks.move_slot(read, write);
                read += 1;
                write += 1;
                if end {
                    break;
                }
            }
        }
        let mut current = quotient;
        while let Some(next) = blocks.next_occupied(current + 1, self.geometry.nslots) {
            let old_start = next.max(read);
            let new_start = next.max(write);
            if new_start == old_start {
                break;
            }
            for position in write..new_start {
                blocks.clear_slot(position);
            }
            let (mut r, mut w) = (old_start, new_start);
            loop {
                let end = blocks.is_runend(r);
                blocks.move_slot(r, w);
                r += 1;
                w += 1;
                if end {
                    break;
                }
            }
            read = r;
            write = w;
            current = next;
        }
        for position in write..read {
            blocks.clear_slot(position);
        }
        read.saturating_sub(1).max(gap)
    }

    fn write_slots(&self, blocks: &PackedBlocks, position: u64, slots: &[u64], ends_run: bool) {
        for (i, &value) in slots.iter().enumerate() {
            let p = position + i as u64;
            blocks.set_slot(p, value);
            blocks.set_count(p, i > 0);
            blocks.set_runend(p, false);
        }
        if ends_run {
            blocks.set_runend(position + slots.len() as u64 - 1, true);
        }
    }

    fn fix_offsets(&self, blocks: &PackedBlocks, quotient: u64, last: u64) {
        let first = (quotient / SLOTS_PER_BLOCK as u64) as usize + 1;
        let last = (last / SLOTS_PER_BLOCK as u64) as usize + 1;
        blocks.rebuild_offsets(first, last);
    }

    fn insert_record(
        &self,
        blocks: &PackedBlocks,
        quotient: u64,
        position: u64,
        kind: Vacancy,
        slots: &[u64],
    ) -> Result<()> {
        let k = slots.len() as u64;
        let last = self.claim_room(blocks, position, k)?;
        match kind {
            Vacancy::NewRun => {
                blocks.set_occupied(quotient, true);
                self.counters.noccupied_slots.fetch_add(1, Ordering::Relaxed);
            }
            Vacancy::Tail => blocks.set_runend(position - 1, false),
            Vacancy::Inside => {}
        }
        self.write_slots(blocks, position, slots, !matches!(kind, Vacancy::Inside));
        self.fix_offsets(blocks, quotient, last);
        self.counters.ndistinct_elts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn replace_record(
        &self,
        blocks: &PackedBlocks,
        quotient: u64,
        position: u64,
        old_len: u64,
        slots: &[u64],
    ) -> Result<()> {
        let new_len = slots.len() as u64;
        let ends_run = blocks.is_runend(position + old_len - 1);
        let mut last = position + new_len.max(old_len) - 1;
        if new_len > old_len {
            let k = new_len - old_len;
            last = self.claim_room(blocks, position + old_len, k)?;
        }
        blocks.set_runend(position + old_len - 1, false);
        self.write_slots(blocks, position, slots, ends_run);
        if new_len < old_len {
            let k = old_len - new_len;
            last = last.max(self.close_gap(blocks, quotient, position + new_len, k, !ends_run));
            self.release_slots(k);
        }
        if new_len != old_len {
            self.fix_offsets(blocks, quotient, last);
        }
        Ok(())
    }

    fn erase_record(
        &self,
        blocks: &PackedBlocks,
        quotient: u64,
        position: u64,
        run_start: u64,
        len: u64,
    ) {
        let ends_run = blocks.is_runend(position + len - 1);
        if ends_run {
            blocks.set_runend(position + len - 1, false);
            if position == run_start {
                blocks.set_occupied(quotient, false);
                self.counters.noccupied_slots.fetch_sub(1, Ordering::Relaxed);
            } else {
                blocks.set_runend(position - 1, true);
            }
        }
        let last = self.close_gap(blocks, quotient, position, len, !ends_run);
        self.fix_offsets(blocks, quotient, last);
        self.release_slots(len);
        self.counters.ndistinct_elts.fetch_sub(1, Ordering::Relaxed);
    }

    /// Applies `update` to the `(count, tag)` stored for a hash. `None` or a
    /// zero count erases the record. Returns the previous `(count, tag)`.
    fn apply<F>(&self, blocks: &PackedBlocks, hash: u64, update: F) -> Result<Option<(u64, u64)>>
    where
        F: FnOnce(Option<(u64, u64)>) -> Option<(u64, u64)>,
    {
        let (quotient, remainder) = self.split_hash(hash);
        match self.probe(blocks, quotient, remainder) {
            Probe::Found {
                position,
                run_start,
                record,
            } => {
                let old = (record.count, record.tag);
                match update(Some(old)) {
                    Some((count, tag)) if count > 0 => {
                        if (count, tag) != old {
                            let slots = self.encode(remainder, tag, count);
                            self.replace_record(blocks, quotient, position, record.len, &slots)?;
                            self.adjust_nelts(record.count, count);
                        }
                    }
                    _ => {
                        self.erase_record(blocks, quotient, position, run_start, record.len);
                        self.adjust_nelts(record.count, 0);
                    }
                }
                Ok(Some(old))
            }
            Probe::Vacant { position, kind } => {
                if let Some((count, tag)) = update(None) {
                    if count > 0 {
                        let slots = self.encode(remainder, tag, count);
                        self.insert_record(blocks, quotient, position, kind, &slots)?;
                        self.adjust_nelts(0, count);
                    }
                }
                Ok(None)
            }
        }
    }

    /// Total multiplicity saturates at `u64::MAX`, like each record's count.
    fn adjust_nelts(&self, old: u64, new: u64) {
        let _ = self
            .counters
            .nelts
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |nelts| {
                Some(if new >= old {
                    nelts.saturating_add(new - old)
                } else {
                    nelts.saturating_sub(old - new)
                })
            });
    }

    /// Last slot a write homed at `quotient` could touch, under the current
    /// layout.
    fn write_reach(&self, blocks: &PackedBlocks, quotient: u64) -> u64 {
        let mut from = blocks.run_start(quotient);
        let mut reach = from;
        for _ in 0..self.max_record_len() {
            match blocks.find_first_empty_slot(from, self.geometry.xnslots) {
                Some(empty) => {
                    reach = empty;
                    from = empty + 1;
                }
                None => return blocks.num_slots() - 1,
            }
        }
        reach
    }

    /// Runs `op` holding every region lock a write homed at `quotient` needs.
    fn locked<T>(
        &self,
        quotient: u64,
        mode: LockMode,
        op: impl FnOnce(&PackedBlocks) -> Result<T>,
    ) -> Result<T> {
        let blocks = self.blocks();
        if !mode.lock {
            return op(&blocks);
        }
        let margin = SLOTS_PER_BLOCK as u64;
        let first = self.locks.region_of(quotient.saturating_sub(margin));
        let mut guard = self
            .locks
            .lock_range(first, self.locks.region_of(quotient + margin), mode.spin)?;
        loop {
            let needed = self.locks.region_of(self.write_reach(&blocks, quotient) + margin);
            if guard.last().is_some_and(|held| held >= needed) {
                break;
            }
            guard.extend_to(needed)?;
        }
        let result = op(&blocks);
        drop(guard);
        result
    }

    fn update_hash<F>(&self, hash: u64, mode: LockMode, update: F) -> Result<Option<(u64, u64)>>
    where
        F: FnOnce(Option<(u64, u64)>) -> Option<(u64, u64)>,
    {
        let hash = hash & bitmask(self.geometry.key_bits);
        let (quotient, _) = self.split_hash(hash);
        self.locked(quotient, mode, |blocks| self.apply(blocks, hash, update))
    }

    /// Adds `count` occurrences of `key`. A zero count is a no-op.
    pub fn insert(&self, key: u64, count: u64, mode: LockMode) -> Result<()> {
        self.insert_by_hash(self.hasher.hash(key), count, mode)
    }

    pub fn insert_by_hash(&self, hash: u64, count: u64, mode: LockMode) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let cap = self.maximum_count();
        self.update_hash(hash, mode, |old| {
            let (current, tag) = old.unwrap_or((0, 0));
            let count = current.saturating_add(count).min(cap).max(current);
            Some((count, tag))
        })?;
        Ok(())
    }

    /// Removes up to `count` occurrences of `key`; the record goes once its
    /// count reaches zero. Returns whether the key was present.
    pub fn remove(&self, key: u64, count: u64, mode: LockMode) -> Result<bool> {
        self.remove_by_hash(self.hasher.hash(key), count, mode)
    }

    pub fn remove_by_hash(&self, hash: u64, count: u64, mode: LockMode) -> Result<bool> {
        if count == 0 {
            return Ok(self.query_by_hash(hash) > 0);
        }
        let previous = self.update_hash(hash, mode, |old| {
            old.map(|(current, tag)| (current.saturating_sub(count), tag))
        })?;
        Ok(previous.is_some())
    }

    /// Removes every occurrence of `key`.
    pub fn delete_key(&self, key: u64, mode: LockMode) -> Result<bool> {
        let previous = self.update_hash(self.hasher.hash(key), mode, |_| None)?;
        Ok(previous.is_some())
    }

    /// Overwrites the count of `key`, inserting or erasing as needed.
    pub fn set_count(&self, key: u64, count: u64, mode: LockMode) -> Result<()> {
        self.set_count_by_hash(self.hasher.hash(key), count, mode)
    }

    pub fn set_count_by_hash(&self, hash: u64, count: u64, mode: LockMode) -> Result<()> {
        let count = count.min(self.maximum_count());
        self.update_hash(hash, mode, |old| {
            Some((count, old.map_or(0, |(_, tag)| tag)))
        })?;
        Ok(())
    }

    /// Sets the tag of a present key. Returns false when the key is absent.
    pub fn set_tag(&self, key: u64, tag: u64, mode: LockMode) -> Result<bool> {
        let g = &self.geometry;
        if tag > bitmask(g.tag_bits) {
            return Err(CqfError::InvalidArguments(format!(
                "tag {tag} does not fit in {} bits",
                g.tag_bits
            )));
        }
        let previous = self.update_hash(self.hasher.hash(key), mode, |old| {
            old.map(|(count, _)| (count, tag))
        })?;
        Ok(previous.is_some())
    }

    pub fn remove_tag(&self, key: u64, mode: LockMode) -> Result<bool> {
        self.set_tag(key, 0, mode)
    }

    /// Tag of `key`, if present.
    pub fn tag(&self, key: u64) -> Option<u64> {
        self.lookup(self.hasher.hash(key)).map(|record| record.tag)
    }

    pub fn query(&self, key: u64) -> u64 {
        self.query_by_hash(self.hasher.hash(key))
    }

    /// Same as [`Cqf::query`]: a remainder match is all a filter can check.
    pub fn count_key(&self, key: u64) -> u64 {
        self.query(key)
    }

    pub fn query_by_hash(&self, hash: u64) -> u64 {
        self.lookup(hash).map_or(0, |record| record.count)
    }

    pub(crate) fn lookup(&self, hash: u64) -> Option<Decoded> {
        let (quotient, remainder) = self.split_hash(hash & bitmask(self.geometry.key_bits));
        let blocks = self.blocks();
        if quotient >= self.geometry.nslots || !blocks.is_occupied(quotient) {
            return None;
        }
        match self.probe(&blocks, quotient, remainder) {
            Probe::Found { record, .. } => Some(record),
            Probe::Vacant { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cqf::CqfParams;

    fn filter(nslots: u64, key_bits: u64, counter_bits: u64) -> Cqf {
        Cqf::new(CqfParams::new(nslots, key_bits).with_fixed_counter_bits(counter_bits)).unwrap()
    }

    /// Walks the block array and checks the structural invariants.
    fn check_invariants(cqf: &Cqf) {
        let blocks = cqf.blocks();
        let mut quotient = blocks.next_occupied(0, cqf.geometry.nslots);
        let mut expected_end = None;
        let mut used = 0;
        let mut runs = 0;
        let mut distinct = 0;
        while let Some(q) = quotient {
            let start = blocks.run_start(q);
            if let Some(prev_end) = expected_end {
                assert_eq!(start, q.max(prev_end + 1), "run {q} starts at {start}");
            }
            let mut position = start;
            let mut last_remainder = None;
            loop {
                let record = cqf.decode(&blocks, position);
                assert!(!blocks.is_count(position));
                if let Some(prev) = last_remainder {
                    assert!(record.remainder > prev, "run {q} out of order");
                }
                last_remainder = Some(record.remainder);
                used += record.len;
                distinct += 1;
                position += record.len;
                if blocks.is_runend(position - 1) {
                    break;
                }
            }
            assert_eq!(blocks.run_end(q), position - 1);
            expected_end = Some(position - 1);
            runs += 1;
            quotient = blocks.next_occupied(q + 1, cqf.geometry.nslots);
        }
        for block in 0..blocks.num_blocks() {
            assert_eq!(blocks.offset_by_block(block), blocks.block_offset(block));
        }
        assert_eq!(used, cqf.nused_slots());
        assert_eq!(runs, cqf.noccupied_slots());
        assert_eq!(distinct, cqf.ndistinct_elts());
        let occupied: u64 = (0..blocks.num_blocks())
            .map(|b| blocks.occupieds_by_block(b).count_ones() as u64)
            .sum();
        assert_eq!(occupied, cqf.noccupied_slots());
    }

    #[test]
    fn counter_encoding_lengths() {
        let cqf = filter(64, 16, 2);
        assert_eq!(cqf.encode(1, 0, 1).len(), 1);
        assert_eq!(cqf.encode(1, 0, 4).len(), 1);
        assert_eq!(cqf.encode(1, 0, 5).len(), 2);
        // 10 remainder + 2 counter bits: 3 + 4095 fits two slots
        assert_eq!(cqf.encode(1, 0, 4 + 4095).len(), 2);
        assert_eq!(cqf.encode(1, 0, 4 + 4096).len(), 3);
        assert_eq!(cqf.encode(1, 0, u64::MAX).len() as u64, cqf.max_record_len());
    }

    #[test]
    fn sequential_increments() {
        let cqf = filter(64, 13, 2);
        for i in 1..=11 {
            cqf.insert(100, 1, LockMode::NONE).unwrap();
            assert_eq!(cqf.count_key(100), i);
        }
        cqf.insert(1500, 50, LockMode::NONE).unwrap();
        assert_eq!(cqf.count_key(1500), 50);
        assert_eq!(cqf.count_key(100), 11);
        assert_eq!(cqf.nelts(), 61);
        assert_eq!(cqf.ndistinct_elts(), 2);
        check_invariants(&cqf);
    }

    #[test]
    fn big_counts_with_narrow_counters() {
        let cqf = filter(64, 14, 4);
        cqf.insert(7, 100_000, LockMode::NONE).unwrap();
        assert_eq!(cqf.query(7), 100_000);
        cqf.insert(7, 1, LockMode::NONE).unwrap();
        assert_eq!(cqf.query(7), 100_001);
        cqf.insert(8, u64::MAX, LockMode::NONE).unwrap();
        assert_eq!(cqf.query(8), u64::MAX);
        assert_eq!(cqf.query(7), 100_001);
        check_invariants(&cqf);
    }

    #[test]
    fn saturating_cap() {
        let cqf = Cqf::new(CqfParams::new(64, 16).with_maximum_count(Some(10))).unwrap();
        cqf.insert(1, 100_000, LockMode::NONE).unwrap();
        assert_eq!(cqf.query(1), 10);
        cqf.insert(2, 8, LockMode::NONE).unwrap();
        cqf.insert(2, 8, LockMode::NONE).unwrap();
        assert_eq!(cqf.query(2), 10);
        cqf.set_maximum_count(None);
        cqf.insert(2, 8, LockMode::NONE).unwrap();
        assert_eq!(cqf.query(2), 18);
    }

    #[test]
    fn zero_count_insert_is_noop() {
        let cqf = filter(64, 16, 0);
        cqf.insert(5, 0, LockMode::NONE).unwrap();
        assert!(cqf.is_empty());
        assert_eq!(cqf.query(5), 0);
    }

    #[test]
    fn colliding_quotients_share_clusters() {
        let cqf = filter(64, 16, 0);
        // With 10 remainder bits the hashes `q << 10 | r` land in chosen runs.
        let hashes: Vec<u64> = [(3, 9), (3, 1), (4, 5), (3, 4), (5, 0), (4, 2), (63, 7), (63, 3)]
            .iter()
            .map(|&(q, r)| cqf.join_hash(q, r))
            .collect();
        for (i, &hash) in hashes.iter().enumerate() {
            cqf.insert_by_hash(hash, i as u64 + 1, LockMode::NONE).unwrap();
            check_invariants(&cqf);
        }
        for (i, &hash) in hashes.iter().enumerate() {
            assert_eq!(cqf.query_by_hash(hash), i as u64 + 1);
        }
        assert_eq!(cqf.query_by_hash(cqf.join_hash(3, 2)), 0);
        assert_eq!(cqf.query_by_hash(cqf.join_hash(6, 0)), 0);
        // run 63 holds two 2-slot records and spills three slots into block 1
        assert_eq!(cqf.blocks().offset_by_block(1), 3);
    }

    #[test]
    fn removal_closes_gaps() {
        let cqf = filter(64, 16, 0);
        let keys: Vec<(u64, u64)> = [(3, 9), (3, 1), (4, 5), (3, 4), (5, 0), (4, 2), (6, 6)]
            .iter()
            .map(|&(q, r)| (cqf.join_hash(q, r), q + r))
            .collect();
        for &(hash, count) in &keys {
            cqf.insert_by_hash(hash, count, LockMode::NONE).unwrap();
        }
        for (i, &(hash, count)) in keys.iter().enumerate() {
            assert!(cqf.remove_by_hash(hash, 1, LockMode::NONE).unwrap());
            assert_eq!(cqf.query_by_hash(hash), count - 1);
            check_invariants(&cqf);
            assert!(cqf.remove_by_hash(hash, u64::MAX, LockMode::NONE).unwrap());
            assert_eq!(cqf.query_by_hash(hash), 0);
            check_invariants(&cqf);
            for &(other, other_count) in &keys[i + 1..] {
                assert_eq!(cqf.query_by_hash(other), other_count);
            }
        }
        assert!(cqf.is_empty());
        assert!(!cqf.remove(12345, 1, LockMode::NONE).unwrap());
    }

    #[test]
    fn shrinking_counts_release_slots() {
        let cqf = filter(64, 16, 0);
        let a = cqf.join_hash(10, 1);
        let b = cqf.join_hash(10, 2);
        let c = cqf.join_hash(11, 0);
        cqf.insert_by_hash(a, 1 << 40, LockMode::NONE).unwrap();
        cqf.insert_by_hash(b, 3, LockMode::NONE).unwrap();
        cqf.insert_by_hash(c, 1, LockMode::NONE).unwrap();
        check_invariants(&cqf);
        let used = cqf.nused_slots();
        cqf.set_count_by_hash(a, 2, LockMode::NONE).unwrap();
        assert!(cqf.nused_slots() < used);
        assert_eq!(cqf.query_by_hash(a), 2);
        assert_eq!(cqf.query_by_hash(b), 3);
        assert_eq!(cqf.query_by_hash(c), 1);
        check_invariants(&cqf);
        cqf.set_count_by_hash(b, 0, LockMode::NONE).unwrap();
        assert_eq!(cqf.query_by_hash(b), 0);
        check_invariants(&cqf);
    }

    #[test]
    fn tags_follow_records() {
        let cqf = Cqf::new(CqfParams::new(64, 16).with_tag_bits(3)).unwrap();
        cqf.insert(42, 3, LockMode::NONE).unwrap();
        assert_eq!(cqf.tag(42), Some(0));
        assert!(cqf.set_tag(42, 5, LockMode::NONE).unwrap());
        assert_eq!(cqf.tag(42), Some(5));
        cqf.insert(42, 100, LockMode::NONE).unwrap();
        assert_eq!(cqf.tag(42), Some(5));
        assert_eq!(cqf.query(42), 103);
        assert!(cqf.remove_tag(42, LockMode::NONE).unwrap());
        assert_eq!(cqf.tag(42), Some(0));
        assert!(!cqf.set_tag(43, 1, LockMode::NONE).unwrap());
        assert_eq!(cqf.tag(43), None);
        assert!(matches!(
            cqf.set_tag(42, 8, LockMode::NONE),
            Err(CqfError::InvalidArguments(_))
        ));
    }

    #[test]
    fn full_filter_reports_capacity() {
        let cqf = filter(64, 16, 0);
        let mut inserted = 0;
        let err = loop {
            match cqf.insert(inserted, 1, LockMode::NONE) {
                Ok(()) => inserted += 1,
                Err(err) => break err,
            }
        };
        assert!(matches!(err, CqfError::CapacityExhausted { .. }));
        assert_eq!(cqf.nused_slots(), cqf.geometry().maximum_occupied_slots);
        let before = cqf.nelts();
        assert!(cqf.insert(inserted, 1, LockMode::NONE).is_err());
        assert_eq!(cqf.nelts(), before);
        for key in 0..inserted {
            assert_eq!(cqf.query(key), 1);
        }
        check_invariants(&cqf);
    }

    #[test]
    fn try_mode_fails_fast_on_held_region() {
        let cqf = filter(64, 16, 0);
        let guard = cqf.locks.lock_range(0, 0, false).unwrap();
        match cqf.insert(1, 1, LockMode::TRY) {
            Err(err) => assert!(err.is_retryable()),
            Ok(()) => panic!("insert went through a held lock"),
        }
        assert_eq!(cqf.query(1), 0);
        drop(guard);
        cqf.insert(1, 1, LockMode::TRY).unwrap();
        assert_eq!(cqf.query(1), 1);
        assert!(cqf.total_lock_stats().acquisitions >= 2);
    }
}

use super::Cqf;
use crate::blocks::{Blocks, PackedBlocks};

/// One stored key with its multiplicity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Record {
    pub key: u64,
    pub hash: u64,
    pub tag: u64,
    pub count: u64,
}

/// Walks the records of a filter in ascending hash order, which is
/// ascending `(quotient, remainder)` order.
pub struct CqfIter<'a> {
    cqf: &'a Cqf,
    blocks: PackedBlocks<'a>,
    quotient: u64,
    position: u64,
    done: bool,
}

impl<'a> CqfIter<'a> {
    pub(crate) fn new(cqf: &'a Cqf) -> Self {
        let blocks = cqf.blocks();
        let mut iter = Self {
            cqf,
            blocks,
            quotient: 0,
            position: 0,
            done: false,
        };
        iter.start_at_quotient(0);
        iter
    }

    fn start_at_quotient(&mut self, from: u64) {
        match self.blocks.next_occupied(from, self.cqf.geometry.nslots) {
            Some(quotient) => {
                self.quotient = quotient;
                self.position = self.blocks.run_start(quotient);
                self.done = false;
            }
            None => self.done = true,
        }
    }

    /// Moves past a record of `len` slots at the current position.
    fn advance(&mut self, len: u64) {
        let end = self.position + len - 1;
        if self.blocks.is_runend(end) {
            match self.blocks.next_occupied(self.quotient + 1, self.cqf.geometry.nslots) {
                Some(quotient) => {
                    self.quotient = quotient;
                    self.position = quotient.max(end + 1);
                }
                None => self.done = true,
            }
        } else {
            self.position = end + 1;
        }
        if self.position >= self.blocks.num_slots() {
            self.done = true;
        }
    }

    /// Positions the iterator on the first record whose hash is `>= hash`.
    pub fn seek(&mut self, hash: u64) {
        let (quotient, remainder) = self.cqf.split_hash(hash & self.cqf.hasher.mask());
        self.start_at_quotient(quotient);
        while !self.done && self.quotient == quotient {
            let record = self.cqf.decode(&self.blocks, self.position);
            if record.remainder >= remainder {
                break;
            }
            self.advance(record.len);
        }
    }

    /// The next record without consuming it.
    pub fn peek(&self) -> Option<Record> {
        if self.done {
            return None;
        }
        let record = self.cqf.decode(&self.blocks, self.position);
        let hash = self.cqf.join_hash(self.quotient, record.remainder);
        Some(Record {
            key: self.cqf.hasher.invert(hash),
            hash,
            tag: record.tag,
            count: record.count,
        })
    }

    pub fn quotient(&self) -> Option<u64> {
        (!self.done).then_some(self.quotient)
    }
}

impl Iterator for CqfIter<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        if self.done {
            return None;
        }
        let record = self.cqf.decode(&self.blocks, self.position);
        let hash = self.cqf.join_hash(self.quotient, record.remainder);
        self.advance(record.len);
        Some(Record {
            key: self.cqf.hasher.invert(hash),
            hash,
            tag: record.tag,
            count: record.count,
        })
    }
}

impl Cqf {
    pub fn iter(&self) -> CqfIter<'_> {
        CqfIter::new(self)
    }

    /// Iterator starting at the first record whose hash is at least
    /// `key`'s hash.
    pub fn iter_from(&self, key: u64) -> CqfIter<'_> {
        self.iter_from_hash(self.hasher.hash(key))
    }

    pub fn iter_from_hash(&self, hash: u64) -> CqfIter<'_> {
        let mut iter = CqfIter::new(self);
        iter.seek(hash);
        iter
    }

    /// Iterator positioned on `key`'s record, if the key is present.
    pub fn find(&self, key: u64) -> Option<CqfIter<'_>> {
        let hash = self.hasher.hash(key);
        let iter = self.iter_from_hash(hash);
        match iter.peek() {
            Some(record) if record.hash == hash => Some(iter),
            _ => None,
        }
    }
}

impl<'a> IntoIterator for &'a Cqf {
    type Item = Record;
    type IntoIter = CqfIter<'a>;

    fn into_iter(self) -> CqfIter<'a> {
        self.iter()
    }
}

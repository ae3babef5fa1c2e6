//! On-disk layout: a fixed header of little-endian words, then the block
//! array exactly as it sits in memory.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use super::{Counters, Cqf, Geometry};
use crate::error::{CqfError, Result};
use crate::storage::{HeapStorage, MmapStorage, Storage};

pub const MAGIC: u64 = u64::from_le_bytes(*b"MQFv1\0\0\0");
pub const META_WORDS: usize = 20;

const W_MAGIC: usize = 0;
const W_TOTAL_SIZE: usize = 1;
const W_SEED: usize = 2;
const W_NSLOTS: usize = 3;
const W_XNSLOTS: usize = 4;
const W_KEY_BITS: usize = 5;
const W_TAG_BITS: usize = 6;
const W_COUNTER_BITS: usize = 7;
const W_REMAINDER_BITS: usize = 8;
const W_BITS_PER_SLOT: usize = 9;
const W_NBLOCKS: usize = 10;
const W_NELTS: usize = 11;
const W_NDISTINCT: usize = 12;
const W_NOCCUPIED: usize = 13;
const W_NUSED: usize = 14;
const W_MAX_OCCUPIED: usize = 15;
const W_MAX_COUNT: usize = 16;
const W_NUM_LOCKS: usize = 17;
const W_IN_MEMORY: usize = 18;

fn malformed(reason: String) -> CqfError {
    warn!(%reason, "rejected persisted filter");
    CqfError::MalformedPersisted(reason)
}

/// Checks a header against the word count it came with and returns the
/// layout and counters it describes.
fn read_header(words: &[AtomicU64]) -> Result<(Geometry, Counters)> {
    if words.len() < META_WORDS {
        return Err(malformed(format!(
            "{} words is shorter than the {META_WORDS} word header",
            words.len()
        )));
    }
    let word = |i: usize| words[i].load(Ordering::Relaxed);
    if word(W_MAGIC) != MAGIC {
        return Err(malformed(format!("bad magic {:#x}", word(W_MAGIC))));
    }
    let actual_bytes = (words.len() * std::mem::size_of::<u64>()) as u64;
    if word(W_TOTAL_SIZE) != actual_bytes {
        return Err(malformed(format!(
            "header declares {} bytes, found {actual_bytes}",
            word(W_TOTAL_SIZE)
        )));
    }
    let geometry = Geometry::new(
        word(W_NSLOTS),
        word(W_KEY_BITS),
        word(W_TAG_BITS),
        word(W_COUNTER_BITS),
        word(W_SEED),
    )
    .map_err(|err| malformed(format!("inconsistent widths: {err}")))?;
    let stored = [
        ("xnslots", W_XNSLOTS, geometry.xnslots),
        ("remainder_bits", W_REMAINDER_BITS, geometry.remainder_bits),
        ("bits_per_slot", W_BITS_PER_SLOT, geometry.bits_per_slot),
        ("nblocks", W_NBLOCKS, geometry.nblocks),
        ("maximum_occupied_slots", W_MAX_OCCUPIED, geometry.maximum_occupied_slots),
        ("num_locks", W_NUM_LOCKS, geometry.num_locks),
    ];
    for (name, index, expected) in stored {
        if word(index) != expected {
            return Err(malformed(format!(
                "{name} is {} but the widths imply {expected}",
                word(index)
            )));
        }
    }
    if geometry.storage_words() != words.len() {
        return Err(malformed(format!(
            "layout needs {} words, found {}",
            geometry.storage_words(),
            words.len()
        )));
    }
    let (ndistinct, noccupied, nused) = (word(W_NDISTINCT), word(W_NOCCUPIED), word(W_NUSED));
    if nused > geometry.xnslots || noccupied > ndistinct || ndistinct > nused {
        return Err(malformed(format!(
            "counters out of range: {ndistinct} distinct, {noccupied} occupied, {nused} used"
        )));
    }
    let counters = Counters {
        nelts: AtomicU64::new(word(W_NELTS)),
        ndistinct_elts: AtomicU64::new(ndistinct),
        noccupied_slots: AtomicU64::new(noccupied),
        nused_slots: AtomicU64::new(nused),
        maximum_count: AtomicU64::new(word(W_MAX_COUNT).max(1)),
    };
    Ok((geometry, counters))
}

impl Cqf {
    /// Stores the layout and current counters into the header words.
    pub(crate) fn write_header(&self) {
        let g = &self.geometry;
        let words = self.storage.words();
        let fields = [
            (W_MAGIC, MAGIC),
            (W_TOTAL_SIZE, g.total_size_bytes()),
            (W_SEED, g.seed),
            (W_NSLOTS, g.nslots),
            (W_XNSLOTS, g.xnslots),
            (W_KEY_BITS, g.key_bits),
            (W_TAG_BITS, g.tag_bits),
            (W_COUNTER_BITS, g.fixed_counter_bits),
            (W_REMAINDER_BITS, g.remainder_bits),
            (W_BITS_PER_SLOT, g.bits_per_slot),
            (W_NBLOCKS, g.nblocks),
            (W_NELTS, self.nelts()),
            (W_NDISTINCT, self.ndistinct_elts()),
            (W_NOCCUPIED, self.noccupied_slots()),
            (W_NUSED, self.nused_slots()),
            (W_MAX_OCCUPIED, g.maximum_occupied_slots),
            (W_MAX_COUNT, self.maximum_count()),
            (W_NUM_LOCKS, g.num_locks),
            (W_IN_MEMORY, self.path().is_none() as u64),
        ];
        for (index, value) in fields {
            words[index].store(value, Ordering::Relaxed);
        }
    }

    fn from_storage(storage: Box<dyn Storage>) -> Result<Self> {
        let (geometry, counters) = read_header(storage.words())?;
        let mut cqf = Self::from_parts(geometry, storage);
        cqf.counters = counters;
        Ok(cqf)
    }

    /// Writes header and blocks to `path`. A filter already mapped at
    /// `path` is synced instead.
    pub fn serialize(&self, path: &Path) -> Result<()> {
        self.write_header();
        if self.path() == Some(path) {
            return self.sync();
        }
        let mut out = BufWriter::new(File::create(path)?);
        for word in self.storage.words() {
            out.write_all(&word.load(Ordering::Relaxed).to_le_bytes())?;
        }
        out.flush()?;
        debug!(path = %path.display(), bytes = self.geometry.total_size_bytes(), "serialized filter");
        Ok(())
    }

    /// Reads a serialized filter fully into process memory.
    pub fn deserialize(path: &Path) -> Result<Self> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        if bytes.len() % std::mem::size_of::<u64>() != 0 {
            return Err(malformed(format!(
                "{} is not a whole number of words ({} bytes)",
                path.display(),
                bytes.len()
            )));
        }
        let words = bytes
            .chunks_exact(std::mem::size_of::<u64>())
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                u64::from_le_bytes(word)
            })
            .collect();
        let cqf = Self::from_storage(Box::new(HeapStorage::from_words(words)))?;
        cqf.write_header();
        debug!(path = %path.display(), nelts = cqf.nelts(), "loaded filter");
        Ok(cqf)
    }

    /// Maps a serialized filter in place. Writes go straight to the file.
    pub fn open(path: &Path) -> Result<Self> {
        let storage = MmapStorage::open(path)?;
        storage.advise_random();
        let cqf = Self::from_storage(Box::new(storage))?;
        cqf.write_header();
        debug!(path = %path.display(), nelts = cqf.nelts(), "mapped filter");
        Ok(cqf)
    }

    /// Flushes the header and, for a mapped filter, its dirty pages.
    pub fn sync(&self) -> Result<()> {
        self.write_header();
        self.storage.sync()?;
        Ok(())
    }
}

impl Drop for Cqf {
    fn drop(&mut self) {
        if self.path().is_some() {
            self.write_header();
        }
    }
}

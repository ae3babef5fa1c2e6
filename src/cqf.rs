use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::blocks::PackedBlocks;
use crate::error::{CqfError, Result};
use crate::locks::{LockStats, LockTable, SLOTS_PER_LOCK};
use crate::reversible_hasher::ReversibleHasher;
use crate::storage::{HeapStorage, MmapStorage, Storage};
use crate::SLOTS_PER_BLOCK;

mod algebra;
mod filter;
mod iter;
mod persist;

pub use algebra::{CqfMerge, MergeWalk};
pub use iter::{CqfIter, Record};
pub use persist::{MAGIC, META_WORDS};

/// Where a filter's words live.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Residency {
    #[default]
    InMemory,
    /// A new file at this path, mapped shared.
    File(PathBuf),
}

/// Construction parameters of a single filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CqfParams {
    /// Number of home slots. A power of two, at least one block.
    pub nslots: u64,
    /// Width of the keys (and of their hashes).
    pub key_bits: u64,
    pub tag_bits: u64,
    /// Counter bits stored inline in every slot.
    pub fixed_counter_bits: u64,
    pub seed: u64,
    /// Saturating cap on any one key's count. `None` leaves counts exact.
    pub maximum_count: Option<u64>,
    pub residency: Residency,
}

impl CqfParams {
    pub fn new(nslots: u64, key_bits: u64) -> Self {
        Self {
            nslots,
            key_bits,
            tag_bits: 0,
            fixed_counter_bits: 0,
            seed: 0,
            maximum_count: None,
            residency: Residency::InMemory,
        }
    }

    pub fn with_nslots(mut self, nslots: u64) -> Self {
        self.nslots = nslots;
        self
    }

    pub fn with_tag_bits(mut self, tag_bits: u64) -> Self {
        self.tag_bits = tag_bits;
        self
    }

    pub fn with_fixed_counter_bits(mut self, fixed_counter_bits: u64) -> Self {
        self.fixed_counter_bits = fixed_counter_bits;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_maximum_count(mut self, maximum_count: Option<u64>) -> Self {
        self.maximum_count = maximum_count;
        self
    }

    pub fn with_residency(mut self, residency: Residency) -> Self {
        self.residency = residency;
        self
    }

    pub fn in_file(self, path: impl Into<PathBuf>) -> Self {
        self.with_residency(Residency::File(path.into()))
    }

    pub fn geometry(&self) -> Result<Geometry> {
        Geometry::new(
            self.nslots,
            self.key_bits,
            self.tag_bits,
            self.fixed_counter_bits,
            self.seed,
        )
    }
}

/// Bit widths and slot counts fixed for the lifetime of a filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub nslots: u64,
    /// Home slots plus the overflow region at the tail.
    pub xnslots: u64,
    pub nblocks: u64,
    pub quotient_bits: u64,
    pub key_bits: u64,
    pub remainder_bits: u64,
    pub tag_bits: u64,
    pub fixed_counter_bits: u64,
    pub bits_per_slot: u64,
    pub seed: u64,
    pub maximum_occupied_slots: u64,
    pub num_locks: u64,
}

impl Geometry {
    pub fn new(
        nslots: u64,
        key_bits: u64,
        tag_bits: u64,
        fixed_counter_bits: u64,
        seed: u64,
    ) -> Result<Self> {
        if !nslots.is_power_of_two() || nslots < SLOTS_PER_BLOCK as u64 {
            return Err(CqfError::InvalidArguments(format!(
                "nslots must be a power of two of at least {SLOTS_PER_BLOCK}, got {nslots}"
            )));
        }
        let quotient_bits = nslots.trailing_zeros() as u64;
        if key_bits > 64 || key_bits <= quotient_bits {
            return Err(CqfError::InvalidArguments(format!(
                "key_bits must be in {}..=64, got {key_bits}",
                quotient_bits + 1
            )));
        }
        let remainder_bits = key_bits - quotient_bits;
        let bits_per_slot = remainder_bits + tag_bits + fixed_counter_bits;
        if bits_per_slot > 64 {
            return Err(CqfError::InvalidArguments(format!(
                "{remainder_bits} remainder + {tag_bits} tag + {fixed_counter_bits} counter bits do not fit a 64 bit slot"
            )));
        }
        let xnslots = nslots + (10.0 * (nslots as f64).sqrt()) as u64;
        let nblocks = xnslots.div_ceil(SLOTS_PER_BLOCK as u64);
        Ok(Self {
            nslots,
            xnslots,
            nblocks,
            quotient_bits,
            key_bits,
            remainder_bits,
            tag_bits,
            fixed_counter_bits,
            bits_per_slot,
            seed,
            maximum_occupied_slots: (nslots as f64 * 0.95) as u64,
            num_locks: xnslots / SLOTS_PER_LOCK + 10,
        })
    }

    pub fn storage_words(&self) -> usize {
        META_WORDS + PackedBlocks::words_needed(self.nblocks as usize, self.bits_per_slot)
    }

    pub fn total_size_bytes(&self) -> u64 {
        (self.storage_words() * std::mem::size_of::<u64>()) as u64
    }

    /// Whether records of one filter can be walked against the other.
    pub fn compatible_with(&self, other: &Geometry) -> Result<()> {
        if self.key_bits != other.key_bits {
            return Err(CqfError::IncompatibleMerge(format!(
                "key bits differ: {} vs {}",
                self.key_bits, other.key_bits
            )));
        }
        if self.tag_bits != other.tag_bits {
            return Err(CqfError::IncompatibleMerge(format!(
                "tag bits differ: {} vs {}",
                self.tag_bits, other.tag_bits
            )));
        }
        if self.seed != other.seed {
            return Err(CqfError::IncompatibleMerge("hash seeds differ".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    pub nelts: AtomicU64,
    pub ndistinct_elts: AtomicU64,
    /// Set bits across all occupied bitmaps.
    pub noccupied_slots: AtomicU64,
    /// Slots holding record data, counter extensions included.
    pub nused_slots: AtomicU64,
    pub maximum_count: AtomicU64,
}

/// Point-in-time view of a filter's metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub geometry: Geometry,
    pub nelts: u64,
    pub ndistinct_elts: u64,
    pub noccupied_slots: u64,
    pub nused_slots: u64,
    pub maximum_count: u64,
    pub in_memory: bool,
    pub total_size_bytes: u64,
}

/// Insert, query and iterate: all a secondary index built on top of a
/// filter needs.
pub trait CountingFilter {
    fn add(&mut self, key: u64, count: u64) -> Result<()>;
    fn count(&self, key: u64) -> u64;
    fn records(&self) -> Box<dyn Iterator<Item = Record> + '_>;
}

/// A counting quotient filter over `key_bits`-wide keys.
pub struct Cqf {
    geometry: Geometry,
    counters: Counters,
    hasher: ReversibleHasher,
    storage: Box<dyn Storage>,
    locks: LockTable,
}

impl Cqf {
    pub fn new(params: CqfParams) -> Result<Self> {
        let geometry = params.geometry()?;
        let words = geometry.storage_words();
        let storage: Box<dyn Storage> = match &params.residency {
            Residency::InMemory => Box::new(HeapStorage::new(words)),
            Residency::File(path) => Box::new(MmapStorage::create(path, words)?),
        };
        let cqf = Self::from_parts(geometry, storage);
        cqf.counters
            .maximum_count
            .store(params.maximum_count.unwrap_or(u64::MAX), Ordering::Relaxed);
        cqf.write_header();
        debug!(
            nslots = geometry.nslots,
            xnslots = geometry.xnslots,
            key_bits = geometry.key_bits,
            bits_per_slot = geometry.bits_per_slot,
            bytes = geometry.total_size_bytes(),
            file = ?cqf.path(),
            "created filter"
        );
        Ok(cqf)
    }

    pub fn in_memory(nslots: u64, key_bits: u64) -> Result<Self> {
        Self::new(CqfParams::new(nslots, key_bits))
    }

    fn from_parts(geometry: Geometry, storage: Box<dyn Storage>) -> Self {
        Self {
            geometry,
            counters: Counters::default(),
            hasher: ReversibleHasher::new(geometry.key_bits, geometry.seed),
            storage,
            locks: LockTable::new(geometry.num_locks as usize),
        }
    }

    pub(crate) fn blocks(&self) -> PackedBlocks<'_> {
        PackedBlocks::new(
            &self.storage.words()[META_WORDS..],
            self.geometry.bits_per_slot,
            self.geometry.nblocks as usize,
        )
    }

    /// Parameters that would build an empty filter of the same layout.
    pub fn params(&self) -> CqfParams {
        let g = &self.geometry;
        let maximum_count = self.maximum_count();
        CqfParams {
            nslots: g.nslots,
            key_bits: g.key_bits,
            tag_bits: g.tag_bits,
            fixed_counter_bits: g.fixed_counter_bits,
            seed: g.seed,
            maximum_count: (maximum_count != u64::MAX).then_some(maximum_count),
            residency: Residency::InMemory,
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn hasher(&self) -> &ReversibleHasher {
        &self.hasher
    }

    pub fn path(&self) -> Option<&Path> {
        self.storage.path()
    }

    pub fn metadata(&self) -> Metadata {
        Metadata {
            geometry: self.geometry,
            nelts: self.nelts(),
            ndistinct_elts: self.ndistinct_elts(),
            noccupied_slots: self.noccupied_slots(),
            nused_slots: self.nused_slots(),
            maximum_count: self.maximum_count(),
            in_memory: self.storage.path().is_none(),
            total_size_bytes: self.geometry.total_size_bytes(),
        }
    }

    pub fn nelts(&self) -> u64 {
        self.counters.nelts.load(Ordering::Relaxed)
    }

    pub fn ndistinct_elts(&self) -> u64 {
        self.counters.ndistinct_elts.load(Ordering::Relaxed)
    }

    pub fn noccupied_slots(&self) -> u64 {
        self.counters.noccupied_slots.load(Ordering::Relaxed)
    }

    pub fn nused_slots(&self) -> u64 {
        self.counters.nused_slots.load(Ordering::Relaxed)
    }

    pub fn maximum_count(&self) -> u64 {
        self.counters.maximum_count.load(Ordering::Relaxed)
    }

    /// Counts above `maximum_count` saturate from now on. `None` lifts the cap.
    pub fn set_maximum_count(&self, maximum_count: Option<u64>) {
        self.counters
            .maximum_count
            .store(maximum_count.unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn is_empty(&self) -> bool {
        self.nused_slots() == 0
    }

    /// Percentage of the home slots holding record data.
    pub fn space(&self) -> u8 {
        (self.nused_slots() * 100 / self.geometry.nslots).min(u8::MAX as u64) as u8
    }

    pub fn lock_stats(&self) -> Vec<LockStats> {
        (0..self.locks.len()).map(|region| self.locks.stats(region)).collect()
    }

    pub fn total_lock_stats(&self) -> LockStats {
        self.locks.total_stats()
    }

    pub(crate) fn split_hash(&self, hash: u64) -> (u64, u64) {
        let r = self.geometry.remainder_bits;
        (hash >> r, hash & crate::utils::bitmask(r))
    }

    pub(crate) fn join_hash(&self, quotient: u64, remainder: u64) -> u64 {
        (quotient << self.geometry.remainder_bits) | remainder
    }

    /// Empties the filter, keeping its storage.
    pub fn reset(&mut self) {
        self.blocks().clear();
        self.counters.nelts.store(0, Ordering::Relaxed);
        self.counters.ndistinct_elts.store(0, Ordering::Relaxed);
        self.counters.noccupied_slots.store(0, Ordering::Relaxed);
        self.counters.nused_slots.store(0, Ordering::Relaxed);
        self.write_header();
    }

    /// Overwrites this filter with the contents of `other`, which must have
    /// the same geometry. The storage (heap or mapping) stays this filter's.
    pub fn copy_from(&mut self, other: &Cqf) -> Result<()> {
        if self.geometry != other.geometry {
            return Err(CqfError::IncompatibleMerge(format!(
                "cannot copy a {} slot filter into a {} slot one",
                other.geometry.nslots, self.geometry.nslots
            )));
        }
        let src = &other.storage.words()[META_WORDS..];
        let dst = &self.storage.words()[META_WORDS..];
        for (d, s) in dst.iter().zip(src) {
            d.store(s.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        let counters = [
            (&self.counters.nelts, &other.counters.nelts),
            (&self.counters.ndistinct_elts, &other.counters.ndistinct_elts),
            (&self.counters.noccupied_slots, &other.counters.noccupied_slots),
            (&self.counters.nused_slots, &other.counters.nused_slots),
        ];
        for (d, s) in counters {
            d.store(s.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        self.write_header();
        Ok(())
    }

    /// Same layout and the same records with the same counts and tags.
    pub fn equals(&self, other: &Cqf) -> bool {
        self.geometry == other.geometry
            && self.nelts() == other.nelts()
            && self.ndistinct_elts() == other.ndistinct_elts()
            && self.iter().eq(other.iter())
    }
}

impl CountingFilter for Cqf {
    fn add(&mut self, key: u64, count: u64) -> Result<()> {
        self.insert(key, count, crate::LockMode::NONE)
    }

    fn count(&self, key: u64) -> u64 {
        self.query(key)
    }

    fn records(&self) -> Box<dyn Iterator<Item = Record> + '_> {
        Box::new(self.iter())
    }
}

impl std::fmt::Debug for Cqf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cqf")
            .field("geometry", &self.geometry)
            .field("nelts", &self.nelts())
            .field("ndistinct_elts", &self.ndistinct_elts())
            .field("nused_slots", &self.nused_slots())
            .field("path", &self.path())
            .finish()
    }
}

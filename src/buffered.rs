//! Two-tier filter: a small in-memory fast tier takes the writes and is
//! periodically merged into a large, possibly file-backed, capacity tier.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::cqf::{CountingFilter, Cqf, CqfIter, CqfMerge, CqfParams, MergeWalk, Record, Residency};
use crate::error::{CqfError, Result};
use crate::locks::LockMode;

#[derive(Clone, Debug, PartialEq)]
pub struct BufferedParams {
    pub fast_slots: u64,
    pub capacity_slots: u64,
    pub key_bits: u64,
    pub tag_bits: u64,
    pub fixed_counter_bits: u64,
    pub seed: u64,
    /// Fraction of the fast tier's occupancy ceiling that triggers a flush.
    pub flush_threshold: f64,
    /// Backing file of the capacity tier. `None` keeps it in memory.
    pub capacity_path: Option<PathBuf>,
    pub maximum_count: Option<u64>,
}

impl BufferedParams {
    pub fn new(fast_slots: u64, capacity_slots: u64, key_bits: u64) -> Self {
        Self {
            fast_slots,
            capacity_slots,
            key_bits,
            tag_bits: 0,
            fixed_counter_bits: 0,
            seed: 0,
            flush_threshold: 0.9,
            capacity_path: None,
            maximum_count: None,
        }
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

    pub fn with_flush_threshold(mut self, flush_threshold: f64) -> Self {
        self.flush_threshold = flush_threshold;
        self
    }

    pub fn with_capacity_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.capacity_path = Some(path.into());
        self
    }

    pub fn with_maximum_count(mut self, maximum_count: Option<u64>) -> Self {
        self.maximum_count = maximum_count;
        self
    }

    fn tier(&self, nslots: u64) -> CqfParams {
        CqfParams::new(nslots, self.key_bits)
            .with_tag_bits(self.tag_bits)
            .with_fixed_counter_bits(self.fixed_counter_bits)
            .with_seed(self.seed)
            .with_maximum_count(self.maximum_count)
    }
}

fn check_threshold(flush_threshold: f64) -> Result<()> {
    if !(flush_threshold > 0.0 && flush_threshold <= 1.0) {
        return Err(CqfError::InvalidArguments(format!(
            "flush threshold must be in (0, 1], got {flush_threshold}"
        )));
    }
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Path of the fast tier saved next to a capacity tier at `path`.
fn fast_path(path: &Path) -> PathBuf {
    with_suffix(path, ".fast")
}

/// Replaces `capacity` with a rebuilt filter of the same layout, filled by
/// `fill` from the current one. A file-backed tier is rebuilt in
/// `<path>.merge` and renamed over its file, so it never needs a heap
/// copy. `capacity` is unchanged when `fill` fails.
fn rebuild_capacity(
    capacity: &mut Cqf,
    fill: impl FnOnce(&Cqf, &mut Cqf) -> Result<()>,
) -> Result<()> {
    let Some(path) = capacity.path().map(Path::to_path_buf) else {
        let mut rebuilt = Cqf::new(capacity.params())?;
        fill(capacity, &mut rebuilt)?;
        *capacity = rebuilt;
        return Ok(());
    };
    let staging = with_suffix(&path, ".merge");
    match fs::remove_file(&staging) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
        _ => {}
    }
    let mut rebuilt = Cqf::new(capacity.params().with_residency(Residency::File(staging.clone())))?;
    if let Err(err) = fill(capacity, &mut rebuilt) {
        drop(rebuilt);
        if let Err(cleanup) = fs::remove_file(&staging) {
            warn!(path = %staging.display(), %cleanup, "could not remove staging file");
        }
        return Err(err);
    }
    rebuilt.sync()?;
    drop(rebuilt);
    fs::rename(&staging, &path)?;
    *capacity = Cqf::open(&path)?;
    debug!(path = %path.display(), "swapped in rebuilt capacity tier");
    Ok(())
}

pub struct BufferedFilter {
    /// `None` after [`BufferedFilter::delete_fast_tier`].
    fast: Option<Cqf>,
    capacity: Cqf,
    fast_params: CqfParams,
    flush_threshold: f64,
}

impl BufferedFilter {
    pub fn new(params: BufferedParams) -> Result<Self> {
        check_threshold(params.flush_threshold)?;
        let fast_params = params.tier(params.fast_slots);
        let residency = match &params.capacity_path {
            Some(path) => Residency::File(path.clone()),
            None => Residency::InMemory,
        };
        let capacity = Cqf::new(params.tier(params.capacity_slots).with_residency(residency))?;
        let fast = Cqf::new(fast_params.clone())?;
        Ok(Self {
            fast: Some(fast),
            capacity,
            fast_params,
            flush_threshold: params.flush_threshold,
        })
    }

    /// Loaded filters start from the default flush threshold; it is not
    /// part of either tier's file.
    fn from_tiers(fast: Cqf, capacity: Cqf) -> Result<Self> {
        fast.geometry()
            .compatible_with(capacity.geometry())
            .map_err(|err| CqfError::MalformedPersisted(format!("tiers disagree: {err}")))?;
        Ok(Self {
            fast_params: fast.params(),
            fast: Some(fast),
            capacity,
            flush_threshold: 0.9,
        })
    }

    pub fn set_flush_threshold(&mut self, flush_threshold: f64) -> Result<()> {
        check_threshold(flush_threshold)?;
        self.flush_threshold = flush_threshold;
        Ok(())
    }

    pub fn flush_threshold(&self) -> f64 {
        self.flush_threshold
    }

    /// The fast tier, or `FastTierMissing` once it has been torn down.
    pub fn fast_tier(&self) -> Result<&Cqf> {
        self.fast.as_ref().ok_or(CqfError::FastTierMissing)
    }

    pub fn capacity_tier(&self) -> &Cqf {
        &self.capacity
    }

    pub fn has_fast_tier(&self) -> bool {
        self.fast.is_some()
    }

    pub fn maximum_count(&self) -> u64 {
        self.capacity.maximum_count()
    }

    pub fn set_maximum_count(&mut self, maximum_count: Option<u64>) {
        self.fast_params.maximum_count = maximum_count;
        if let Some(fast) = &self.fast {
            fast.set_maximum_count(maximum_count);
        }
        self.capacity.set_maximum_count(maximum_count);
    }

    /// Occupancy of the capacity tier, in percent.
    pub fn space(&self) -> u8 {
        self.capacity.space()
    }

    fn fast_mut(&mut self) -> Result<&mut Cqf> {
        if self.fast.is_none() {
            info!(nslots = self.fast_params.nslots, "re-creating fast tier");
            self.fast = Some(Cqf::new(self.fast_params.clone())?);
        }
        self.fast.as_mut().ok_or(CqfError::FastTierMissing)
    }

    fn over_threshold(&self) -> bool {
        self.fast.as_ref().is_some_and(|fast| {
            let ceiling = fast.geometry().maximum_occupied_slots as f64;
            fast.nused_slots() as f64 >= self.flush_threshold * ceiling
        })
    }

    /// Adds `count` occurrences of `key` to the fast tier, flushing it into
    /// the capacity tier when it fills up. If the flush fails the insert is
    /// undone.
    pub fn insert(&mut self, key: u64, count: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let fast = self.fast_mut()?;
        let mut previous = fast.query(key);
        match fast.insert(key, count, LockMode::NONE) {
            Err(CqfError::CapacityExhausted { .. }) => {
                self.flush()?;
                let fast = self.fast_mut()?;
                previous = fast.query(key);
                fast.insert(key, count, LockMode::NONE)?;
            }
            other => other?,
        }
        if self.over_threshold() {
            if let Err(err) = self.flush() {
                self.fast_mut()?.set_count(key, previous, LockMode::NONE)?;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Removes up to `count` occurrences, fast tier first. Returns whether
    /// the key was present in either tier.
    pub fn remove(&mut self, key: u64, count: u64) -> Result<bool> {
        let mut remaining = count;
        let mut present = false;
        if let Some(fast) = &self.fast {
            let held = fast.query(key);
            if held > 0 {
                present = true;
                fast.remove(key, remaining.min(held), LockMode::NONE)?;
                remaining = remaining.saturating_sub(held);
            }
        }
        if remaining > 0 || !present {
            present |= self.capacity.remove(key, remaining, LockMode::NONE)?;
        }
        Ok(present)
    }

    /// Combined count over both tiers, capped at the maximum count.
    pub fn count_key(&self, key: u64) -> u64 {
        let fast = self.fast.as_ref().map_or(0, |fast| fast.query(key));
        fast.saturating_add(self.capacity.query(key))
            .min(self.maximum_count())
    }

    pub fn query(&self, key: u64) -> u64 {
        self.count_key(key)
    }

    /// Merges the fast tier into the capacity tier and empties it. The
    /// capacity tier is left untouched if the merge does not fit.
    pub fn flush(&mut self) -> Result<()> {
        let Some(fast) = &mut self.fast else {
            return Ok(());
        };
        if fast.is_empty() {
            return Ok(());
        }
        let outcome = rebuild_capacity(&mut self.capacity, |capacity, merged| {
            CqfMerge::merge(fast.iter(), capacity.iter(), merged)
        });
        if let Err(err) = outcome {
            warn!(
                fast_used = fast.nused_slots(),
                capacity_used = self.capacity.nused_slots(),
                %err,
                "flush into capacity tier failed"
            );
            return Err(err);
        }
        debug!(
            fast_used = fast.nused_slots(),
            capacity_used = self.capacity.nused_slots(),
            "flushed fast tier"
        );
        fast.reset();
        Ok(())
    }

    /// Flushes and releases the fast tier. The next insert creates a fresh
    /// one with the same layout.
    pub fn delete_fast_tier(&mut self) -> Result<()> {
        self.flush()?;
        if self.fast.take().is_some() {
            info!(nslots = self.fast_params.nslots, "released fast tier");
        }
        Ok(())
    }

    /// Overwrites every count in `query` with the combined count of that key
    /// here. Keys absent from both tiers are dropped from `query`.
    pub fn batch_query(&self, query: &mut Cqf) -> Result<()> {
        self.capacity.geometry().compatible_with(query.geometry())?;
        let mut answers = Cqf::new(query.params())?;
        CqfMerge::merge_by(query.iter(), self.iter(), &mut answers, |asked, held| {
            match (asked, held) {
                (Some(asked), Some(held)) => Some((held.count, asked.tag)),
                _ => None,
            }
        })?;
        query.copy_from(&answers)
    }

    /// Merges every record of `source`, both tiers, into the capacity tier
    /// of `destination`.
    pub fn migrate(destination: &mut BufferedFilter, source: &BufferedFilter) -> Result<()> {
        destination
            .capacity
            .geometry()
            .compatible_with(source.capacity.geometry())?;
        rebuild_capacity(&mut destination.capacity, |capacity, merged| {
            CqfMerge::merge(capacity.iter(), source.iter(), merged)
        })?;
        info!(
            records = source.capacity.ndistinct_elts(),
            capacity_used = destination.capacity.nused_slots(),
            "migrated filter"
        );
        Ok(())
    }

    fn walk<'a>(&'a self, fast: Option<CqfIter<'a>>, capacity: CqfIter<'a>) -> BufferedIter<'a> {
        BufferedIter {
            walk: MergeWalk::new(fast.into_iter().flatten(), capacity),
            maximum_count: self.maximum_count(),
        }
    }

    pub fn iter(&self) -> BufferedIter<'_> {
        self.walk(self.fast.as_ref().map(Cqf::iter), self.capacity.iter())
    }

    pub fn iter_from(&self, key: u64) -> BufferedIter<'_> {
        let hash = self.capacity.hasher().hash(key);
        self.walk(
            self.fast.as_ref().map(|fast| fast.iter_from_hash(hash)),
            self.capacity.iter_from_hash(hash),
        )
    }

    /// Combined iterator positioned on `key`, if either tier holds it.
    pub fn find(&self, key: u64) -> Option<BufferedIter<'_>> {
        let hash = self.capacity.hasher().hash(key);
        let fast = self.fast.as_ref().map(|fast| fast.iter_from_hash(hash));
        let capacity = self.capacity.iter_from_hash(hash);
        let hit = |iter: &CqfIter| iter.peek().is_some_and(|r| r.hash == hash);
        if fast.as_ref().is_some_and(hit) || hit(&capacity) {
            Some(self.walk(fast, capacity))
        } else {
            None
        }
    }

    /// Saves the capacity tier at `path` and the fast tier at `<path>.fast`.
    /// A torn-down fast tier is saved empty.
    pub fn serialize(&self, path: &Path) -> Result<()> {
        self.capacity.serialize(path)?;
        match &self.fast {
            Some(fast) => fast.serialize(&fast_path(path))?,
            None => Cqf::new(self.fast_params.clone())?.serialize(&fast_path(path))?,
        }
        Ok(())
    }

    /// Loads both tiers into memory.
    pub fn deserialize(path: &Path) -> Result<Self> {
        let capacity = Cqf::deserialize(path)?;
        let fast = Cqf::deserialize(&fast_path(path))?;
        Self::from_tiers(fast, capacity)
    }

    /// Maps the capacity tier in place and loads the fast tier into memory.
    pub fn open(path: &Path) -> Result<Self> {
        let capacity = Cqf::open(path)?;
        let fast = Cqf::deserialize(&fast_path(path))?;
        Self::from_tiers(fast, capacity)
    }

    /// Writes the capacity tier's header and pages back to its file.
    pub fn sync(&self) -> Result<()> {
        self.capacity.sync()
    }
}

impl CountingFilter for BufferedFilter {
    fn add(&mut self, key: u64, count: u64) -> Result<()> {
        self.insert(key, count)
    }

    fn count(&self, key: u64) -> u64 {
        self.count_key(key)
    }

    fn records(&self) -> Box<dyn Iterator<Item = Record> + '_> {
        Box::new(self.iter())
    }
}

impl std::fmt::Debug for BufferedFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedFilter")
            .field("fast", &self.fast)
            .field("capacity", &self.capacity)
            .field("flush_threshold", &self.flush_threshold)
            .finish()
    }
}

/// Records of both tiers in hash order, counts of shared keys summed.
pub struct BufferedIter<'a> {
    walk: MergeWalk<std::iter::Flatten<std::option::IntoIter<CqfIter<'a>>>, CqfIter<'a>>,
    maximum_count: u64,
}

impl Iterator for BufferedIter<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        match self.walk.next()? {
            (Some(fast), Some(capacity)) => Some(Record {
                count: fast
                    .count
                    .saturating_add(capacity.count)
                    .min(self.maximum_count),
                tag: fast.tag.max(capacity.tag),
                ..fast
            }),
            (Some(record), None) | (None, Some(record)) => Some(record),
            (None, None) => None,
        }
    }
}

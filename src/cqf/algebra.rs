//! Sorted merge-walks over record streams, and the filter algebra built on
//! them.

use std::cmp::Ordering as CmpOrdering;
use std::path::Path;
use std::sync::atomic::Ordering;

use tracing::info;

use super::{Cqf, CqfParams, Record, Residency};
use crate::blocks::Blocks;
use crate::error::{CqfError, Result};

/// Zips two hash-ordered record streams, pairing records with equal hashes.
pub struct MergeWalk<A: Iterator<Item = Record>, B: Iterator<Item = Record>> {
    iter_a: A,
    iter_b: B,
    current_a: Option<Record>,
    current_b: Option<Record>,
}

impl<A: Iterator<Item = Record>, B: Iterator<Item = Record>> MergeWalk<A, B> {
    pub fn new(mut iter_a: A, mut iter_b: B) -> Self {
        let current_a = iter_a.next();
        let current_b = iter_b.next();
        Self {
            iter_a,
            iter_b,
            current_a,
            current_b,
        }
    }
}

impl<A: Iterator<Item = Record>, B: Iterator<Item = Record>> Iterator for MergeWalk<A, B> {
    type Item = (Option<Record>, Option<Record>);

    fn next(&mut self) -> Option<Self::Item> {
        match (self.current_a, self.current_b) {
            (None, None) => None,
            (Some(a), None) => {
                self.current_a = self.iter_a.next();
                Some((Some(a), None))
            }
            (None, Some(b)) => {
                self.current_b = self.iter_b.next();
                Some((None, Some(b)))
            }
            (Some(a), Some(b)) => match a.hash.cmp(&b.hash) {
                CmpOrdering::Less => {
                    self.current_a = self.iter_a.next();
                    Some((Some(a), None))
                }
                CmpOrdering::Greater => {
                    self.current_b = self.iter_b.next();
                    Some((None, Some(b)))
                }
                CmpOrdering::Equal => {
                    self.current_a = self.iter_a.next();
                    self.current_b = self.iter_b.next();
                    Some((Some(a), Some(b)))
                }
            },
        }
    }
}

/// Writes records into an empty filter in ascending hash order, one slot
/// after another, without any shifting. Offsets are rebuilt on `finish`.
pub(crate) struct Appender<'a> {
    cqf: &'a mut Cqf,
    cursor: u64,
    last_quotient: Option<u64>,
    last_hash: Option<u64>,
    nelts: u64,
    ndistinct: u64,
    noccupied: u64,
    nused: u64,
}

impl<'a> Appender<'a> {
    pub fn new(cqf: &'a mut Cqf) -> Result<Self> {
        if !cqf.is_empty() {
            return Err(CqfError::InvalidArguments(
                "merge output filter must be empty".into(),
            ));
        }
        Ok(Self {
            cqf,
            cursor: 0,
            last_quotient: None,
            last_hash: None,
            nelts: 0,
            ndistinct: 0,
            noccupied: 0,
            nused: 0,
        })
    }

    pub fn push(&mut self, hash: u64, tag: u64, count: u64) -> Result<()> {
        let count = count.min(self.cqf.maximum_count());
        if count == 0 {
            return Ok(());
        }
        if self.last_hash.is_some_and(|last| hash <= last) {
            return Err(CqfError::InvalidArguments(format!(
                "records out of order at hash {hash:#x}"
            )));
        }
        let (quotient, remainder) = self.cqf.split_hash(hash);
        let slots = self.cqf.encode(remainder, tag, count);
        let len = slots.len() as u64;
        let same_run = self.last_quotient == Some(quotient);
        let start = if same_run {
            self.cursor
        } else {
            self.cursor.max(quotient)
        };
        let geometry = self.cqf.geometry;
        if start + len > geometry.xnslots || self.nused + len > geometry.maximum_occupied_slots {
            return Err(CqfError::CapacityExhausted {
                needed: len,
                available: geometry.maximum_occupied_slots.saturating_sub(self.nused),
            });
        }

        let blocks = self.cqf.blocks();
        if same_run {
            blocks.set_runend(start - 1, false);
        } else {
            blocks.set_occupied(quotient, true);
            self.noccupied += 1;
        }
        for (i, &value) in slots.iter().enumerate() {
            let position = start + i as u64;
            blocks.set_slot(position, value);
            blocks.set_count(position, i > 0);
        }
        blocks.set_runend(start + len - 1, true);

        self.cursor = start + len;
        self.last_quotient = Some(quotient);
        self.last_hash = Some(hash);
        self.nelts = self.nelts.saturating_add(count);
        self.ndistinct += 1;
        self.nused += len;
        Ok(())
    }

    pub fn finish(self) {
        let blocks = self.cqf.blocks();
        blocks.rebuild_offsets(1, blocks.num_blocks() - 1);
        let counters = &self.cqf.counters;
        counters.nelts.store(self.nelts, Ordering::Relaxed);
        counters.ndistinct_elts.store(self.ndistinct, Ordering::Relaxed);
        counters.noccupied_slots.store(self.noccupied, Ordering::Relaxed);
        counters.nused_slots.store(self.nused, Ordering::Relaxed);
        self.cqf.write_header();
    }
}

/// Record combinators over hash-ordered streams.
pub struct CqfMerge;

impl CqfMerge {
    /// Writes the union of two streams into `out`, summing the counts of
    /// records present in both.
    pub fn merge(
        iter_a: impl Iterator<Item = Record>,
        iter_b: impl Iterator<Item = Record>,
        out: &mut Cqf,
    ) -> Result<()> {
        Self::merge_by(iter_a, iter_b, out, |a, b| match (a, b) {
            (Some(a), Some(b)) => Some((a.count.saturating_add(b.count), a.tag.max(b.tag))),
            (Some(r), None) | (None, Some(r)) => Some((r.count, r.tag)),
            (None, None) => None,
        })
    }

    /// Walks both streams and writes whatever `combine` returns for each
    /// hash as `(count, tag)`. On error `out` is left empty.
    pub fn merge_by<F>(
        iter_a: impl Iterator<Item = Record>,
        iter_b: impl Iterator<Item = Record>,
        out: &mut Cqf,
        mut combine: F,
    ) -> Result<()>
    where
        F: FnMut(Option<Record>, Option<Record>) -> Option<(u64, u64)>,
    {
        let mut appender = Appender::new(out)?;
        let mut failure = None;
        for (a, b) in MergeWalk::new(iter_a, iter_b) {
            let Some(hash) = a.or(b).map(|r| r.hash) else {
                continue;
            };
            if let Some((count, tag)) = combine(a, b) {
                if let Err(err) = appender.push(hash, tag, count) {
                    failure = Some(err);
                    break;
                }
            }
        }
        appender.finish();
        if let Some(err) = failure {
            out.reset();
            return Err(err);
        }
        Ok(())
    }

    /// k-way union.
    pub fn multi_merge<I: Iterator<Item = Record>>(inputs: Vec<I>, out: &mut Cqf) -> Result<()> {
        let mut inputs: Vec<_> = inputs.into_iter().map(Iterator::peekable).collect();
        let mut appender = Appender::new(out)?;
        let mut failure = None;
        loop {
            let Some(hash) = inputs
                .iter_mut()
                .filter_map(|it| it.peek().map(|r| r.hash))
                .min()
            else {
                break;
            };
            let mut count = 0u64;
            let mut tag = 0;
            for input in inputs.iter_mut() {
                if let Some(record) = input.next_if(|r| r.hash == hash) {
                    count = count.saturating_add(record.count);
                    tag = tag.max(record.tag);
                }
            }
            if let Err(err) = appender.push(hash, tag, count) {
                failure = Some(err);
                break;
            }
        }
        appender.finish();
        if let Some(err) = failure {
            out.reset();
            return Err(err);
        }
        Ok(())
    }

    /// Sum over shared hashes of the product of their counts.
    pub fn inner_product(
        iter_a: impl Iterator<Item = Record>,
        iter_b: impl Iterator<Item = Record>,
    ) -> u64 {
        MergeWalk::new(iter_a, iter_b)
            .filter_map(|pair| match pair {
                (Some(a), Some(b)) => Some(a.count.saturating_mul(b.count)),
                _ => None,
            })
            .fold(0u64, u64::saturating_add)
    }
}

impl Cqf {
    fn check_compatible(&self, other: &Cqf) -> Result<()> {
        self.geometry.compatible_with(&other.geometry)
    }

    /// `out = a + b`, counts summed.
    pub fn merge(a: &Cqf, b: &Cqf, out: &mut Cqf) -> Result<()> {
        a.check_compatible(b)?;
        a.check_compatible(out)?;
        CqfMerge::merge(a.iter(), b.iter(), out)
    }

    pub fn multi_merge(inputs: &[&Cqf], out: &mut Cqf) -> Result<()> {
        for input in inputs {
            input.check_compatible(out)?;
        }
        CqfMerge::multi_merge(inputs.iter().map(|cqf| cqf.iter()).collect(), out)
    }

    /// Keys present in both, with the smaller of the two counts.
    pub fn intersect(a: &Cqf, b: &Cqf, out: &mut Cqf) -> Result<()> {
        a.check_compatible(b)?;
        a.check_compatible(out)?;
        CqfMerge::merge_by(a.iter(), b.iter(), out, |a, b| match (a, b) {
            (Some(a), Some(b)) => Some((a.count.min(b.count), a.tag)),
            _ => None,
        })
    }

    /// Counts of `a` minus counts of `b`; keys that drop to zero vanish.
    pub fn subtract(a: &Cqf, b: &Cqf, out: &mut Cqf) -> Result<()> {
        a.check_compatible(b)?;
        a.check_compatible(out)?;
        CqfMerge::merge_by(a.iter(), b.iter(), out, |a, b| match (a, b) {
            (Some(a), Some(b)) if a.count > b.count => Some((a.count - b.count, a.tag)),
            (Some(a), None) => Some((a.count, a.tag)),
            _ => None,
        })
    }

    pub fn inner_product(&self, other: &Cqf) -> Result<u64> {
        self.check_compatible(other)?;
        Ok(CqfMerge::inner_product(self.iter(), other.iter()))
    }

    /// Euclidean norm of the count vector.
    pub fn magnitude(&self) -> f64 {
        self.iter()
            .map(|r| (r.count as f64) * (r.count as f64))
            .sum::<f64>()
            .sqrt()
    }

    pub fn cosine_similarity(&self, other: &Cqf) -> Result<f64> {
        let dot = self.inner_product(other)? as f64;
        let norms = self.magnitude() * other.magnitude();
        if norms == 0.0 {
            return Ok(0.0);
        }
        Ok(dot / norms)
    }

    /// Builds a copy of the filter with `nslots` home slots, keeping every
    /// hash and count. `self` is never modified, so a failed resize leaves
    /// it fully usable. With `staging`, the filter is first written there
    /// and the copy is read back through a sequential mapping of that file.
    pub fn resize(&self, nslots: u64, residency: Residency, staging: Option<&Path>) -> Result<Cqf> {
        let params = CqfParams {
            nslots,
            residency,
            ..self.params()
        };
        params.geometry()?;
        let staged = match staging {
            Some(path) if self.path() == Some(path) => {
                self.sync()?;
                None
            }
            Some(path) => {
                self.serialize(path)?;
                info!(path = %path.display(), "staged filter for resize");
                Some(Cqf::open(path)?)
            }
            None => None,
        };
        let source = staged.as_ref().unwrap_or(self);
        source.storage.advise_sequential();
        let mut resized = Cqf::new(params)?;
        CqfMerge::merge(source.iter(), std::iter::empty(), &mut resized)?;
        info!(
            from = source.geometry.nslots,
            to = nslots,
            records = resized.ndistinct_elts(),
            "resized filter"
        );
        Ok(resized)
    }
}

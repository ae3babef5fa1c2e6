//! Region locks over the slot array.
//!
//! Slot positions are grouped into regions of `SLOTS_PER_LOCK` slots with one
//! mutex each. Writers take a contiguous range of regions in ascending order
//! and may only extend it upwards, so two writers can never wait on each other
//! in a cycle.

use crossbeam::utils::{Backoff, CachePadded};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::{CqfError, Result};

pub const SLOTS_PER_LOCK: u64 = 1 << 16;

/// How a mutating call synchronizes with other writers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockMode {
    /// Take region locks at all. Single-threaded callers can skip them.
    pub lock: bool,
    /// Busy-wait for a held lock instead of failing with `LockContended`.
    pub spin: bool,
}

impl LockMode {
    pub const NONE: LockMode = LockMode {
        lock: false,
        spin: false,
    };
    pub const SPIN: LockMode = LockMode {
        lock: true,
        spin: true,
    };
    pub const TRY: LockMode = LockMode {
        lock: true,
        spin: false,
    };
}

impl Default for LockMode {
    fn default() -> Self {
        LockMode::NONE
    }
}

#[derive(Default)]
struct WaitStats {
    hold_nanos: AtomicU64,
    spin_nanos: AtomicU64,
    acquisitions: AtomicU64,
    single_attempt: AtomicU64,
}

/// Snapshot of the contention counters of one region or of the whole table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LockStats {
    pub hold_nanos: u64,
    pub spin_nanos: u64,
    pub acquisitions: u64,
    pub single_attempt: u64,
}

impl std::ops::Add for LockStats {
    type Output = LockStats;

    fn add(self, rhs: LockStats) -> LockStats {
        LockStats {
            hold_nanos: self.hold_nanos + rhs.hold_nanos,
            spin_nanos: self.spin_nanos + rhs.spin_nanos,
            acquisitions: self.acquisitions + rhs.acquisitions,
            single_attempt: self.single_attempt + rhs.single_attempt,
        }
    }
}

#[derive(Default)]
struct RegionLock {
    mutex: Mutex<()>,
    stats: WaitStats,
}

pub struct LockTable {
    regions: Box<[CachePadded<RegionLock>]>,
}

impl LockTable {
    pub fn new(num_locks: usize) -> Self {
        let regions = (0..num_locks.max(1))
            .map(|_| CachePadded::new(RegionLock::default()))
            .collect();
        Self { regions }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn region_of(&self, position: u64) -> usize {
        ((position / SLOTS_PER_LOCK) as usize).min(self.regions.len() - 1)
    }

    /// Locks regions `first..=last`.
    pub fn lock_range(&self, first: usize, last: usize, spin: bool) -> Result<RegionGuard<'_>> {
        let mut guard = RegionGuard {
            table: self,
            held: Vec::with_capacity(last.saturating_sub(first) + 1),
            spin,
            next: first.min(self.regions.len() - 1),
        };
        guard.extend_to(last)?;
        Ok(guard)
    }

    fn acquire(&self, region: usize, spin: bool) -> Result<MutexGuard<'_, ()>> {
        let lock = &self.regions[region];
        if let Some(guard) = lock.mutex.try_lock() {
            lock.stats.acquisitions.fetch_add(1, Ordering::Relaxed);
            lock.stats.single_attempt.fetch_add(1, Ordering::Relaxed);
            return Ok(guard);
        }
        if !spin {
            return Err(CqfError::LockContended { region });
        }
        let start = Instant::now();
        let backoff = Backoff::new();
        loop {
            backoff.snooze();
            if let Some(guard) = lock.mutex.try_lock() {
                lock.stats
                    .spin_nanos
                    .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
                lock.stats.acquisitions.fetch_add(1, Ordering::Relaxed);
                return Ok(guard);
            }
        }
    }

    pub fn stats(&self, region: usize) -> LockStats {
        let stats = &self.regions[region].stats;
        LockStats {
            hold_nanos: stats.hold_nanos.load(Ordering::Relaxed),
            spin_nanos: stats.spin_nanos.load(Ordering::Relaxed),
            acquisitions: stats.acquisitions.load(Ordering::Relaxed),
            single_attempt: stats.single_attempt.load(Ordering::Relaxed),
        }
    }

    pub fn total_stats(&self) -> LockStats {
        (0..self.regions.len())
            .map(|region| self.stats(region))
            .fold(LockStats::default(), |acc, s| acc + s)
    }
}

/// A held, upward-extensible range of region locks.
pub struct RegionGuard<'a> {
    table: &'a LockTable,
    held: Vec<(usize, MutexGuard<'a, ()>, Instant)>,
    spin: bool,
    next: usize,
}

impl RegionGuard<'_> {
    /// Highest region currently held.
    pub fn last(&self) -> Option<usize> {
        self.held.last().map(|(region, _, _)| *region)
    }

    /// Acquires every region up to and including `last` not yet held.
    pub fn extend_to(&mut self, last: usize) -> Result<()> {
        let last = last.min(self.table.regions.len() - 1);
        while self.next <= last {
            let guard = self.table.acquire(self.next, self.spin)?;
            self.held.push((self.next, guard, Instant::now()));
            self.next += 1;
        }
        Ok(())
    }
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        for (region, _, since) in &self.held {
            self.table.regions[*region]
                .stats
                .hold_nanos
                .fetch_add(since.elapsed().as_nanos() as u64, Ordering::Relaxed);
        }
    }
}

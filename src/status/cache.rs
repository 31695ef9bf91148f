//! Status cache — copy-on-write snapshot of the fleet's last known state.
//!
//! Readers grab an `Arc<CacheSnapshot>` and read without holding any lock.
//! Every write (scan commit, invalidation, roster change) builds a new
//! snapshot and swaps it in under a short write lock, so a reader never sees
//! half of one cycle and half of another.
//!
//! Each entry carries an epoch. Invalidation gives the entry a fresh epoch;
//! a scan result staged against the old epoch is then discarded at commit.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

use super::{DeviceStatus, Stats, StatusEntry, StatusFilter};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("serial not in fleet: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone)]
struct Slot {
    entry: StatusEntry,
    epoch: u64,
}

/// An immutable view of the cache as of one write.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    slots: Vec<Slot>,
    index: HashMap<String, usize>,
    last_updated: Option<DateTime<Utc>>,
}

impl CacheSnapshot {
    pub fn get(&self, serial: &str) -> Option<&StatusEntry> {
        self.index.get(serial).map(|&i| &self.slots[i].entry)
    }

    pub fn status_of(&self, serial: &str) -> Option<DeviceStatus> {
        self.get(serial).map(|e| e.status)
    }

    /// Entries in roster order.
    pub fn entries(&self) -> impl Iterator<Item = &StatusEntry> {
        self.slots.iter().map(|s| &s.entry)
    }

    pub fn list(&self, filter: StatusFilter) -> Vec<StatusEntry> {
        self.entries().filter(|e| filter.matches(e.status)).cloned().collect()
    }

    pub fn stats(&self) -> Stats {
        Stats::tally(self.entries().map(|e| e.status))
    }

    /// Completion time of the last committed cycle.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn reindex(&mut self) {
        self.index = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.entry.serial.clone(), i))
            .collect();
    }
}

/// A serial to probe this cycle, tagged with the epoch it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleTarget {
    pub serial: String,
    pub epoch: u64,
}

/// One probe result waiting for the cycle commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedResult {
    pub serial: String,
    pub epoch: u64,
    pub status: DeviceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitSummary {
    pub applied: usize,
    /// Results dropped because the serial left the roster or was invalidated.
    pub stale: usize,
}

pub struct StatusCache {
    current: RwLock<Arc<CacheSnapshot>>,
    next_epoch: AtomicU64,
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCache {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(CacheSnapshot::default())),
            next_epoch: AtomicU64::new(1),
        }
    }

    /// A cache whose roster is `serials`, all Unknown.
    pub fn with_roster(serials: &[String]) -> Self {
        let cache = Self::new();
        cache.sync_roster(serials);
        cache
    }

    fn read(&self) -> RwLockReadGuard<'_, Arc<CacheSnapshot>> {
        self.current.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arc<CacheSnapshot>> {
        self.current.write().unwrap_or_else(|e| e.into_inner())
    }

    fn fresh_epoch(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::Relaxed)
    }

    // ── Reads ──

    /// The current snapshot. Hold on to it to make several consistent reads.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        Arc::clone(&self.read())
    }

    pub fn get(&self, serial: &str) -> Result<StatusEntry, CacheError> {
        self.snapshot()
            .get(serial)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(serial.to_string()))
    }

    pub fn list(&self, filter: StatusFilter) -> Vec<StatusEntry> {
        self.snapshot().list(filter)
    }

    pub fn aggregate_stats(&self) -> Stats {
        self.snapshot().stats()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.snapshot().last_updated()
    }

    // ── Writes ──

    /// Reset one entry to Unknown. Visible to readers immediately.
    pub fn invalidate(&self, serial: &str) -> Result<(), CacheError> {
        let epoch = self.fresh_epoch();
        let mut guard = self.write();
        let idx = *guard
            .index
            .get(serial)
            .ok_or_else(|| CacheError::NotFound(serial.to_string()))?;

        let mut next = CacheSnapshot::clone(&guard);
        let slot = &mut next.slots[idx];
        slot.entry.status = DeviceStatus::Unknown;
        slot.entry.last_checked_at = None;
        slot.epoch = epoch;
        *guard = Arc::new(next);

        tracing::debug!(serial = %serial, "Status invalidated");
        Ok(())
    }

    /// Make the roster exactly `serials` (first occurrence wins, order kept).
    /// Known serials keep their state; new ones start Unknown.
    pub fn sync_roster(&self, serials: &[String]) {
        self.sync_roster_from(|| serials.to_vec());
    }

    /// Like [`sync_roster`](Self::sync_roster), but `roster` is read while
    /// the write lock is held, so concurrent syncs always settle on the
    /// latest roster.
    pub fn sync_roster_from(&self, roster: impl FnOnce() -> Vec<String>) {
        let mut guard = self.write();
        let serials = roster();
        let mut next = CacheSnapshot {
            slots: Vec::with_capacity(serials.len()),
            index: HashMap::with_capacity(serials.len()),
            last_updated: guard.last_updated,
        };

        for serial in &serials {
            if serial.is_empty() || next.index.contains_key(serial) {
                continue;
            }
            let slot = match guard.index.get(serial) {
                Some(&i) => guard.slots[i].clone(),
                None => Slot {
                    entry: StatusEntry {
                        serial: serial.clone(),
                        status: DeviceStatus::Unknown,
                        last_checked_at: None,
                    },
                    epoch: self.fresh_epoch(),
                },
            };
            next.index.insert(serial.clone(), next.slots.len());
            next.slots.push(slot);
        }

        let (added, removed) = roster_delta(&guard, &next);
        if added > 0 || removed > 0 {
            tracing::info!(added, removed, total = next.slots.len(), "Fleet roster updated");
        }
        next.reindex();
        *guard = Arc::new(next);
    }

    /// Serials to probe, with the epochs results must match to be applied.
    pub fn targets(&self) -> Vec<CycleTarget> {
        self.snapshot()
            .slots
            .iter()
            .map(|s| CycleTarget { serial: s.entry.serial.clone(), epoch: s.epoch })
            .collect()
    }

    /// Apply a whole cycle's results in one swap.
    pub fn commit(&self, results: &[StagedResult], finished_at: DateTime<Utc>) -> CommitSummary {
        let mut guard = self.write();
        let mut next = CacheSnapshot::clone(&guard);
        let mut summary = CommitSummary::default();

        for result in results {
            match next.index.get(&result.serial) {
                Some(&i) if next.slots[i].epoch == result.epoch => {
                    let entry = &mut next.slots[i].entry;
                    entry.status = result.status;
                    entry.last_checked_at = Some(finished_at);
                    summary.applied += 1;
                }
                _ => summary.stale += 1,
            }
        }
        next.last_updated = Some(finished_at);
        *guard = Arc::new(next);
        summary
    }
}

fn roster_delta(old: &CacheSnapshot, new: &CacheSnapshot) -> (usize, usize) {
    let added = new.index.keys().filter(|s| !old.index.contains_key(*s)).count();
    let removed = old.index.keys().filter(|s| !new.index.contains_key(*s)).count();
    (added, removed)
}

//! Dirty-flag cache of derived aggregates.
//!
//! Entries are flagged stale by the mutation path and recomputed lazily on
//! the next read, so a burst of mutations pays the recomputation cost once.
//! Entries are never removed — only flagged — to avoid reallocation churn.
//! Recomputation is a pure function of repository state.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::repository::{patient, visit};
use crate::db::StoreResult;

/// Identity of a cached aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatKey {
    TotalPatients,
    TotalVisits,
    /// Visit count for a single calendar day.
    VisitsOn(NaiveDate),
}

#[derive(Debug, Default)]
struct CachedStat {
    value: i64,
    dirty: bool,
    recomputes: u64,
}

/// Keyed aggregate cache. Sole owner of the dirty flags: the store facade
/// invalidates through it and reads through it, nothing else touches them.
#[derive(Debug, Default)]
pub struct StatsCache {
    entries: Mutex<HashMap<StatKey, CachedStat>>,
}

impl StatsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached value if the entry is clean; otherwise recompute from the
    /// repository, store the result, clear the flag, and return it.
    ///
    /// The entry lock is held across recomputation so an interleaved
    /// invalidation cannot be lost between the read and the store. A failed
    /// recompute leaves the dirty flag set and propagates the error — it
    /// never reports zero.
    pub fn get(&self, conn: &Connection, key: StatKey) -> StoreResult<i64> {
        let mut entries = self.lock();
        if let Some(entry) = entries.get(&key) {
            if !entry.dirty {
                return Ok(entry.value);
            }
        }

        let value = recompute(conn, key)?;
        let entry = entries.entry(key).or_default();
        entry.value = value;
        entry.dirty = false;
        entry.recomputes += 1;
        Ok(value)
    }

    /// Flag the given stats stale. Never recomputes — that is strictly
    /// pull-driven from the next `get`. An entry that has never been read
    /// needs no flag; its first read computes it anyway.
    pub fn invalidate(&self, keys: &[StatKey]) {
        let mut entries = self.lock();
        for key in keys {
            if let Some(entry) = entries.get_mut(key) {
                entry.dirty = true;
            }
        }
    }

    /// How many times a stat has been recomputed. Test instrumentation for
    /// the no-redundant-recompute property.
    pub(crate) fn recompute_count(&self, key: StatKey) -> u64 {
        self.lock().get(&key).map(|e| e.recomputes).unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<StatKey, CachedStat>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn recompute(conn: &Connection, key: StatKey) -> StoreResult<i64> {
    match key {
        StatKey::TotalPatients => patient::count_patients(conn),
        StatKey::TotalVisits => visit::count_visits(conn),
        StatKey::VisitsOn(date) => visit::count_visits_on(conn, date),
    }
}

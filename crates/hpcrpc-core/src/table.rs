//! Breadcrumb table: concurrent map from call path to statistics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::breadcrumb::{BreadcrumbType, CallPathKey, Observation, StatsAggregate};

/// One entry of a [`Snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub stats: StatsAggregate,
    pub kind: BreadcrumbType,
    pub key: CallPathKey,
}

/// Detached copy of a breadcrumb table.
///
/// Later table updates never affect an already-taken snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub breadcrumbs: Vec<Breadcrumb>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.breadcrumbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breadcrumbs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Breadcrumb> {
        self.breadcrumbs.iter()
    }

    /// Finds the entry for a key and side.
    pub fn find(&self, key: &CallPathKey, kind: BreadcrumbType) -> Option<&Breadcrumb> {
        self.breadcrumbs
            .iter()
            .find(|b| b.key == *key && b.kind == kind)
    }
}

impl IntoIterator for Snapshot {
    type Item = Breadcrumb;
    type IntoIter = std::vec::IntoIter<Breadcrumb>;

    fn into_iter(self) -> Self::IntoIter {
        self.breadcrumbs.into_iter()
    }
}

/// Map of `(CallPathKey, BreadcrumbType)` to [`StatsAggregate`].
///
/// One mutex guards the whole map: every fold and every snapshot runs under
/// it, which makes them linearizable and keeps concurrent first touches of
/// the same key from creating two aggregates.
pub struct BreadcrumbTable {
    entries: Mutex<HashMap<(CallPathKey, BreadcrumbType), StatsAggregate>>,
    max_entries: Option<usize>,
    dropped: AtomicU64,
    overflow_logged: AtomicBool,
}

impl Default for BreadcrumbTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BreadcrumbTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreadcrumbTable")
            .field("len", &self.len())
            .field("max_entries", &self.max_entries)
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl BreadcrumbTable {
    /// Creates an unbounded table.
    pub fn new() -> Self {
        Self::with_max_entries(None)
    }

    /// Creates a table that stops admitting new keys past `max_entries`.
    pub fn with_max_entries(max_entries: Option<usize>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries,
            dropped: AtomicU64::new(0),
            overflow_logged: AtomicBool::new(false),
        }
    }

    // aggregates are plain numbers; a poisoned map is still readable
    fn lock(&self) -> MutexGuard<'_, HashMap<(CallPathKey, BreadcrumbType), StatsAggregate>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Folds one observation into the aggregate for `(key, kind)`, creating
    /// it on first touch. Returns false if the table is full and the key is new.
    pub fn update(&self, key: CallPathKey, kind: BreadcrumbType, obs: &Observation) -> bool {
        let mut entries = self.lock();
        if let Some(agg) = entries.get_mut(&(key, kind)) {
            agg.fold(obs);
            return true;
        }

        if let Some(max) = self.max_entries {
            if entries.len() >= max {
                drop(entries);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                if !self.overflow_logged.swap(true, Ordering::Relaxed) {
                    warn!(
                        max_entries = max,
                        call_path = key.call_path_id,
                        "breadcrumb table full, new call paths are no longer tracked"
                    );
                }
                return false;
            }
        }

        entries.insert((key, kind), StatsAggregate::from_observation(obs));
        true
    }

    /// Copies the current aggregate for one key, if present.
    pub fn get(&self, key: &CallPathKey, kind: BreadcrumbType) -> Option<StatsAggregate> {
        self.lock().get(&(*key, kind)).cloned()
    }

    /// Takes a detached, internally consistent copy of the whole table.
    pub fn snapshot(&self) -> Snapshot {
        let entries = self.lock();
        let breadcrumbs = entries
            .iter()
            .map(|((key, kind), stats)| Breadcrumb {
                stats: stats.clone(),
                kind: *kind,
                key: *key,
            })
            .collect();
        Snapshot { breadcrumbs }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Updates refused because the table was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

//! Cumulative counter tracking
//!
//! The stats feed reports network bytes and errors as monotonically
//! increasing totals. The tracker remembers the last total per
//! (group, entity) so each tick can write the per-interval difference.
//! State lives for the process only: a restart re-baselines every counter.

use dashmap::DashMap;
use std::collections::HashMap;
use tracing::debug;

/// Independent counter namespaces; the same entity can be tracked in several
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterGroup {
    /// Node rx+tx total for the last-known table, keyed by node name
    LastRealtimePerf,
    /// Node network vector, keyed by node name
    NodePerf,
    /// Pod network vector, keyed by pod id
    PodPerf,
    /// Per-interface pod network vector, keyed by `<podid>_<deviceid>`
    PodNet,
}

/// Last-seen cumulative vectors per (group, key)
#[derive(Debug, Default)]
pub struct CounterDeltaTracker {
    values: DashMap<(CounterGroup, String), Vec<i64>>,
}

impl CounterDeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, group: CounterGroup, key: &str) -> Option<Vec<i64>> {
        self.values
            .get(&(group, key.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn set(&self, group: CounterGroup, key: impl Into<String>, values: Vec<i64>) {
        self.values.insert((group, key.into()), values);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Start a batch of updates that only lands on `commit`
    pub fn stage(&self) -> StagedCounters<'_> {
        StagedCounters {
            tracker: self,
            pending: HashMap::new(),
            pruned: &[],
        }
    }
}

/// Counter updates belonging to one write transaction
///
/// Deltas are computed against the committed baselines, or against this
/// batch's own value when a key is advanced twice. Dropping the batch
/// without committing leaves the tracker untouched, so a rolled-back phase
/// does not lose the interval it failed to write.
#[must_use = "staged counters are discarded unless committed"]
pub struct StagedCounters<'a> {
    tracker: &'a CounterDeltaTracker,
    pending: HashMap<(CounterGroup, String), Vec<i64>>,
    pruned: &'static [CounterGroup],
}

impl StagedCounters<'_> {
    /// Evict, on commit, keys of `groups` this batch did not advance
    ///
    /// Only for batches that see every live entity of those groups.
    pub fn pruning(mut self, groups: &'static [CounterGroup]) -> Self {
        self.pruned = groups;
        self
    }

    /// Delta of `current` against the latest baseline; stages `current`
    pub fn advance(&mut self, group: CounterGroup, key: impl Into<String>, current: Vec<i64>) -> Vec<i64> {
        let slot = (group, key.into());
        let result = match self.pending.get(&slot) {
            Some(staged) => delta(&current, Some(staged)),
            None => delta(&current, self.tracker.get(group, &slot.1).as_deref()),
        };
        self.pending.insert(slot, current);
        result
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn commit(self) {
        if !self.pruned.is_empty() {
            let before = self.tracker.len();
            self.tracker
                .values
                .retain(|slot, _| !self.pruned.contains(&slot.0) || self.pending.contains_key(slot));
            let evicted = before.saturating_sub(self.tracker.len());
            if evicted > 0 {
                debug!(evicted, "Dropped baselines of vanished entities");
            }
        }
        for ((group, key), values) in self.pending {
            self.tracker.set(group, key, values);
        }
    }
}

/// Component-wise `current - previous`
///
/// Zero vector without a (same-length) baseline. A component that went
/// backwards is a counter reset and yields 0.
pub fn delta(current: &[i64], previous: Option<&[i64]>) -> Vec<i64> {
    match previous {
        Some(previous) if previous.len() == current.len() => current
            .iter()
            .zip(previous)
            .map(|(now, before)| (now - before).max(0))
            .collect(),
        _ => vec![0; current.len()],
    }
}

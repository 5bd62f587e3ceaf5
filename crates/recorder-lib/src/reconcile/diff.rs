//! Live-versus-stored diff for one reference kind

use crate::store::StoredRef;
use std::collections::BTreeMap;

/// What one kind's pass has to write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan<K> {
    /// Live keys with no stored row at all
    pub new: Vec<K>,
    /// Enabled rows whose key left the snapshot
    pub vanished: Vec<i64>,
    /// Newest disabled row of a live key that has no enabled row
    pub revived: Vec<i64>,
}

impl<K> Plan<K> {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.vanished.is_empty() && self.revived.is_empty()
    }
}

#[derive(Default)]
struct Slot {
    enabled: bool,
    newest_disabled: Option<i64>,
    enabled_ids: Vec<i64>,
}

pub fn plan<K: Ord + Clone, T>(live: &BTreeMap<K, T>, stored: &[StoredRef<K>]) -> Plan<K> {
    let mut slots: BTreeMap<&K, Slot> = BTreeMap::new();
    for row in stored {
        let slot = slots.entry(&row.key).or_default();
        if row.enabled {
            slot.enabled = true;
            slot.enabled_ids.push(row.id);
        } else {
            slot.newest_disabled = Some(slot.newest_disabled.map_or(row.id, |id| id.max(row.id)));
        }
    }

    let mut result = Plan {
        new: Vec::new(),
        vanished: Vec::new(),
        revived: Vec::new(),
    };

    for key in live.keys() {
        match slots.get(&key) {
            None => result.new.push(key.clone()),
            Some(slot) if !slot.enabled => result.revived.extend(slot.newest_disabled),
            Some(_) => {}
        }
    }

    for (key, slot) in slots {
        if !live.contains_key(key) {
            result.vanished.extend(slot.enabled_ids);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(id: i64, key: &str, enabled: bool) -> StoredRef<String> {
        StoredRef {
            id,
            key: key.to_string(),
            enabled,
        }
    }

    fn live(keys: &[&str]) -> BTreeMap<String, ()> {
        keys.iter().map(|k| (k.to_string(), ())).collect()
    }

    #[test]
    fn test_plan_splits_new_and_vanished() {
        let rows = vec![stored(1, "a", true), stored(2, "b", true)];
        let plan = plan(&live(&["b", "c"]), &rows);

        assert_eq!(plan.new, vec!["c".to_string()]);
        assert_eq!(plan.vanished, vec![1]);
        assert!(plan.revived.is_empty());
    }

    #[test]
    fn test_unchanged_snapshot_plans_nothing() {
        let rows = vec![stored(1, "a", true), stored(2, "b", false)];
        let plan = plan(&live(&["a"]), &rows);

        assert!(plan.is_empty());
    }

    #[test]
    fn test_disabled_key_is_revived_not_inserted() {
        let rows = vec![stored(3, "a", false), stored(7, "a", false)];
        let plan = plan(&live(&["a"]), &rows);

        assert!(plan.new.is_empty());
        assert_eq!(plan.revived, vec![7]);
    }

    #[test]
    fn test_disabled_rows_are_not_disabled_again() {
        let rows = vec![stored(1, "gone", false)];
        let plan = plan(&live(&[]), &rows);

        assert!(plan.vanished.is_empty());
    }
}

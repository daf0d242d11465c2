use std::collections::{BTreeMap, BTreeSet};

/// A cache whose changes since `begin` can be undone.
///
/// Caches journal the prior state of each entry the first time a transaction
/// touches it, so undoing costs what the transaction changed rather than what
/// the cache holds. Outside a transaction nothing is journaled.
pub trait Transactional {
    fn begin(&mut self);
    fn commit(&mut self);
    fn rollback(&mut self);
}

/// Prior values of the map entries (or set members) touched since `begin`.
/// `None` marks an entry that did not exist.
#[derive(Clone, Debug)]
pub struct UndoLog<K, V> {
    entries: Option<BTreeMap<K, Option<V>>>,
}

impl<K, V> Default for UndoLog<K, V> {
    fn default() -> Self {
        Self { entries: None }
    }
}

impl<K: Ord + Clone, V: Clone> UndoLog<K, V> {
    pub fn begin(&mut self) {
        self.entries = Some(BTreeMap::new());
    }

    pub fn commit(&mut self) {
        self.entries = None;
    }

    pub fn is_open(&self) -> bool {
        self.entries.is_some()
    }

    /// Remembers the value `key` has in `map` now, unless it was already
    /// journaled by this transaction.
    pub fn record(&mut self, map: &BTreeMap<K, V>, key: &K) {
        if let Some(entries) = self.entries.as_mut() {
            if !entries.contains_key(key) {
                entries.insert(key.clone(), map.get(key).cloned());
            }
        }
    }

    /// Journals every entry of `map`; used before the map is cleared.
    pub fn record_all(&mut self, map: &BTreeMap<K, V>) {
        if !self.is_open() {
            return;
        }
        for key in map.keys() {
            self.record(map, key);
        }
    }

    /// Puts every journaled entry back and closes the log.
    pub fn rollback(&mut self, map: &mut BTreeMap<K, V>) {
        for (key, prior) in self.entries.take().unwrap_or_default() {
            match prior {
                Some(value) => {
                    map.insert(key, value);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
    }
}

impl<K: Ord + Clone> UndoLog<K, ()> {
    /// Remembers whether `member` is in `set` now.
    pub fn record_member(&mut self, set: &BTreeSet<K>, member: &K) {
        if let Some(entries) = self.entries.as_mut() {
            if !entries.contains_key(member) {
                entries.insert(member.clone(), set.contains(member).then_some(()));
            }
        }
    }

    pub fn record_all_members(&mut self, set: &BTreeSet<K>) {
        if !self.is_open() {
            return;
        }
        for member in set {
            self.record_member(set, member);
        }
    }

    /// Journaled members with whether each was present before the
    /// transaction. Closes the log.
    pub fn take_members(&mut self) -> Vec<(K, bool)> {
        self.entries
            .take()
            .unwrap_or_default()
            .into_iter()
            .map(|(member, prior)| (member, prior.is_some()))
            .collect()
    }

    pub fn rollback_set(&mut self, set: &mut BTreeSet<K>) {
        for (member, was_present) in self.take_members() {
            if was_present {
                set.insert(member);
            } else {
                set.remove(&member);
            }
        }
    }
}

/// Scalar state saved whole at `begin`.
#[derive(Clone, Debug)]
pub struct Saved<T>(Option<T>);

impl<T> Default for Saved<T> {
    fn default() -> Self {
        Self(None)
    }
}

impl<T: Clone> Saved<T> {
    pub fn save(&mut self, value: &T) {
        self.0 = Some(value.clone());
    }

    pub fn discard(&mut self) {
        self.0 = None;
    }

    pub fn restore(&mut self, target: &mut T) {
        if let Some(value) = self.0.take() {
            *target = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_restores_only_touched_entries() {
        let mut map = BTreeMap::from([(1, "one"), (2, "two")]);
        let mut log = UndoLog::default();
        log.record(&map, &1);
        map.insert(1, "uno");
        log.begin();
        log.record(&map, &1);
        map.insert(1, "eins");
        log.record(&map, &1);
        map.insert(1, "un");
        log.record(&map, &3);
        map.insert(3, "three");
        log.rollback(&mut map);

        assert_eq!(map, BTreeMap::from([(1, "uno"), (2, "two")]));
        assert!(!log.is_open());
    }

    #[test]
    fn set_rollback_reinserts_and_removes_members() {
        let mut set = BTreeSet::from(["a", "b"]);
        let mut log = UndoLog::default();
        log.begin();
        log.record_all_members(&set);
        set.clear();
        log.record_member(&set, &"c");
        set.insert("c");
        log.rollback_set(&mut set);
        assert_eq!(set, BTreeSet::from(["a", "b"]));
    }

    #[test]
    fn committed_changes_stay() {
        let mut map = BTreeMap::new();
        let mut log: UndoLog<i32, i32> = UndoLog::default();
        log.begin();
        log.record(&map, &1);
        map.insert(1, 10);
        log.commit();
        log.rollback(&mut map);
        assert_eq!(map.get(&1), Some(&10));
    }
}

use crate::trie::StateTrie;
use itertools::Itertools;
use std::{
    collections::{BTreeMap, BTreeSet},
    ops::Bound,
};

/// What a [`StorageDiff`] knows about a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffValue<'a> {
    /// The diff does not touch the key.
    Unchanged,
    /// The diff deletes the key.
    Deleted,
    /// The diff writes the key.
    Upserted(&'a [u8]),
}

/// One transaction's worth of pending storage changes.
///
/// Writes and deletions are kept disjoint: a write drops the key from the deletions and
/// vice versa. Child-trie changes nest one diff per child key; deleting a child trie
/// records the child key in its own marker set (child keys and main-trie keys are
/// separate namespaces) and drops its pending changes, so a later write to the same
/// child starts from an empty trie.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageDiff {
    upserts: BTreeMap<Vec<u8>, Vec<u8>>,
    deletes: BTreeSet<Vec<u8>>,
    deleted_children: BTreeSet<Vec<u8>>,
    child_changes: BTreeMap<Vec<u8>, StorageDiff>,
}

impl StorageDiff {
    /// Creates an empty diff.
    pub const fn new() -> Self {
        Self {
            upserts: BTreeMap::new(),
            deletes: BTreeSet::new(),
            deleted_children: BTreeSet::new(),
            child_changes: BTreeMap::new(),
        }
    }

    /// A snapshot to push onto the transaction stack; committing the snapshot back
    /// replaces this diff wholesale.
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    /// What this diff knows about `key`.
    pub fn get(&self, key: &[u8]) -> DiffValue<'_> {
        if self.deletes.contains(key) {
            return DiffValue::Deleted;
        }
        match self.upserts.get(key) {
            Some(value) => DiffValue::Upserted(value),
            None => DiffValue::Unchanged,
        }
    }

    /// Records a write of `value` under `key`.
    pub fn upsert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.deletes.remove(&key);
        self.upserts.insert(key, value);
    }

    /// Records a deletion of `key`.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.upserts.remove(&key);
        self.deletes.insert(key);
    }

    /// Returns `true` if this diff deletes `key`.
    pub fn is_deleted(&self, key: &[u8]) -> bool {
        self.deletes.contains(key)
    }

    /// The pending writes, in key order.
    pub fn upserts(&self) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.upserts
    }

    /// The pending deletions, in key order.
    pub fn deletes(&self) -> &BTreeSet<Vec<u8>> {
        &self.deletes
    }

    /// The child tries scheduled for destruction, in child-key order.
    pub fn deleted_children(&self) -> &BTreeSet<Vec<u8>> {
        &self.deleted_children
    }

    /// Returns `true` if this diff schedules the child trie at `child_key` for
    /// destruction.
    pub fn is_child_deleted(&self, child_key: &[u8]) -> bool {
        self.deleted_children.contains(child_key)
    }

    /// The pending per-child diffs, in child-key order.
    pub fn child_diffs(&self) -> &BTreeMap<Vec<u8>, StorageDiff> {
        &self.child_changes
    }

    /// The pending diff of the child trie at `child_key`, if any.
    pub fn child(&self, child_key: &[u8]) -> Option<&StorageDiff> {
        self.child_changes.get(child_key)
    }

    /// Records a write into the child trie at `child_key`.
    pub fn upsert_child(&mut self, child_key: &[u8], key: Vec<u8>, value: Vec<u8>) {
        self.child_changes.entry(child_key.to_vec()).or_default().upsert(key, value);
    }

    /// Records a deletion from the child trie at `child_key`.
    pub fn delete_from_child(&mut self, child_key: &[u8], key: Vec<u8>) {
        self.child_changes.entry(child_key.to_vec()).or_default().delete(key);
    }

    /// Schedules destruction of the child trie at `child_key`, discarding its pending
    /// changes.
    pub fn delete_child(&mut self, child_key: &[u8]) {
        self.child_changes.remove(child_key);
        self.deleted_children.insert(child_key.to_vec());
    }

    /// The smallest key strictly greater than `key` in the merged view of `committed`
    /// (an ascending key list, with this diff's deletions masked) and the pending
    /// writes.
    pub fn next_key(&self, key: &[u8], committed: &[Vec<u8>]) -> Option<Vec<u8>> {
        let after = committed.partition_point(|k| k.as_slice() <= key);
        let committed_next =
            committed[after..].iter().find(|k| !self.deletes.contains(k.as_slice()));
        let overlay_next = self
            .upserts
            .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
            .map(|(k, _)| k)
            .next();

        match (committed_next, overlay_next) {
            (Some(a), Some(b)) => Some(a.min(b).clone()),
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        }
    }

    /// The keys starting with `prefix` in the merged view of `committed` (an ascending
    /// key list, with this diff's deletions masked) and the pending writes, ascending.
    pub fn keys_with_prefix(&self, prefix: &[u8], committed: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let committed_matching = committed
            .iter()
            .filter(|k| k.starts_with(prefix) && !self.deletes.contains(k.as_slice()))
            .cloned();
        let overlay_matching =
            self.upserts.keys().filter(|k| k.starts_with(prefix)).cloned().collect::<Vec<_>>();
        committed_matching.merge(overlay_matching).dedup().collect()
    }

    /// Deletes up to `limit` keys starting with `prefix` from the merged view of
    /// `committed` and the pending writes, by ascending key order.
    ///
    /// Returns the number of deleted keys and whether every matching key was deleted.
    pub fn clear_prefix(
        &mut self,
        prefix: &[u8],
        committed: &[Vec<u8>],
        limit: Option<u32>,
    ) -> (u32, bool) {
        let matching = self.keys_with_prefix(prefix, committed);
        let total = matching.len() as u32;
        let take = limit.map_or(total, |limit| limit.min(total));
        for key in matching.into_iter().take(take as usize) {
            self.delete(key);
        }
        (take, take == total)
    }

    /// [`clear_prefix`](Self::clear_prefix) against the child trie at `child_key`.
    /// `committed` lists the committed child keys.
    pub fn clear_prefix_in_child(
        &mut self,
        child_key: &[u8],
        prefix: &[u8],
        committed: &[Vec<u8>],
        limit: Option<u32>,
    ) -> (u32, bool) {
        self.child_changes.entry(child_key.to_vec()).or_default().clear_prefix(
            prefix,
            committed,
            limit,
        )
    }

    /// Deletes up to `limit` keys (all of them, and the child trie itself, when `limit`
    /// is `None`) from the merged view of the child trie at `child_key`, by ascending
    /// key order. `committed_keys` lists the committed child keys.
    pub fn delete_child_limit(
        &mut self,
        child_key: &[u8],
        committed_keys: &[Vec<u8>],
        limit: Option<u32>,
    ) -> (u32, bool) {
        let (live_committed, overlay): (Vec<Vec<u8>>, Vec<Vec<u8>>) =
            match self.child_changes.get(child_key) {
                Some(diff) => (
                    committed_keys
                        .iter()
                        .filter(|k| !diff.deletes.contains(k.as_slice()))
                        .cloned()
                        .collect(),
                    diff.upserts.keys().cloned().collect(),
                ),
                None => (committed_keys.to_vec(), Vec::new()),
            };
        let merged: Vec<Vec<u8>> = live_committed.into_iter().merge(overlay).dedup().collect();
        let total = merged.len() as u32;

        match limit {
            None => {
                self.delete_child(child_key);
                (total, true)
            }
            Some(limit) => {
                let take = limit.min(total);
                let entry = self.child_changes.entry(child_key.to_vec()).or_default();
                for key in merged.into_iter().take(take as usize) {
                    entry.delete(key);
                }
                (take, take == total)
            }
        }
    }

    /// Flushes the cumulative diff into the committed state.
    ///
    /// Order matters: main writes and deletions, then child-trie destructions, then
    /// child writes, so a child deleted and re-written within the same transaction ends
    /// up holding exactly the re-written keys.
    pub(crate) fn apply_to_state(self, state: &mut StateTrie) {
        let Self { upserts, deletes, deleted_children, child_changes } = self;

        for (key, value) in upserts {
            state.insert(&key, value);
        }
        for key in deletes {
            state.remove(&key);
        }
        for child_key in deleted_children {
            state.remove_child(&child_key);
        }
        for (child_key, child_diff) in child_changes {
            let StorageDiff { upserts, deletes, .. } = child_diff;
            for (key, value) in upserts {
                state.set_child_value(&child_key, &key, value);
            }
            if let Some(child) = state.child_trie_mut(&child_key) {
                for key in deletes {
                    child.remove(&key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upserts_and_deletes_stay_disjoint() {
        let mut diff = StorageDiff::new();
        diff.upsert(b"a".to_vec(), b"1".to_vec());
        diff.delete(b"a".to_vec());
        assert_eq!(diff.get(b"a"), DiffValue::Deleted);
        assert!(diff.upserts().is_empty());

        diff.upsert(b"a".to_vec(), b"2".to_vec());
        assert_eq!(diff.get(b"a"), DiffValue::Upserted(b"2"));
        assert!(diff.deletes().is_empty());
    }

    #[test]
    fn next_key_merges_committed_and_overlay() {
        let committed = vec![b"b".to_vec(), b"d".to_vec(), b"f".to_vec()];
        let mut diff = StorageDiff::new();
        diff.upsert(b"c".to_vec(), b"1".to_vec());
        diff.delete(b"d".to_vec());

        assert_eq!(diff.next_key(b"a", &committed), Some(b"b".to_vec()));
        assert_eq!(diff.next_key(b"b", &committed), Some(b"c".to_vec()));
        // "d" is deleted in the overlay, so "c" skips straight to "f".
        assert_eq!(diff.next_key(b"c", &committed), Some(b"f".to_vec()));
        assert_eq!(diff.next_key(b"f", &committed), None);
    }

    #[test]
    fn clear_prefix_counts_merged_matches() {
        let committed = vec![b"p01".to_vec(), b"p03".to_vec(), b"q01".to_vec()];
        let mut diff = StorageDiff::new();
        diff.upsert(b"p02".to_vec(), b"1".to_vec());

        let (deleted, all) = diff.clear_prefix(b"p", &committed, Some(2));
        assert_eq!((deleted, all), (2, false));
        // Ascending order: p01 (committed) and p02 (overlay) went first.
        assert!(diff.is_deleted(b"p01"));
        assert_eq!(diff.get(b"p02"), DiffValue::Deleted);
        assert_eq!(diff.get(b"p03"), DiffValue::Unchanged);

        let (deleted, all) = diff.clear_prefix(b"p", &committed, None);
        assert_eq!((deleted, all), (1, true));
        assert!(diff.is_deleted(b"p03"));
    }

    #[test]
    fn delete_child_discards_pending_child_changes() {
        let mut diff = StorageDiff::new();
        diff.upsert_child(b"c", b"k".to_vec(), b"v".to_vec());
        diff.delete_child(b"c");

        assert!(diff.child(b"c").is_none());
        assert!(diff.is_child_deleted(b"c"));
        // The child key never leaks into the main-trie deletions.
        assert!(!diff.is_deleted(b"c"));

        // A write after the deletion recreates the child from scratch.
        diff.upsert_child(b"c", b"k2".to_vec(), b"v2".to_vec());
        assert_eq!(diff.child(b"c").unwrap().get(b"k2"), DiffValue::Upserted(b"v2"));
        assert_eq!(diff.child(b"c").unwrap().get(b"k"), DiffValue::Unchanged);
    }

    #[test]
    fn delete_child_limit_spans_committed_and_overlay() {
        let committed = vec![b"a".to_vec(), b"c".to_vec()];
        let mut diff = StorageDiff::new();
        diff.upsert_child(b"child", b"b".to_vec(), b"1".to_vec());

        let (deleted, all) = diff.delete_child_limit(b"child", &committed, Some(2));
        assert_eq!((deleted, all), (2, false));
        let child = diff.child(b"child").unwrap();
        assert!(child.is_deleted(b"a"));
        assert_eq!(child.get(b"b"), DiffValue::Deleted);

        let (deleted, all) = diff.delete_child_limit(b"child", &committed, None);
        assert_eq!((deleted, all), (1, true));
        assert!(diff.is_child_deleted(b"child"));
    }
}

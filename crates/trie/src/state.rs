use crate::{
    diff::{DiffValue, StorageDiff},
    trie::StateTrie,
    TrieCache, TrieError,
};
use parking_lot::RwLock;
use rivet_primitives::{blake2_256, Hash256, CODE_KEY};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};
use tracing::trace;

/// The transactional state a block executes against.
///
/// Reads and writes go through the innermost open [`StorageDiff`], falling back to the
/// committed [`StateTrie`]. [`start_transaction`](Self::start_transaction) pushes a
/// snapshot of the innermost diff; committing pops it back over its parent, and the
/// outermost commit flushes into the committed state. Sorted-key mirrors of the
/// committed tries keep `next_key` and prefix deletion off the trie walk while
/// transactions are open.
///
/// All operations are internally locked: reads share, mutations exclude, and no lock is
/// ever held across a call into caller-supplied code. The transaction stack itself has a
/// single logical owner, the task executing the block.
#[derive(Debug)]
pub struct TrieState {
    inner: RwLock<Inner>,
    cache: Arc<TrieCache>,
}

#[derive(Debug)]
struct Inner {
    state: StateTrie,
    snapshot: StateTrie,
    transactions: Vec<StorageDiff>,
    sorted_keys: Vec<Vec<u8>>,
    child_sorted_keys: HashMap<Vec<u8>, Vec<Vec<u8>>>,
}

impl Inner {
    /// Flushes the outermost transaction into the committed state, keeping the
    /// sorted-key mirrors in step.
    fn apply(&mut self, diff: StorageDiff) {
        for key in diff.upserts().keys() {
            insert_sorted(&mut self.sorted_keys, key);
        }
        for key in diff.deletes() {
            remove_sorted(&mut self.sorted_keys, key);
        }
        for child_key in diff.deleted_children() {
            self.child_sorted_keys.remove(child_key);
        }
        for (child_key, child_diff) in diff.child_diffs() {
            let keys = self.child_sorted_keys.entry(child_key.clone()).or_default();
            for key in child_diff.upserts().keys() {
                insert_sorted(keys, key);
            }
            for key in child_diff.deletes() {
                remove_sorted(keys, key);
            }
        }
        diff.apply_to_state(&mut self.state);
    }

    /// The committed keys of the child trie at `child_key` as seen through `tx`: empty
    /// when the transaction schedules the child for destruction.
    fn committed_child_keys(&self, tx: &StorageDiff, child_key: &[u8]) -> &[Vec<u8>] {
        if tx.is_child_deleted(child_key) {
            return &[];
        }
        self.child_sorted_keys.get(child_key).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl TrieState {
    /// Creates a state over `initial`, sharing `cache` with other instances.
    pub fn new(initial: StateTrie, cache: Arc<TrieCache>) -> Self {
        let sorted_keys: Vec<Vec<u8>> =
            initial.entries().into_iter().map(|(key, _)| key).collect();
        let child_sorted_keys = initial
            .children()
            .map(|(child_key, child)| {
                (child_key.clone(), child.entries().into_iter().map(|(key, _)| key).collect())
            })
            .collect();
        let snapshot = initial.clone();
        Self {
            inner: RwLock::new(Inner {
                state: initial,
                snapshot,
                transactions: Vec::new(),
                sorted_keys,
                child_sorted_keys,
            }),
            cache,
        }
    }

    /// Begins a new nested storage transaction, to be either committed or rolled back.
    pub fn start_transaction(&self) {
        let mut inner = self.inner.write();
        let snapshot = inner.transactions.last().map(StorageDiff::snapshot).unwrap_or_default();
        inner.transactions.push(snapshot);
        trace!(target: "trie", depth = inner.transactions.len(), "storage transaction started");
    }

    /// Discards all storage changes made since the matching
    /// [`start_transaction`](Self::start_transaction).
    ///
    /// # Panics
    ///
    /// Panics if no transaction is open.
    pub fn rollback_transaction(&self) {
        let mut inner = self.inner.write();
        inner.transactions.pop().expect("no storage transaction to roll back");
        trace!(target: "trie", depth = inner.transactions.len(), "storage transaction rolled back");
    }

    /// Commits all storage changes made since the matching
    /// [`start_transaction`](Self::start_transaction) into the enclosing transaction, or
    /// into the committed state if none encloses it.
    ///
    /// # Panics
    ///
    /// Panics if no transaction is open.
    pub fn commit_transaction(&self) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let diff = inner.transactions.pop().expect("no storage transaction to commit");
        match inner.transactions.last_mut() {
            // The popped diff started as a snapshot of its parent and accumulated
            // changes on top, so committing replaces the parent wholesale.
            Some(parent) => *parent = diff,
            None => inner.apply(diff),
        }
        trace!(target: "trie", depth = inner.transactions.len(), "storage transaction committed");
    }

    /// The number of open storage transactions.
    pub fn transaction_depth(&self) -> usize {
        self.inner.read().transactions.len()
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let inner = self.inner.read();
        if let Some(tx) = inner.transactions.last() {
            match tx.get(key) {
                DiffValue::Upserted(value) => return Some(value.to_vec()),
                DiffValue::Deleted => return None,
                DiffValue::Unchanged => {}
            }
        }
        inner.state.get(key).map(<[u8]>::to_vec)
    }

    /// Returns `true` if a value is stored under `key`.
    pub fn has(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Stores `value` under `key`.
    pub fn put(&self, key: &[u8], value: Vec<u8>) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        match inner.transactions.last_mut() {
            Some(tx) => tx.upsert(key.to_vec(), value),
            None => {
                inner.state.insert(key, value);
                insert_sorted(&mut inner.sorted_keys, key);
            }
        }
    }

    /// Deletes `key`.
    pub fn delete(&self, key: &[u8]) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        match inner.transactions.last_mut() {
            Some(tx) => tx.delete(key.to_vec()),
            None => {
                inner.state.remove(key);
                remove_sorted(&mut inner.sorted_keys, key);
            }
        }
    }

    /// The smallest key strictly greater than `key`, considering all open overlays.
    pub fn next_key(&self, key: &[u8]) -> Option<Vec<u8>> {
        let inner = self.inner.read();
        match inner.transactions.last() {
            Some(tx) => tx.next_key(key, &inner.sorted_keys),
            None => inner.state.next_key(key),
        }
    }

    /// Deletes every key starting with `prefix`.
    pub fn clear_prefix(&self, prefix: &[u8]) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        match inner.transactions.last_mut() {
            Some(tx) => {
                let _ = tx.clear_prefix(prefix, &inner.sorted_keys, None);
            }
            None => {
                inner.state.clear_prefix_limit(prefix, None);
                remove_sorted_prefix(&mut inner.sorted_keys, prefix, None);
            }
        }
    }

    /// Deletes up to `limit` keys starting with `prefix`, by ascending key order.
    ///
    /// Returns the number of deleted keys and whether every matching key was deleted.
    pub fn clear_prefix_limit(&self, prefix: &[u8], limit: u32) -> (u32, bool) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        match inner.transactions.last_mut() {
            Some(tx) => tx.clear_prefix(prefix, &inner.sorted_keys, Some(limit)),
            None => {
                let (deleted, all) = inner.state.clear_prefix_limit(prefix, Some(limit));
                remove_sorted_prefix(&mut inner.sorted_keys, prefix, Some(deleted));
                (deleted, all)
            }
        }
    }

    /// Stores `value` under `key` in the child trie at `child_key`, creating the child
    /// trie if absent.
    pub fn set_child_storage(&self, child_key: &[u8], key: &[u8], value: Vec<u8>) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        match inner.transactions.last_mut() {
            Some(tx) => tx.upsert_child(child_key, key.to_vec(), value),
            None => {
                inner.state.set_child_value(child_key, key, value);
                let keys = inner.child_sorted_keys.entry(child_key.to_vec()).or_default();
                insert_sorted(keys, key);
            }
        }
    }

    /// Returns the value under `key` in the child trie at `child_key`.
    ///
    /// A child trie that neither exists in the committed state nor is scheduled for
    /// creation in the current transaction yields
    /// [`TrieError::ChildTrieDoesNotExist`].
    pub fn get_child_storage(
        &self,
        child_key: &[u8],
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, TrieError> {
        let inner = self.inner.read();
        if let Some(tx) = inner.transactions.last() {
            match tx.child(child_key) {
                Some(child_diff) => match child_diff.get(key) {
                    DiffValue::Upserted(value) => return Ok(Some(value.to_vec())),
                    DiffValue::Deleted => return Ok(None),
                    DiffValue::Unchanged => {
                        // A destroyed-and-rewritten child holds only the diff's writes;
                        // one scheduled for creation has nothing committed either.
                        if tx.is_child_deleted(child_key) || !inner.state.has_child(child_key) {
                            return Ok(None);
                        }
                    }
                },
                None => {
                    if tx.is_child_deleted(child_key) {
                        return Err(TrieError::missing_child(child_key));
                    }
                }
            }
        }
        Ok(inner.state.get_child_value(child_key, key)?.map(<[u8]>::to_vec))
    }

    /// Deletes `key` from the child trie at `child_key`.
    pub fn clear_child_storage(&self, child_key: &[u8], key: &[u8]) -> Result<(), TrieError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        match inner.transactions.last_mut() {
            Some(tx) => {
                tx.delete_from_child(child_key, key.to_vec());
                Ok(())
            }
            None => {
                inner.state.remove_child_value(child_key, key)?;
                if let Some(keys) = inner.child_sorted_keys.get_mut(child_key) {
                    remove_sorted(keys, key);
                }
                Ok(())
            }
        }
    }

    /// Deletes every key starting with `prefix` from the child trie at `child_key`.
    pub fn clear_prefix_in_child(&self, child_key: &[u8], prefix: &[u8]) -> Result<(), TrieError> {
        self.clear_prefix_in_child_with_limit(child_key, prefix, None).map(|_| ())
    }

    /// Deletes up to `limit` keys starting with `prefix` from the child trie at
    /// `child_key`, by ascending key order.
    pub fn clear_prefix_in_child_with_limit(
        &self,
        child_key: &[u8],
        prefix: &[u8],
        limit: Option<u32>,
    ) -> Result<(u32, bool), TrieError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        match inner.transactions.last_mut() {
            Some(tx) => {
                let committed = if tx.is_child_deleted(child_key) {
                    &[]
                } else {
                    inner.child_sorted_keys.get(child_key).map(Vec::as_slice).unwrap_or(&[])
                };
                Ok(tx.clear_prefix_in_child(child_key, prefix, committed, limit))
            }
            None => {
                let Some(child) = inner.state.child_trie_mut(child_key) else {
                    return Err(TrieError::missing_child(child_key));
                };
                let (deleted, all) = child.clear_prefix_limit(prefix, limit);
                if let Some(keys) = inner.child_sorted_keys.get_mut(child_key) {
                    remove_sorted_prefix(keys, prefix, Some(deleted));
                }
                Ok((deleted, all))
            }
        }
    }

    /// Destroys the child trie at `child_key` with all its content.
    ///
    /// Within a transaction the destruction is scheduled and takes effect on the
    /// outermost commit.
    pub fn delete_child(&self, child_key: &[u8]) -> Result<(), TrieError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        match inner.transactions.last_mut() {
            Some(tx) => {
                tx.delete_child(child_key);
                Ok(())
            }
            None => {
                if !inner.state.remove_child(child_key) {
                    return Err(TrieError::missing_child(child_key));
                }
                inner.child_sorted_keys.remove(child_key);
                Ok(())
            }
        }
    }

    /// Deletes up to `limit` entries of the child trie at `child_key`, by ascending key
    /// order; with no limit the child trie itself is destroyed.
    ///
    /// Returns the number of deleted entries and whether the child is now empty.
    pub fn delete_child_limit(
        &self,
        child_key: &[u8],
        limit: Option<u32>,
    ) -> Result<(u32, bool), TrieError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        match inner.transactions.last_mut() {
            Some(tx) => {
                let scheduled = tx.child(child_key).is_some();
                let committed_live =
                    inner.state.has_child(child_key) && !tx.is_child_deleted(child_key);
                if !scheduled && !committed_live {
                    return Err(TrieError::missing_child(child_key));
                }
                let committed: Vec<Vec<u8>> = if committed_live {
                    inner.child_sorted_keys.get(child_key).cloned().unwrap_or_default()
                } else {
                    Vec::new()
                };
                Ok(tx.delete_child_limit(child_key, &committed, limit))
            }
            None => match limit {
                None => {
                    let count = inner
                        .child_sorted_keys
                        .get(child_key)
                        .map_or(0, |keys| keys.len() as u32);
                    if !inner.state.remove_child(child_key) {
                        return Err(TrieError::missing_child(child_key));
                    }
                    inner.child_sorted_keys.remove(child_key);
                    Ok((count, true))
                }
                Some(limit) => {
                    let Some(child) = inner.state.child_trie_mut(child_key) else {
                        return Err(TrieError::missing_child(child_key));
                    };
                    let (deleted, all) = child.clear_prefix_limit(&[], Some(limit));
                    if let Some(keys) = inner.child_sorted_keys.get_mut(child_key) {
                        remove_sorted_prefix(keys, &[], Some(deleted));
                    }
                    Ok((deleted, all))
                }
            },
        }
    }

    /// The smallest key strictly greater than `key` in the child trie at `child_key`,
    /// considering all open overlays.
    pub fn child_next_key(
        &self,
        child_key: &[u8],
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, TrieError> {
        let inner = self.inner.read();
        if let Some(tx) = inner.transactions.last() {
            if let Some(child_diff) = tx.child(child_key) {
                let committed = inner.committed_child_keys(tx, child_key);
                return Ok(child_diff.next_key(key, committed));
            }
            if tx.is_child_deleted(child_key) {
                return Err(TrieError::missing_child(child_key));
            }
        }
        let Some(child) = inner.state.child(child_key) else {
            return Err(TrieError::missing_child(child_key));
        };
        Ok(child.next_key(key))
    }

    /// The keys starting with `prefix` in the child trie at `child_key`, ascending,
    /// considering all open overlays.
    pub fn child_keys_with_prefix(
        &self,
        child_key: &[u8],
        prefix: &[u8],
    ) -> Result<Vec<Vec<u8>>, TrieError> {
        let inner = self.inner.read();
        if let Some(tx) = inner.transactions.last() {
            if let Some(child_diff) = tx.child(child_key) {
                let committed = inner.committed_child_keys(tx, child_key);
                return Ok(child_diff.keys_with_prefix(prefix, committed));
            }
            if tx.is_child_deleted(child_key) {
                return Err(TrieError::missing_child(child_key));
            }
        }
        let Some(child) = inner.state.child(child_key) else {
            return Err(TrieError::missing_child(child_key));
        };
        Ok(child.keys_with_prefix(prefix))
    }

    /// The merkle root of the committed child trie at `child_key`. Open transactions are
    /// not reflected.
    pub fn child_root(&self, child_key: &[u8]) -> Result<Hash256, TrieError> {
        self.inner.read().state.child_root(child_key)
    }

    /// The state root, with every child root folded in.
    ///
    /// Every reachable node's canonical encoding is pushed into the shared cache, where
    /// the pruner and the state backend resolve node hashes.
    ///
    /// # Panics
    ///
    /// Panics if a storage transaction is open.
    pub fn root(&self) -> Result<Hash256, TrieError> {
        let inner = self.inner.read();
        assert!(
            inner.transactions.is_empty(),
            "cannot compute the state root with open storage transactions"
        );
        let root = inner.state.root_hash();
        inner.state.for_each_node(&mut |hash, encoded| self.cache.insert_node(hash, encoded));
        Ok(root)
    }

    /// The state root. Panics where [`root`](Self::root) returns an error.
    pub fn must_root(&self) -> Hash256 {
        self.root().expect("state root computation failed")
    }

    /// The runtime code blob, stored under [`CODE_KEY`].
    pub fn load_code(&self) -> Option<Vec<u8>> {
        self.get(CODE_KEY)
    }

    /// The blake2b-256 hash of the runtime code blob (of the empty blob if absent). The
    /// code is cached under its hash in the shared value cache.
    pub fn load_code_hash(&self) -> Hash256 {
        let code = self.load_code().unwrap_or_default();
        let hash = Hash256::from(blake2_256(&code));
        self.cache.insert_value(hash.as_bytes().to_vec(), code);
        hash
    }

    /// The merkle-node hashes inserted and deleted since this state was created,
    /// across the main trie and all child tries.
    pub fn changed_node_hashes(&self) -> (HashSet<Hash256>, HashSet<Hash256>) {
        let inner = self.inner.read();
        let current = inner.state.node_hashes();
        let baseline = inner.snapshot.node_hashes();
        let inserted = current.difference(&baseline).copied().collect();
        let deleted = baseline.difference(&current).copied().collect();
        (inserted, deleted)
    }

    /// Every main-trie entry, with the innermost overlay applied.
    pub fn entries(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        let inner = self.inner.read();
        let mut entries: BTreeMap<Vec<u8>, Vec<u8>> =
            inner.state.entries().into_iter().collect();
        if let Some(tx) = inner.transactions.last() {
            for (key, value) in tx.upserts() {
                entries.insert(key.clone(), value.clone());
            }
            for key in tx.deletes() {
                entries.remove(key);
            }
        }
        entries
    }

    /// A snapshot clone of the committed state, for concurrent readers.
    pub fn trie(&self) -> StateTrie {
        self.inner.read().state.clone()
    }
}

impl Default for TrieState {
    fn default() -> Self {
        Self::new(StateTrie::new(), Arc::new(TrieCache::new()))
    }
}

fn insert_sorted(keys: &mut Vec<Vec<u8>>, key: &[u8]) {
    if let Err(position) = keys.binary_search_by(|probe| probe.as_slice().cmp(key)) {
        keys.insert(position, key.to_vec());
    }
}

fn remove_sorted(keys: &mut Vec<Vec<u8>>, key: &[u8]) {
    if let Ok(position) = keys.binary_search_by(|probe| probe.as_slice().cmp(key)) {
        keys.remove(position);
    }
}

/// Removes up to `limit` keys starting with `prefix`, scanning from the binary-search
/// insertion point until the prefix stops matching.
fn remove_sorted_prefix(keys: &mut Vec<Vec<u8>>, prefix: &[u8], limit: Option<u32>) {
    let start = keys.partition_point(|probe| probe.as_slice() < prefix);
    let max = limit.map_or(usize::MAX, |limit| limit as usize);
    let mut end = start;
    while end < keys.len() && end - start < max && keys[end].starts_with(prefix) {
        end += 1;
    }
    keys.drain(start..end);
}

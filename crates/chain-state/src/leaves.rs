use codec::{Decode, Encode};
use rivet_db_api::{ColumnId, Database, DatabaseError, Transaction};
use rivet_primitives::{BlockHash, BlockNumber, NumHash};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Outcome of a [`LeafSet::import`], consumed by [`Undo::undo_import`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "pass the outcome to Undo::undo_import if the enclosing transaction aborts"]
pub struct ImportOutcome<H, N> {
    inserted: NumHash<N, H>,
    removed: Option<H>,
}

impl<H: Copy, N> ImportOutcome<H, N> {
    /// The parent hash displaced by the import, if any.
    pub fn displaced(&self) -> Option<H> {
        self.removed
    }
}

/// Outcome of a [`LeafSet::remove`], consumed by [`Undo::undo_remove`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "pass the outcome to Undo::undo_remove if the enclosing transaction aborts"]
pub struct RemoveOutcome<H, N> {
    inserted: Option<H>,
    removed: NumHash<N, H>,
}

/// Outcome of a [`LeafSet::finalize_height`], consumed by [`Undo::undo_finalization`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "pass the outcome to Undo::undo_finalization if the enclosing transaction aborts"]
pub struct FinalizationOutcome<H, N> {
    removed: BTreeMap<N, Vec<H>>,
}

impl<H: Copy, N: Ord> FinalizationOutcome<H, N> {
    /// The leaves displaced by the finalization, lowest height first.
    pub fn leaves(&self) -> Vec<H> {
        self.removed.values().flatten().copied().collect()
    }

    /// Returns `true` if nothing was displaced.
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
    }
}

/// The set of blocks with no known descendant, ordered by height.
///
/// Kept in memory for fast checking and modification of the active chain tips, and
/// serialised into the same database transaction as the block-tree mutation that caused
/// the change. Hashes at one height keep insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafSet<H, N: Ord> {
    storage: BTreeMap<N, Vec<H>>,
}

impl<H: BlockHash, N: BlockNumber> LeafSet<H, N> {
    /// Creates an empty leaf set.
    pub const fn new() -> Self {
        Self { storage: BTreeMap::new() }
    }

    /// Reads the leaf list previously written with
    /// [`prepare_transaction`](Self::prepare_transaction). An absent key yields an empty
    /// set.
    pub fn from_db(
        db: &dyn Database,
        column: ColumnId,
        prefix: &[u8],
    ) -> Result<Self, DatabaseError> {
        let mut storage = BTreeMap::new();
        if let Some(encoded) = db.get(column, prefix)? {
            let levels: Vec<(N, Vec<H>)> = Decode::decode(&mut &encoded[..])
                .map_err(|err| DatabaseError::Corrupted(format!("leaf set: {err}")))?;
            for (number, hashes) in levels {
                storage.insert(number, hashes);
            }
        }
        Ok(Self { storage })
    }

    /// Updates the leaf list on block import: the parent stops being a leaf, the new
    /// block becomes one.
    pub fn import(&mut self, hash: H, number: N, parent_hash: H) -> ImportOutcome<H, N> {
        let mut removed = None;
        if number != N::zero() {
            let parent_number = number - N::one();
            if self.remove_leaf(parent_number, &parent_hash) {
                trace!(target: "chain_state", %parent_hash, %parent_number, "leaf displaced by child import");
                removed = Some(parent_hash);
            }
        }

        self.insert_leaf(number, hash);
        ImportOutcome { inserted: NumHash::new(number, hash), removed }
    }

    /// Updates the leaf list on block removal.
    ///
    /// The set cannot tell whether the removed block was its parent's last child, so the
    /// caller checks that condition and passes `parent_hash` only then; the parent is
    /// re-inserted as a leaf (heights above genesis only).
    ///
    /// Returns `None` if `(hash, number)` is not a leaf.
    pub fn remove(&mut self, hash: H, number: N, parent_hash: Option<H>) -> Option<RemoveOutcome<H, N>> {
        if !self.remove_leaf(number, &hash) {
            return None;
        }

        let inserted = match parent_hash {
            Some(parent) if number != N::zero() => {
                self.insert_leaf(number - N::one(), parent);
                Some(parent)
            }
            _ => None,
        };

        Some(RemoveOutcome { inserted, removed: NumHash::new(number, hash) })
    }

    /// Notes a block height finalized, displacing every leaf strictly below it.
    ///
    /// Leaves at the finalized height with a different hash are left in place; the
    /// assumptions of regular finalization mean they are pruned shortly afterwards
    /// anyway. Finalizing height zero is a no-op.
    pub fn finalize_height(&mut self, number: N) -> FinalizationOutcome<H, N> {
        if number == N::zero() {
            return FinalizationOutcome { removed: BTreeMap::new() };
        }

        let retained = self.storage.split_off(&number);
        let removed = core::mem::replace(&mut self.storage, retained);
        if !removed.is_empty() {
            debug!(target: "chain_state", %number, displaced = removed.values().map(Vec::len).sum::<usize>(), "leaves displaced by finalization");
        }
        FinalizationOutcome { removed }
    }

    /// The leaves [`finalize_height`](Self::finalize_height) would displace, without
    /// mutating the set.
    pub fn displaced_by_finalize_height(&self, number: N) -> FinalizationOutcome<H, N> {
        if number == N::zero() {
            return FinalizationOutcome { removed: BTreeMap::new() };
        }

        let removed =
            self.storage.range(..number).map(|(n, hashes)| (*n, hashes.clone())).collect();
        FinalizationOutcome { removed }
    }

    /// Reverts to the given best block by dropping every leaf above its height.
    ///
    /// The best block is re-inserted if absent afterwards: regular block import
    /// guarantees the best block is always a leaf.
    pub fn revert(&mut self, best_hash: H, best_number: N) {
        let dropped = self.storage.split_off(&(best_number + N::one()));
        if !dropped.is_empty() {
            debug!(target: "chain_state", %best_number, dropped = dropped.values().map(Vec::len).sum::<usize>(), "leaves dropped by revert");
        }

        if !self.contains(best_number, best_hash) {
            self.insert_leaf(best_number, best_hash);
        }
    }

    /// Returns the undo handle for rolling back previously returned outcomes.
    ///
    /// Outcomes must be replayed in reverse chronological order, with no other
    /// modification in between; otherwise the on-disk state may get out of sync with the
    /// in-memory state.
    pub fn undo(&mut self) -> Undo<'_, H, N> {
        Undo { inner: self }
    }

    /// All leaf hashes, ordered by height descending.
    pub fn hashes(&self) -> Vec<H> {
        self.storage.iter().rev().flat_map(|(_, hashes)| hashes.iter().copied()).collect()
    }

    /// The number of known leaves.
    pub fn count(&self) -> usize {
        self.storage.values().map(Vec::len).sum()
    }

    /// Returns `true` if the set holds no leaf.
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// The highest height carrying a leaf, with all hashes at it.
    pub fn highest_leaf(&self) -> Option<(N, &[H])> {
        self.storage.last_key_value().map(|(number, hashes)| (*number, hashes.as_slice()))
    }

    /// Returns `true` if `(number, hash)` is a leaf.
    pub fn contains(&self, number: N, hash: H) -> bool {
        self.storage.get(&number).is_some_and(|hashes| hashes.contains(&hash))
    }

    /// Writes the leaf list into the transaction under `(column, prefix)`, encoded as a
    /// SCALE sequence of `(number, hashes)` levels ordered by height descending.
    pub fn prepare_transaction(&self, tx: &mut Transaction, column: ColumnId, prefix: &[u8]) {
        let levels: Vec<(N, &Vec<H>)> =
            self.storage.iter().rev().map(|(number, hashes)| (*number, hashes)).collect();
        tx.set(column, prefix, levels.encode());
    }

    fn insert_leaf(&mut self, number: N, hash: H) {
        self.storage.entry(number).or_default().push(hash);
    }

    /// Returns `true` if the leaf was present.
    fn remove_leaf(&mut self, number: N, hash: &H) -> bool {
        let Some(hashes) = self.storage.get_mut(&number) else { return false };
        let Some(position) = hashes.iter().position(|h| h == hash) else { return false };
        hashes.remove(position);
        if hashes.is_empty() {
            self.storage.remove(&number);
        }
        true
    }
}

/// Helper for undoing operations against the same [`LeafSet`], in strict LIFO order.
#[derive(Debug)]
pub struct Undo<'a, H, N: Ord> {
    inner: &'a mut LeafSet<H, N>,
}

impl<H: BlockHash, N: BlockNumber> Undo<'_, H, N> {
    /// Undoes an import by replaying its outcome backwards.
    pub fn undo_import(&mut self, outcome: ImportOutcome<H, N>) {
        if let Some(removed) = outcome.removed {
            self.inner.insert_leaf(outcome.inserted.number - N::one(), removed);
        }
        self.inner.remove_leaf(outcome.inserted.number, &outcome.inserted.hash);
    }

    /// Undoes a removal by replaying its outcome backwards.
    pub fn undo_remove(&mut self, outcome: RemoveOutcome<H, N>) {
        if let Some(inserted) = outcome.inserted {
            self.inner.remove_leaf(outcome.removed.number - N::one(), &inserted);
        }
        self.inner.insert_leaf(outcome.removed.number, outcome.removed.hash);
    }

    /// Undoes a finalization by restoring the displaced levels.
    pub fn undo_finalization(&mut self, outcome: FinalizationOutcome<H, N>) {
        for (number, hashes) in outcome.removed {
            self.inner.storage.insert(number, hashes);
        }
    }
}

use crate::{Error, FinalizationResult, PendingChange};
use codec::{Decode, Encode, Error as CodecError, Input, Output};
use rivet_db_api::{ColumnId, Database, DatabaseError, Transaction};
use rivet_primitives::ChainPrimitives;
use tracing::debug;

/// A node of the change tree: a pending change and the changes announced on descendant
/// blocks of its branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingChangeNode<P: ChainPrimitives> {
    /// The pending change announced at this node's block.
    pub change: PendingChange<P>,
    /// Changes announced on descendant blocks, in insertion order.
    pub children: Vec<PendingChangeNode<P>>,
}

impl<P: ChainPrimitives> PendingChangeNode<P> {
    fn new(change: PendingChange<P>) -> Self {
        Self { change, children: Vec::new() }
    }

    /// Attempts to attach the change below this node. Returns `true` if a node in this
    /// subtree claimed it.
    fn import<F, E>(
        &mut self,
        hash: P::Hash,
        number: P::Number,
        change: &mut Option<PendingChange<P>>,
        is_descendent_of: &F,
    ) -> Result<bool, Error<E>>
    where
        F: Fn(&P::Hash, &P::Hash) -> Result<bool, E>,
    {
        if hash == self.change.canon_hash {
            return Err(Error::DuplicateHashes);
        }

        if !is_descendent_of(&self.change.canon_hash, &hash).map_err(Error::Client)? {
            return Ok(false);
        }

        if number <= self.change.canon_height {
            return Ok(false);
        }

        for child in &mut self.children {
            if child.import(hash, number, change, is_descendent_of)? {
                return Ok(true);
            }
        }

        let change = change.take().expect("a change is claimed by exactly one node");
        self.children.push(Self::new(change));
        Ok(true)
    }
}

/// Action returned by the [`ChangeTree::drain_filter`] predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterAction {
    /// Remove the node and its entire subtree.
    Remove,
    /// Keep the node and keep filtering its children.
    KeepNode,
    /// Keep the node and its entire subtree, skipping it.
    KeepTree,
}

/// Tracks pending authority-set changes across all forks of the chain.
///
/// The tree is an acyclic forest keyed by the announcing block's `(hash, height)`: every
/// parent/child edge satisfies `child.canon_height > parent.canon_height` and the child's
/// block descends from the parent's, with hashes unique across the forest. Callers import
/// changes along a branch in ascending height order, which the descent in
/// [`import`](Self::import) relies on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeTree<P: ChainPrimitives> {
    roots: Vec<PendingChangeNode<P>>,
    best_finalized_number: Option<P::Number>,
}

impl<P: ChainPrimitives> Encode for PendingChangeNode<P> {
    fn encode_to<T: Output + ?Sized>(&self, dest: &mut T) {
        self.change.encode_to(dest);
        self.children.encode_to(dest);
    }
}

impl<P: ChainPrimitives> Decode for PendingChangeNode<P> {
    fn decode<I: Input>(input: &mut I) -> Result<Self, CodecError> {
        Ok(Self { change: Decode::decode(input)?, children: Decode::decode(input)? })
    }
}

impl<P: ChainPrimitives> Encode for ChangeTree<P> {
    fn encode_to<T: Output + ?Sized>(&self, dest: &mut T) {
        self.roots.encode_to(dest);
        self.best_finalized_number.encode_to(dest);
    }
}

impl<P: ChainPrimitives> Decode for ChangeTree<P> {
    fn decode<I: Input>(input: &mut I) -> Result<Self, CodecError> {
        Ok(Self { roots: Decode::decode(input)?, best_finalized_number: Decode::decode(input)? })
    }
}

impl<P: ChainPrimitives> ChangeTree<P> {
    /// Creates an empty tree.
    pub const fn new() -> Self {
        Self { roots: Vec::new(), best_finalized_number: None }
    }

    /// Returns the roots of each fork, in insertion order.
    pub fn roots(&self) -> &[PendingChangeNode<P>] {
        &self.roots
    }

    /// Returns `true` if no change is pending.
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// The highest number passed to a successful
    /// [`finalize_with_descendent_if`](Self::finalize_with_descendent_if), if any.
    pub fn best_finalized_number(&self) -> Option<P::Number> {
        self.best_finalized_number
    }

    /// Imports a pending change announced at block `(hash, number)`.
    ///
    /// The change attaches below the deepest existing node whose block is an ancestor of
    /// `hash` (children are tried in order before appending as a new leaf); if no node
    /// claims it, it becomes a new root and `true` is returned.
    ///
    /// The oracle must return `true` iff the second hash descends from the first.
    pub fn import<F, E>(
        &mut self,
        hash: P::Hash,
        number: P::Number,
        change: PendingChange<P>,
        is_descendent_of: &F,
    ) -> Result<bool, Error<E>>
    where
        F: Fn(&P::Hash, &P::Hash) -> Result<bool, E>,
    {
        if let Some(best) = self.best_finalized_number {
            if number <= best {
                return Err(Error::Revert);
            }
        }

        let mut change = Some(change);
        for root in &mut self.roots {
            if root.import(hash, number, &mut change, is_descendent_of)? {
                debug!(target: "fork_tree", %hash, %number, "pending change imported below an existing fork");
                return Ok(false);
            }
        }

        let change = change.take().expect("no node claimed the change");
        self.roots.push(PendingChangeNode::new(change));
        debug!(target: "fork_tree", %hash, %number, "pending change imported as a new root");
        Ok(true)
    }

    /// Iterates over all pending changes in pre-order.
    pub fn pending_changes(&self) -> PendingChanges<'_, P> {
        PendingChanges { stack: self.roots.iter().rev().collect() }
    }

    /// Checks whether finalizing block `(hash, number)` finalizes any change passing
    /// `predicate`.
    ///
    /// Returns `Some(true)` if the finalized change is currently a root, `Some(false)`
    /// if it is an inner node, and `None` if nothing is finalized. Fails with
    /// [`Error::UnfinalisedAncestor`] when the block is a descendant of a matching
    /// node's child: the child's own change would be skipped over.
    pub fn finalizes_any_with_descendent_if<F, E, Pr>(
        &self,
        hash: &P::Hash,
        number: P::Number,
        is_descendent_of: &F,
        predicate: Pr,
    ) -> Result<Option<bool>, Error<E>>
    where
        F: Fn(&P::Hash, &P::Hash) -> Result<bool, E>,
        Pr: Fn(&PendingChange<P>) -> bool,
    {
        if let Some(best) = self.best_finalized_number {
            if number <= best {
                return Err(Error::Revert);
            }
        }

        for node in self.nodes() {
            let is_desc =
                is_descendent_of(&node.change.canon_hash, hash).map_err(Error::Client)?;
            if predicate(&node.change) && (node.change.canon_hash == *hash || is_desc) {
                self.ensure_no_unfinalized_child(node, hash, number, is_descendent_of)?;
                let is_root =
                    self.roots.iter().any(|root| root.change.canon_hash == node.change.canon_hash);
                return Ok(Some(is_root));
            }
        }

        Ok(None)
    }

    /// Finalizes the root (roots only) matched by block `(hash, number)` and `predicate`:
    /// the root is removed, its children become the new roots, and any new root that can
    /// no longer end up on the canonical chain is pruned.
    ///
    /// A root survives the pruning iff it is above the finalized block and descends from
    /// it, is the finalized block itself, or is an ancestor of it (its predicate has not
    /// passed yet). `best_finalized_number` is set to `number` afterwards.
    pub fn finalize_with_descendent_if<F, E, Pr>(
        &mut self,
        hash: &P::Hash,
        number: P::Number,
        is_descendent_of: &F,
        predicate: Pr,
    ) -> Result<FinalizationResult<P>, Error<E>>
    where
        F: Fn(&P::Hash, &P::Hash) -> Result<bool, E>,
        Pr: Fn(&PendingChange<P>) -> bool,
    {
        if let Some(best) = self.best_finalized_number {
            if number <= best {
                return Err(Error::Revert);
            }
        }

        let mut position = None;
        for (i, root) in self.roots.iter().enumerate() {
            let is_desc =
                is_descendent_of(&root.change.canon_hash, hash).map_err(Error::Client)?;
            if predicate(&root.change) && (root.change.canon_hash == *hash || is_desc) {
                self.ensure_no_unfinalized_child(root, hash, number, is_descendent_of)?;
                position = Some(i);
                break;
            }
        }

        let finalized = position.map(|i| {
            let node = self.roots.swap_remove(i);
            self.roots = node.children;
            node.change
        });

        let mut pruned = false;
        let mut decisions = Vec::with_capacity(self.roots.len());
        for root in &self.roots {
            let retain = if root.change.canon_height > number {
                is_descendent_of(hash, &root.change.canon_hash).map_err(Error::Client)?
            } else if root.change.canon_height == number {
                root.change.canon_hash == *hash
            } else {
                is_descendent_of(&root.change.canon_hash, hash).map_err(Error::Client)?
            };
            pruned |= !retain;
            decisions.push(retain);
        }
        let mut decisions = decisions.into_iter();
        self.roots.retain(|_| decisions.next().expect("one decision per root"));

        self.best_finalized_number = Some(number);

        match finalized {
            Some(change) => {
                debug!(target: "fork_tree", %hash, %number, "authority-set change finalized");
                Ok(FinalizationResult::Changed(Some(change)))
            }
            None if pruned => Ok(FinalizationResult::Changed(None)),
            None => Ok(FinalizationResult::Unchanged),
        }
    }

    /// Removes nodes (and possibly their subtrees) according to `filter`, visiting in
    /// pre-order. Removed changes are returned in pre-order.
    pub fn drain_filter<F>(&mut self, mut filter: F) -> Vec<PendingChange<P>>
    where
        F: FnMut(&PendingChange<P>) -> FilterAction,
    {
        let mut removed = Vec::new();
        Self::drain_nodes(&mut self.roots, &mut filter, &mut removed);
        removed
    }

    /// Writes the SCALE-encoded tree into the transaction under `(column, prefix)`.
    pub fn prepare_transaction(&self, tx: &mut Transaction, column: ColumnId, prefix: &[u8]) {
        tx.set(column, prefix, self.encode());
    }

    /// Restores a tree previously written with
    /// [`prepare_transaction`](Self::prepare_transaction). An absent key yields an empty
    /// tree.
    pub fn from_db(
        db: &dyn Database,
        column: ColumnId,
        prefix: &[u8],
    ) -> Result<Self, DatabaseError> {
        match db.get(column, prefix)? {
            Some(encoded) => Self::decode(&mut &encoded[..])
                .map_err(|err| DatabaseError::Corrupted(format!("change tree: {err}"))),
            None => Ok(Self::new()),
        }
    }

    /// Errors when a child of `node` would be skipped by finalizing `(hash, number)`:
    /// the child's block is at or below `number` and `hash` strictly descends from it.
    fn ensure_no_unfinalized_child<F, E>(
        &self,
        node: &PendingChangeNode<P>,
        hash: &P::Hash,
        number: P::Number,
        is_descendent_of: &F,
    ) -> Result<(), Error<E>>
    where
        F: Fn(&P::Hash, &P::Hash) -> Result<bool, E>,
    {
        for child in &node.children {
            if child.change.canon_height <= number
                && is_descendent_of(&child.change.canon_hash, hash).map_err(Error::Client)?
            {
                return Err(Error::UnfinalisedAncestor);
            }
        }
        Ok(())
    }

    fn nodes(&self) -> impl Iterator<Item = &PendingChangeNode<P>> {
        NodesPreOrder { stack: self.roots.iter().rev().collect() }
    }

    fn drain_nodes<F>(
        nodes: &mut Vec<PendingChangeNode<P>>,
        filter: &mut F,
        removed: &mut Vec<PendingChange<P>>,
    ) where
        F: FnMut(&PendingChange<P>) -> FilterAction,
    {
        let mut i = 0;
        while i < nodes.len() {
            match filter(&nodes[i].change) {
                FilterAction::Remove => {
                    Self::collect_pre_order(nodes.remove(i), removed);
                }
                FilterAction::KeepNode => {
                    Self::drain_nodes(&mut nodes[i].children, filter, removed);
                    i += 1;
                }
                FilterAction::KeepTree => i += 1,
            }
        }
    }

    fn collect_pre_order(node: PendingChangeNode<P>, out: &mut Vec<PendingChange<P>>) {
        out.push(node.change);
        for child in node.children {
            Self::collect_pre_order(child, out);
        }
    }
}

struct NodesPreOrder<'a, P: ChainPrimitives> {
    stack: Vec<&'a PendingChangeNode<P>>,
}

impl<'a, P: ChainPrimitives> Iterator for NodesPreOrder<'a, P> {
    type Item = &'a PendingChangeNode<P>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

/// Pre-order iterator over all pending changes of a [`ChangeTree`].
pub struct PendingChanges<'a, P: ChainPrimitives> {
    stack: Vec<&'a PendingChangeNode<P>>,
}

impl<'a, P: ChainPrimitives> Iterator for PendingChanges<'a, P> {
    type Item = &'a PendingChange<P>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(&node.change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rivet_db_api::InMemoryDb;
    use std::{collections::HashMap, fmt};

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    struct TestPrimitives;

    impl ChainPrimitives for TestPrimitives {
        type Hash = u64;
        type Number = u64;
        type AuthorityId = u32;
    }

    type TestTree = ChangeTree<TestPrimitives>;
    type TestChange = PendingChange<TestPrimitives>;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct UnknownBlock(u64);

    impl fmt::Display for UnknownBlock {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "unknown block {}", self.0)
        }
    }

    impl std::error::Error for UnknownBlock {}

    /// Builds a descendant oracle from `child -> parent` edges.
    fn ancestry(edges: &[(u64, u64)]) -> impl Fn(&u64, &u64) -> Result<bool, UnknownBlock> {
        let parents: HashMap<u64, u64> = edges.iter().map(|&(child, parent)| (child, parent)).collect();
        move |base, target| {
            let mut current = *target;
            while let Some(&parent) = parents.get(&current) {
                if parent == *base {
                    return Ok(true);
                }
                current = parent;
            }
            Ok(false)
        }
    }

    fn change(canon_hash: u64, canon_height: u64) -> TestChange {
        PendingChange {
            next_authorities: vec![rivet_primitives::Authority::new(1u32, 1)],
            delay: 0,
            canon_height,
            canon_hash,
        }
    }

    /// The fork corpus used across tests:
    ///
    /// ```text
    /// 1 --- 10 --- 11 (B)
    ///         \--- 12 (C) --- 13
    /// ```
    ///
    /// with changes announced at 10 (A), 11 (B) and 12 (C).
    fn fork_edges() -> Vec<(u64, u64)> {
        vec![(10, 1), (11, 10), (12, 10), (13, 12)]
    }

    #[test]
    fn import_attaches_along_branches() {
        let is_desc = ancestry(&fork_edges());
        let mut tree = TestTree::new();

        assert!(tree.import(10, 10, change(10, 10), &is_desc).unwrap());
        assert!(!tree.import(11, 11, change(11, 11), &is_desc).unwrap());
        assert!(!tree.import(12, 11, change(12, 11), &is_desc).unwrap());

        assert_eq!(tree.roots().len(), 1);
        assert_eq!(tree.roots()[0].change.canon_hash, 10);
        let children: Vec<_> =
            tree.roots()[0].children.iter().map(|node| node.change.canon_hash).collect();
        assert_eq!(children, vec![11, 12]);
    }

    #[test]
    fn import_on_unrelated_fork_creates_new_root() {
        let is_desc = ancestry(&[(10, 1), (20, 2)]);
        let mut tree = TestTree::new();

        assert!(tree.import(10, 10, change(10, 10), &is_desc).unwrap());
        assert!(tree.import(20, 10, change(20, 10), &is_desc).unwrap());
        assert_eq!(tree.roots().len(), 2);
    }

    #[test]
    fn import_rejects_duplicate_hashes() {
        let is_desc = ancestry(&fork_edges());
        let mut tree = TestTree::new();

        tree.import(10, 10, change(10, 10), &is_desc).unwrap();
        tree.import(11, 11, change(11, 11), &is_desc).unwrap();

        assert_matches!(tree.import(11, 11, change(11, 11), &is_desc), Err(Error::DuplicateHashes));
        assert_matches!(tree.import(10, 10, change(10, 10), &is_desc), Err(Error::DuplicateHashes));
    }

    #[test]
    fn import_below_best_finalized_is_a_revert() {
        let is_desc = ancestry(&fork_edges());
        let mut tree = TestTree::new();

        tree.import(10, 10, change(10, 10), &is_desc).unwrap();
        tree.finalize_with_descendent_if(&10, 10, &is_desc, |_| true).unwrap();

        assert_matches!(tree.import(11, 10, change(11, 10), &is_desc), Err(Error::Revert));
    }

    #[test]
    fn pending_changes_is_pre_order() {
        let is_desc = ancestry(&fork_edges());
        let mut tree = TestTree::new();

        tree.import(10, 10, change(10, 10), &is_desc).unwrap();
        tree.import(11, 11, change(11, 11), &is_desc).unwrap();
        tree.import(12, 11, change(12, 11), &is_desc).unwrap();
        tree.import(13, 12, change(13, 12), &is_desc).unwrap();

        let order: Vec<_> = tree.pending_changes().map(|c| c.canon_hash).collect();
        assert_eq!(order, vec![10, 11, 12, 13]);
    }

    #[test]
    fn finalizes_any_reports_root_and_non_root() {
        let is_desc = ancestry(&fork_edges());
        let mut tree = TestTree::new();

        tree.import(10, 10, change(10, 10), &is_desc).unwrap();
        tree.import(11, 11, change(11, 11), &is_desc).unwrap();

        // Finalizing at the root change itself.
        assert_eq!(tree.finalizes_any_with_descendent_if(&10, 10, &is_desc, |_| true).unwrap(), Some(true));
        // Finalizing at the child: the root matches first and it is a root.
        assert_eq!(tree.finalizes_any_with_descendent_if(&11, 11, &is_desc, |_| true).unwrap(), Some(true));
        // Nothing matches when the predicate rejects everything.
        assert_eq!(tree.finalizes_any_with_descendent_if(&11, 11, &is_desc, |_| false).unwrap(), None);
        // Skipping the root via the predicate surfaces the inner node.
        assert_eq!(
            tree.finalizes_any_with_descendent_if(&11, 11, &is_desc, |c| c.canon_hash == 11)
                .unwrap(),
            Some(false)
        );
    }

    #[test]
    fn effective_number_drives_the_standard_predicate() {
        let is_desc = ancestry(&fork_edges());
        let mut tree = TestTree::new();
        let mut delayed = change(10, 10);
        delayed.delay = 5;
        tree.import(10, 10, delayed, &is_desc).unwrap();

        // The change only takes effect at height 15; finalizing height 11 passes by.
        assert_eq!(
            tree.finalizes_any_with_descendent_if(&11, 11, &is_desc, |c| c.effective_number() <= 11)
                .unwrap(),
            None
        );
        assert_eq!(
            tree.finalizes_any_with_descendent_if(&13, 15, &is_desc, |c| c.effective_number() <= 15)
                .unwrap(),
            Some(true)
        );
    }

    #[test]
    fn finalize_at_fork_point_prunes_siblings() {
        // A=(10,10) with children B=(11,11) and C=(12,11) on a sibling fork; finalizing
        // at B finalizes A and prunes C.
        let is_desc = ancestry(&fork_edges());
        let mut tree = TestTree::new();

        tree.import(10, 10, change(10, 10), &is_desc).unwrap();
        tree.import(11, 11, change(11, 11), &is_desc).unwrap();
        tree.import(12, 11, change(12, 11), &is_desc).unwrap();

        let result = tree.finalize_with_descendent_if(&11, 11, &is_desc, |_| true).unwrap();
        assert_eq!(result, FinalizationResult::Changed(Some(change(10, 10))));

        let roots: Vec<_> = tree.roots().iter().map(|node| node.change.canon_hash).collect();
        assert_eq!(roots, vec![11]);
        assert_eq!(tree.best_finalized_number(), Some(11));
    }

    #[test]
    fn finalize_below_best_finalized_is_a_revert() {
        let is_desc = ancestry(&fork_edges());
        let mut tree = TestTree::new();

        tree.import(10, 10, change(10, 10), &is_desc).unwrap();
        tree.import(11, 11, change(11, 11), &is_desc).unwrap();
        tree.finalize_with_descendent_if(&11, 11, &is_desc, |_| true).unwrap();

        assert_matches!(
            tree.finalize_with_descendent_if(&10, 10, &is_desc, |_| true),
            Err(Error::Revert)
        );
        assert_matches!(
            tree.finalizes_any_with_descendent_if(&10, 10, &is_desc, |_| true),
            Err(Error::Revert)
        );
    }

    #[test]
    fn finalize_past_unfinalized_child_fails() {
        let is_desc = ancestry(&fork_edges());
        let mut tree = TestTree::new();

        tree.import(10, 10, change(10, 10), &is_desc).unwrap();
        tree.import(12, 11, change(12, 11), &is_desc).unwrap();

        // 13 descends from the child change at 12: finalizing it would skip that change.
        assert_matches!(
            tree.finalize_with_descendent_if(&13, 12, &is_desc, |_| true),
            Err(Error::UnfinalisedAncestor)
        );
        assert_matches!(
            tree.finalizes_any_with_descendent_if(&13, 12, &is_desc, |_| true),
            Err(Error::UnfinalisedAncestor)
        );
        // The failed finalization left the tree untouched.
        assert_eq!(tree.pending_changes().count(), 2);
        assert_eq!(tree.best_finalized_number(), None);
    }

    #[test]
    fn finalize_prunes_without_finalizing_when_predicate_rejects() {
        let is_desc = ancestry(&[(10, 1), (20, 2), (11, 10)]);
        let mut tree = TestTree::new();

        tree.import(10, 10, change(10, 10), &is_desc).unwrap();
        tree.import(20, 10, change(20, 10), &is_desc).unwrap();

        // Finalize block 11 (a plain block above the change at 10, no predicate passes):
        // the unrelated root at 20 is pruned, the ancestor root at 10 is kept.
        let result = tree.finalize_with_descendent_if(&11, 11, &is_desc, |_| false).unwrap();
        assert_eq!(result, FinalizationResult::Changed(None));

        let roots: Vec<_> = tree.roots().iter().map(|node| node.change.canon_hash).collect();
        assert_eq!(roots, vec![10]);
        assert_eq!(tree.best_finalized_number(), Some(11));
    }

    #[test]
    fn finalize_with_empty_tree_is_unchanged_but_advances_best_finalized() {
        let is_desc = ancestry(&fork_edges());
        let mut tree = TestTree::new();

        let result = tree.finalize_with_descendent_if(&11, 11, &is_desc, |_| true).unwrap();
        assert_eq!(result, FinalizationResult::Unchanged);
        assert_eq!(tree.best_finalized_number(), Some(11));
    }

    #[test]
    fn oracle_errors_propagate_verbatim() {
        let failing = |_: &u64, target: &u64| Err::<bool, _>(UnknownBlock(*target));
        let is_desc = ancestry(&fork_edges());

        let mut tree = TestTree::new();
        tree.import(10, 10, change(10, 10), &is_desc).unwrap();

        assert_matches!(
            tree.import(11, 11, change(11, 11), &failing),
            Err(Error::Client(UnknownBlock(11)))
        );
        assert_matches!(
            tree.finalize_with_descendent_if(&11, 11, &failing, |_| true),
            Err(Error::Client(UnknownBlock(11)))
        );
    }

    #[test]
    fn edges_satisfy_height_and_ancestry_invariant() {
        let is_desc = ancestry(&fork_edges());
        let mut tree = TestTree::new();

        tree.import(10, 10, change(10, 10), &is_desc).unwrap();
        tree.import(11, 11, change(11, 11), &is_desc).unwrap();
        tree.import(12, 11, change(12, 11), &is_desc).unwrap();
        tree.import(13, 12, change(13, 12), &is_desc).unwrap();

        fn check(node: &PendingChangeNode<TestPrimitives>, is_desc: &impl Fn(&u64, &u64) -> Result<bool, UnknownBlock>) {
            for child in &node.children {
                assert!(child.change.canon_height > node.change.canon_height);
                assert!(is_desc(&node.change.canon_hash, &child.change.canon_hash).unwrap());
                check(child, is_desc);
            }
        }
        for root in tree.roots() {
            check(root, &is_desc);
        }
    }

    #[test]
    fn drain_filter_actions() {
        let is_desc = ancestry(&fork_edges());
        let mut tree = TestTree::new();

        tree.import(10, 10, change(10, 10), &is_desc).unwrap();
        tree.import(11, 11, change(11, 11), &is_desc).unwrap();
        tree.import(12, 11, change(12, 11), &is_desc).unwrap();
        tree.import(13, 12, change(13, 12), &is_desc).unwrap();

        // Remove the subtree rooted at 12; keep everything else.
        let removed = tree.drain_filter(|change| {
            if change.canon_hash == 12 {
                FilterAction::Remove
            } else {
                FilterAction::KeepNode
            }
        });
        let removed: Vec<_> = removed.iter().map(|c| c.canon_hash).collect();
        assert_eq!(removed, vec![12, 13]);

        let remaining: Vec<_> = tree.pending_changes().map(|c| c.canon_hash).collect();
        assert_eq!(remaining, vec![10, 11]);

        // KeepTree stops descent: 13 would match but its subtree is skipped.
        let mut tree = TestTree::new();
        tree.import(10, 10, change(10, 10), &is_desc).unwrap();
        tree.import(12, 11, change(12, 11), &is_desc).unwrap();
        tree.import(13, 12, change(13, 12), &is_desc).unwrap();
        let removed = tree.drain_filter(|change| {
            if change.canon_hash == 10 {
                FilterAction::KeepTree
            } else {
                FilterAction::Remove
            }
        });
        assert!(removed.is_empty());
        assert_eq!(tree.pending_changes().count(), 3);
    }

    #[test]
    fn persistence_round_trip() {
        let is_desc = ancestry(&fork_edges());
        let mut tree = TestTree::new();

        tree.import(10, 10, change(10, 10), &is_desc).unwrap();
        tree.import(11, 11, change(11, 11), &is_desc).unwrap();
        tree.import(12, 11, change(12, 11), &is_desc).unwrap();

        let db = InMemoryDb::new();
        let column = ColumnId(3);
        let mut tx = Transaction::new();
        tree.prepare_transaction(&mut tx, column, b"fork_tree");
        db.commit(tx).unwrap();

        let restored = TestTree::from_db(&db, column, b"fork_tree").unwrap();
        assert_eq!(restored, tree);

        // An absent key restores an empty tree.
        let empty = TestTree::from_db(&db, column, b"missing").unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn finalization_result_scale_tags_are_stable() {
        let result: FinalizationResult<TestPrimitives> = FinalizationResult::Changed(None);
        assert_eq!(result.encode()[0], 0);
        let result: FinalizationResult<TestPrimitives> = FinalizationResult::Unchanged;
        assert_eq!(result.encode(), vec![1]);
    }
}

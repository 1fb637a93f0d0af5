use thiserror::Error;

/// Error returned by [`ChangeTree`](crate::ChangeTree) operations.
///
/// Structural errors are detected before any mutation: a tree that returns one is
/// unchanged. `E` is the descendant oracle's error type and passes through verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error<E> {
    /// The imported block hash is already present in the tree.
    #[error("duplicated hashes")]
    DuplicateHashes,
    /// Tried to import or finalize a node at or below the best finalized number.
    #[error("tried to import or finalize a node that is an ancestor of a previously finalized node")]
    Revert,
    /// Finalized a descendant of a tree node without finalizing its ancestor(s) first.
    #[error("finalized descendant of tree node without finalizing its ancestor(s) first")]
    UnfinalisedAncestor,
    /// The descendant oracle failed.
    #[error("descendant oracle failure: {0}")]
    Client(E),
}

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
//! Column-oriented key-value database abstraction.
//!
//! The consensus bookkeeping (authority change tree, leaf set) is persisted through this
//! contract: point reads, ordered iteration, and atomic write transactions. The physical
//! store behind it is the outer node's choice; [`InMemoryDb`] is the reference
//! implementation used by tests and light deployments.

mod mem;
pub use mem::InMemoryDb;

use thiserror::Error;

/// Identifier of a database column family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnId(pub u32);

/// Error produced by a database backend.
///
/// The core never inspects or retries these; they surface to the caller verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    /// The backend failed to execute the operation.
    #[error("database backend error: {0}")]
    Backend(String),
    /// A stored value failed to decode.
    #[error("stored value corrupted: {0}")]
    Corrupted(String),
}

/// A single operation inside a write transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionOp {
    /// Set the value under the given column and key.
    Set {
        /// Target column.
        column: ColumnId,
        /// Target key.
        key: Vec<u8>,
        /// Value to store.
        value: Vec<u8>,
    },
    /// Remove the value under the given column and key.
    Remove {
        /// Target column.
        column: ColumnId,
        /// Target key.
        key: Vec<u8>,
    },
}

/// An ordered batch of writes applied atomically by [`Database::commit`].
///
/// Dropping an uncommitted transaction discards it; there is no partial application.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transaction {
    ops: Vec<TransactionOp>,
}

impl Transaction {
    /// Creates an empty transaction.
    pub const fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Queues a set of `key` to `value` under `column`.
    pub fn set(&mut self, column: ColumnId, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(TransactionOp::Set { column, key: key.into(), value: value.into() });
    }

    /// Queues a removal of `key` under `column`.
    pub fn remove(&mut self, column: ColumnId, key: impl Into<Vec<u8>>) {
        self.ops.push(TransactionOp::Remove { column, key: key.into() });
    }

    /// Returns the queued operations in insertion order.
    pub fn ops(&self) -> &[TransactionOp] {
        &self.ops
    }

    /// Consumes the transaction, returning the queued operations.
    pub fn into_ops(self) -> Vec<TransactionOp> {
        self.ops
    }

    /// Returns `true` if no operations are queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Iterator over `(key, value)` pairs in ascending key order.
pub type KeyValueIter<'a> = Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

/// The database contract the consensus state is persisted through.
///
/// All methods are safe for concurrent use; atomicity is per committed [`Transaction`].
pub trait Database: Send + Sync {
    /// Returns the value stored under `column` and `key`, if any.
    fn get(&self, column: ColumnId, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError>;

    /// Returns `true` if a value is stored under `column` and `key`.
    fn contains(&self, column: ColumnId, key: &[u8]) -> Result<bool, DatabaseError> {
        Ok(self.get(column, key)?.is_some())
    }

    /// Applies all operations of the transaction atomically.
    fn commit(&self, transaction: Transaction) -> Result<(), DatabaseError>;

    /// Iterates over every entry of `column` in ascending key order.
    fn iter(&self, column: ColumnId) -> Result<KeyValueIter<'_>, DatabaseError>;

    /// Iterates over the entries of `column` whose keys start with `prefix`, in ascending
    /// key order.
    fn iter_prefix(&self, column: ColumnId, prefix: &[u8])
        -> Result<KeyValueIter<'_>, DatabaseError>;
}

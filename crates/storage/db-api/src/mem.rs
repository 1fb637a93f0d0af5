use crate::{ColumnId, Database, DatabaseError, KeyValueIter, Transaction, TransactionOp};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// An in-memory [`Database`] keeping one ordered map per column.
///
/// Commits take the single write lock, so a committed transaction is observed either in
/// full or not at all.
#[derive(Debug, Default)]
pub struct InMemoryDb {
    columns: RwLock<HashMap<ColumnId, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl InMemoryDb {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Database for InMemoryDb {
    fn get(&self, column: ColumnId, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        Ok(self.columns.read().get(&column).and_then(|col| col.get(key).cloned()))
    }

    fn commit(&self, transaction: Transaction) -> Result<(), DatabaseError> {
        let mut columns = self.columns.write();
        for op in transaction.into_ops() {
            match op {
                TransactionOp::Set { column, key, value } => {
                    columns.entry(column).or_default().insert(key, value);
                }
                TransactionOp::Remove { column, key } => {
                    if let Some(col) = columns.get_mut(&column) {
                        col.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn iter(&self, column: ColumnId) -> Result<KeyValueIter<'_>, DatabaseError> {
        let entries: Vec<_> = self
            .columns
            .read()
            .get(&column)
            .map(|col| col.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Ok(Box::new(entries.into_iter()))
    }

    fn iter_prefix(
        &self,
        column: ColumnId,
        prefix: &[u8],
    ) -> Result<KeyValueIter<'_>, DatabaseError> {
        let prefix = prefix.to_vec();
        let entries: Vec<_> = self
            .columns
            .read()
            .get(&column)
            .map(|col| {
                col.range(prefix.clone()..)
                    .take_while(|(k, _)| k.starts_with(&prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Box::new(entries.into_iter()))
    }
}

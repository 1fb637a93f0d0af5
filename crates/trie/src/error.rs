use thiserror::Error;

/// Error returned by child-trie operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrieError {
    /// The addressed child trie is absent and not scheduled for creation in the current
    /// transaction.
    #[error("child trie does not exist at key 0x{}", alloy_primitives::hex::encode(child_key))]
    ChildTrieDoesNotExist {
        /// The child key the operation addressed.
        child_key: Vec<u8>,
    },
}

impl TrieError {
    /// Shorthand constructor for [`TrieError::ChildTrieDoesNotExist`].
    pub(crate) fn missing_child(child_key: &[u8]) -> Self {
        Self::ChildTrieDoesNotExist { child_key: child_key.to_vec() }
    }
}

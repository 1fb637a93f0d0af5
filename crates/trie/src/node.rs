use codec::Encode;
use rivet_primitives::{blake2_256, Hash256};
use std::sync::{Arc, OnceLock};

/// The payload of a trie node.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum NodeKind {
    /// Terminal node holding a value.
    Leaf {
        /// The stored value.
        value: Vec<u8>,
    },
    /// Radix-16 fan-out, optionally holding a value at its own path.
    Branch {
        /// One slot per next nibble.
        children: [Option<Arc<Node>>; 16],
        /// Value stored exactly at this node's path, if any.
        value: Option<Vec<u8>>,
    },
}

/// A node of the Merkle-Patricia trie.
///
/// Nodes are immutable once shared: every mutation rebuilds the path from the root, so a
/// node's merkle hash can be cached forever.
#[derive(Debug)]
pub(crate) struct Node {
    /// Nibbles between the parent's fan-out slot and this node.
    pub(crate) partial: Vec<u8>,
    pub(crate) kind: NodeKind,
    cached_hash: OnceLock<Hash256>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.partial == other.partial && self.kind == other.kind
    }
}

impl Eq for Node {}

impl Node {
    pub(crate) fn leaf(partial: Vec<u8>, value: Vec<u8>) -> Self {
        Self { partial, kind: NodeKind::Leaf { value }, cached_hash: OnceLock::new() }
    }

    pub(crate) fn branch(
        partial: Vec<u8>,
        children: [Option<Arc<Node>>; 16],
        value: Option<Vec<u8>>,
    ) -> Self {
        Self { partial, kind: NodeKind::Branch { children, value }, cached_hash: OnceLock::new() }
    }

    /// The canonical encoding the merkle hash commits to: a tag, the partial path, the
    /// child hashes in slot order, and the value.
    pub(crate) fn encoded(&self) -> Vec<u8> {
        match &self.kind {
            NodeKind::Leaf { value } => (0u8, &self.partial, value).encode(),
            NodeKind::Branch { children, value } => {
                let child_hashes: Vec<Option<Hash256>> =
                    children.iter().map(|child| child.as_ref().map(|c| c.hash())).collect();
                (1u8, &self.partial, child_hashes, value).encode()
            }
        }
    }

    /// The merkle hash of this node, computed once.
    pub(crate) fn hash(&self) -> Hash256 {
        *self.cached_hash.get_or_init(|| Hash256::from(blake2_256(&self.encoded())))
    }
}

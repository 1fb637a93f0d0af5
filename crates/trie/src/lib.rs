#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
//! Merkle-Patricia state for block execution.
//!
//! [`StateTrie`] holds the committed state: the main trie plus the child tries addressed
//! through it. [`TrieState`] layers a stack of nested [`StorageDiff`] transactions on
//! top, so the runtime can open a storage transaction per dispatch, commit it into the
//! enclosing one, or roll it back without a trace. Committed nodes are shared
//! copy-on-write, which makes the per-block state snapshot (and the changed-node
//! tracking the pruner feeds on) a cheap root clone.
//!
//! Root-hash computation is only valid outside of transactions; asking for it with an
//! open transaction is a caller bug and panics.

mod cache;
pub use cache::{TrieCache, DEFAULT_NODE_CACHE_BYTES, DEFAULT_VALUE_CACHE_BYTES};

mod diff;
pub use diff::{DiffValue, StorageDiff};

mod error;
pub use error::TrieError;

mod nibbles;

mod node;

mod trie;
pub use trie::{empty_trie_root, StateTrie, Trie};

mod state;
pub use state::TrieState;

/// Prefix under which child-trie roots are folded into the main trie at hash time.
pub const CHILD_STORAGE_PREFIX: &[u8] = b":child_storage:";

/// Storage key of a child trie's root in the main trie.
pub(crate) fn child_storage_key(child_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(CHILD_STORAGE_PREFIX.len() + child_key.len());
    key.extend_from_slice(CHILD_STORAGE_PREFIX);
    key.extend_from_slice(child_key);
    key
}

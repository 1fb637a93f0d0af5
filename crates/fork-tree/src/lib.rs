#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
//! Fork-aware bookkeeping of pending authority-set changes.
//!
//! The finality gadget announces authority-set changes on-chain, to take effect after a
//! delay. While the chain forks, competing branches may each carry their own pending
//! change, so the changes form a forest: the [`ChangeTree`]. Changes are imported as
//! blocks arrive, queried when the node considers finalizing a block, and applied via
//! [`ChangeTree::finalize_with_descendent_if`] once a change's branch becomes canonical.
//!
//! Ancestry between blocks is never derived here; every operation takes a descendant
//! oracle backed by the block database. Oracle errors propagate to the caller unchanged.

mod change;
pub use change::{FinalizationResult, PendingChange};

mod error;
pub use error::Error;

mod tree;
pub use tree::{ChangeTree, FilterAction, PendingChangeNode, PendingChanges};

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
//! Chain-tip bookkeeping for the block DAG.
//!
//! The [`LeafSet`] tracks every block with no known descendant, keyed by height. The
//! import pipeline updates it on every block import, removal, finalization and revert,
//! and persists it in the same database transaction as the block write; when that
//! transaction aborts, the returned outcome tokens are replayed through [`Undo`] to roll
//! the in-memory set back.

mod leaves;
pub use leaves::{
    FinalizationOutcome, ImportOutcome, LeafSet, RemoveOutcome, Undo,
};

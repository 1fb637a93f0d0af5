#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
//! Commonly used types for the rivet node core.
//!
//! This crate defines the three generic axes the consensus and state subsystems are
//! parameterised over (block hash, block height, authority identifier), the canonical
//! 32-byte [`Hash256`] used by the state layer, and the blake2b-256 helper every
//! subsystem hashes with.

mod authority;
pub use authority::{Authority, AuthorityList, AuthorityPublic};

mod block;
pub use block::NumHash;

mod hash;
pub use hash::{blake2_256, Hash256};

mod traits;
pub use traits::{AuthorityId, BlockHash, BlockNumber, ChainPrimitives, RelayPrimitives};

/// Well-known storage key of the runtime code blob.
pub const CODE_KEY: &[u8] = b":code";

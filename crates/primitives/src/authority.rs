use codec::{Decode, Encode};
use core::fmt;

/// A finality authority together with its voting weight.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct Authority<Id> {
    /// The session key the authority votes with.
    pub id: Id,
    /// The relative voting weight of the authority.
    pub weight: u64,
}

impl<Id> Authority<Id> {
    /// Creates a new authority entry.
    pub const fn new(id: Id, weight: u64) -> Self {
        Self { id, weight }
    }
}

/// The ordered list of authorities entitled to finalize blocks in an era.
pub type AuthorityList<Id> = Vec<Authority<Id>>;

/// A raw 32-byte session public key.
///
/// The signature scheme behind the key lives in the keystore; the core only needs
/// equality, ordering, and the SCALE encoding.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Encode, Decode)]
pub struct AuthorityPublic(pub [u8; 32]);

impl fmt::Debug for AuthorityPublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthorityPublic(0x{})", alloy_primitives::hex::encode(self.0))
    }
}

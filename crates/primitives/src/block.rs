use codec::{Decode, Encode};

/// A block identity: its height paired with its content hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct NumHash<N, H> {
    /// The block height.
    pub number: N,
    /// The block hash.
    pub hash: H,
}

impl<N, H> NumHash<N, H> {
    /// Creates a new number/hash pair.
    pub const fn new(number: N, hash: H) -> Self {
        Self { number, hash }
    }
}

impl<N, H> From<(N, H)> for NumHash<N, H> {
    fn from((number, hash): (N, H)) -> Self {
        Self { number, hash }
    }
}

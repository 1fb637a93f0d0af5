use crate::{AuthorityPublic, Hash256};
use codec::{Decode, Encode};
use core::{
    fmt::{Debug, Display},
    hash::Hash,
    ops::{Add, Sub},
};

/// The block hash axis: an opaque content identifier with equality and a total order.
///
/// Ancestry between hashes is never derived from the hash itself; it is supplied by the
/// block database through a descendant oracle.
pub trait BlockHash:
    Copy + Eq + Ord + Hash + Debug + Display + Send + Sync + Encode + Decode + 'static
{
}

impl<T> BlockHash for T where
    T: Copy + Eq + Ord + Hash + Debug + Display + Send + Sync + Encode + Decode + 'static
{
}

/// The block height axis: an unsigned integer with the little arithmetic the trees need.
pub trait BlockNumber:
    Copy
    + Ord
    + Hash
    + Debug
    + Display
    + Send
    + Sync
    + Encode
    + Decode
    + From<u32>
    + Add<Output = Self>
    + Sub<Output = Self>
    + 'static
{
    /// The height of the genesis block.
    fn zero() -> Self {
        0u32.into()
    }

    /// The unit height step.
    fn one() -> Self {
        1u32.into()
    }
}

impl<T> BlockNumber for T where
    T: Copy
        + Ord
        + Hash
        + Debug
        + Display
        + Send
        + Sync
        + Encode
        + Decode
        + From<u32>
        + Add<Output = Self>
        + Sub<Output = Self>
        + 'static
{
}

/// The authority identifier axis, typically a session public key.
pub trait AuthorityId:
    Clone + Eq + Ord + Hash + Debug + Send + Sync + Encode + Decode + 'static
{
}

impl<T> AuthorityId for T where
    T: Clone + Eq + Ord + Hash + Debug + Send + Sync + Encode + Decode + 'static
{
}

/// Bundle of the chain-level type axes threaded through the consensus bookkeeping.
///
/// Implementations are zero-sized marker types; the bundle exists so that the authority
/// change tree and the leaf set agree on hash and height types without repeating bounds
/// at every call site.
pub trait ChainPrimitives:
    Send + Sync + Clone + Copy + Default + Debug + PartialEq + Eq + Hash + 'static
{
    /// The block hash type.
    type Hash: BlockHash;
    /// The block height type.
    type Number: BlockNumber;
    /// The authority identifier type.
    type AuthorityId: AuthorityId;
}

/// The concrete type bundle of the relay chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RelayPrimitives;

impl ChainPrimitives for RelayPrimitives {
    type Hash = Hash256;
    type Number = u32;
    type AuthorityId = AuthorityPublic;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn genesis_height<P: ChainPrimitives>() -> P::Number {
        P::Number::zero()
    }

    #[test]
    fn number_axis_arithmetic() {
        assert_eq!(genesis_height::<RelayPrimitives>(), 0u32);
        assert_eq!(u64::zero() + u64::one(), 1);
        assert_eq!(u32::one() - u32::one(), u32::zero());
    }
}

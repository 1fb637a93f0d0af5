use codec::{Decode, Encode, Error as CodecError, Input, Output};
use rivet_primitives::{AuthorityList, ChainPrimitives};

/// An authority-set change announced at a block, pending until its branch is finalized.
///
/// Only `canon_hash` and `canon_height` position the change in the tree; the remaining
/// fields are payload handed back to the caller on finalization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingChange<P: ChainPrimitives> {
    /// The authority set that takes over once the change takes effect.
    pub next_authorities: AuthorityList<P::AuthorityId>,
    /// Number of blocks after `canon_height` before the change takes effect.
    pub delay: P::Number,
    /// Height of the block that announced the change.
    pub canon_height: P::Number,
    /// Hash of the block that announced the change.
    pub canon_hash: P::Hash,
}

impl<P: ChainPrimitives> PendingChange<P> {
    /// The height at which the change takes effect.
    ///
    /// The usual finalization predicate passes once this is at or below the finalized
    /// number.
    pub fn effective_number(&self) -> P::Number {
        self.canon_height + self.delay
    }
}

impl<P: ChainPrimitives> Encode for PendingChange<P> {
    fn encode_to<T: Output + ?Sized>(&self, dest: &mut T) {
        self.next_authorities.encode_to(dest);
        self.delay.encode_to(dest);
        self.canon_height.encode_to(dest);
        self.canon_hash.encode_to(dest);
    }
}

impl<P: ChainPrimitives> Decode for PendingChange<P> {
    fn decode<I: Input>(input: &mut I) -> Result<Self, CodecError> {
        Ok(Self {
            next_authorities: Decode::decode(input)?,
            delay: Decode::decode(input)?,
            canon_height: Decode::decode(input)?,
            canon_hash: Decode::decode(input)?,
        })
    }
}

/// Outcome of finalizing a block against the change tree.
///
/// Encoded with stable integer tags: `0` for [`Changed`](Self::Changed), `1` for
/// [`Unchanged`](Self::Unchanged).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinalizationResult<P: ChainPrimitives> {
    /// The tree changed: a change was finalized (carried here), or pruning removed
    /// nodes that can no longer become canonical.
    Changed(Option<PendingChange<P>>),
    /// The tree is untouched.
    Unchanged,
}

impl<P: ChainPrimitives> Encode for FinalizationResult<P> {
    fn encode_to<T: Output + ?Sized>(&self, dest: &mut T) {
        match self {
            Self::Changed(change) => {
                dest.push_byte(0);
                change.encode_to(dest);
            }
            Self::Unchanged => dest.push_byte(1),
        }
    }
}

impl<P: ChainPrimitives> Decode for FinalizationResult<P> {
    fn decode<I: Input>(input: &mut I) -> Result<Self, CodecError> {
        match input.read_byte()? {
            0 => Ok(Self::Changed(Decode::decode(input)?)),
            1 => Ok(Self::Unchanged),
            _ => Err("unexpected finalization result variant".into()),
        }
    }
}

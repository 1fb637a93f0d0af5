use alloy_primitives::B256;
use blake2::{digest::consts::U32, Blake2b, Digest};
use codec::{Decode, Encode, Error as CodecError, Input, Output};
use core::fmt;
use derive_more::{AsRef, Deref, From};

/// The canonical 32-byte block and state hash.
///
/// A thin wrapper around [`B256`] that carries the SCALE [`Encode`]/[`Decode`]
/// implementations required by the persistence layer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, AsRef, Deref, From)]
pub struct Hash256(pub B256);

impl Hash256 {
    /// The all-zero hash.
    pub const ZERO: Self = Self(B256::ZERO);

    /// Returns a hash with every byte set to `byte`.
    pub const fn repeat_byte(byte: u8) -> Self {
        Self(B256::repeat_byte(byte))
    }

    /// Returns the hash as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(B256::from(bytes))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Encode for Hash256 {
    fn size_hint(&self) -> usize {
        32
    }

    fn encode_to<T: Output + ?Sized>(&self, dest: &mut T) {
        dest.write(self.0.as_slice())
    }
}

impl codec::EncodeLike for Hash256 {}

impl Decode for Hash256 {
    fn decode<I: Input>(input: &mut I) -> Result<Self, CodecError> {
        let mut bytes = [0u8; 32];
        input.read(&mut bytes)?;
        Ok(Self(B256::from(bytes)))
    }
}

/// Computes the blake2b-256 hash of the given bytes.
pub fn blake2_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_scale_round_trip() {
        let hash = Hash256::repeat_byte(0xab);
        let encoded = hash.encode();
        assert_eq!(encoded.len(), 32);
        assert_eq!(Hash256::decode(&mut &encoded[..]).unwrap(), hash);
    }

    #[test]
    fn blake2_is_deterministic_and_length_sensitive() {
        assert_eq!(blake2_256(b"rivet"), blake2_256(b"rivet"));
        assert_ne!(blake2_256(b"rivet"), blake2_256(b"rivet\0"));
        assert_ne!(blake2_256(&[]), [0u8; 32]);
    }
}

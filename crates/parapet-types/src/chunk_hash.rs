use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A 32-byte content address: SHA-256 of a chunk's plaintext.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkHash(pub [u8; 32]);

impl ChunkHash {
    /// Hash a plaintext chunk.
    pub fn compute(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        ChunkHash(out)
    }

    /// Hex-encode the full hash for use as a storage key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-char hex string back into a hash.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(ChunkHash(arr))
    }

    /// First byte as a two-char hex string, used for the outer shard directory.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Second byte as a two-char hex string, used for the inner shard directory.
    pub fn subshard_prefix(&self) -> String {
        hex::encode(&self.0[1..2])
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_deterministic() {
        let h1 = ChunkHash::compute(b"hello world");
        let h2 = ChunkHash::compute(b"hello world");
        assert_eq!(h1, h2);
    }

    #[test]
    fn compute_different_data_different_hash() {
        assert_ne!(ChunkHash::compute(b"hello"), ChunkHash::compute(b"world"));
    }

    #[test]
    fn known_sha256_vector() {
        // SHA-256("abc")
        let h = ChunkHash::compute(b"abc");
        assert_eq!(
            h.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn hex_roundtrip() {
        let h = ChunkHash::compute(b"roundtrip");
        assert_eq!(ChunkHash::from_hex(&h.to_hex()), Some(h));
        assert_eq!(ChunkHash::from_hex("zz"), None);
        assert_eq!(ChunkHash::from_hex("abcd"), None);
    }

    #[test]
    fn shard_prefixes_are_leading_bytes() {
        let mut raw = [0u8; 32];
        raw[0] = 0xAB;
        raw[1] = 0xCD;
        let h = ChunkHash(raw);
        assert_eq!(h.shard_prefix(), "ab");
        assert_eq!(h.subshard_prefix(), "cd");
    }

    #[test]
    fn serde_roundtrip() {
        let h = ChunkHash::compute(b"serde");
        let bytes = rmp_serde::to_vec(&h).unwrap();
        let back: ChunkHash = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(h, back);
    }
}

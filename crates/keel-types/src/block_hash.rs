use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use std::fmt;

type Blake2b256 = Blake2b<U32>;

/// A 32-byte content hash (BLAKE2b-256). Identifies blocks and blocksets.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// Hash a block of raw content.
    pub fn compute(data: &[u8]) -> Self {
        let digest = Blake2b256::digest(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        BlockHash(out)
    }

    /// Combined hash of an ordered sequence of block hashes.
    ///
    /// Pure function of the input order: the same blocks in the same order
    /// always produce the same blockset identity.
    pub fn combine<'a>(hashes: impl IntoIterator<Item = &'a BlockHash>) -> Self {
        let mut hasher = Blake2b256::new();
        for hash in hashes {
            hasher.update(hash.0);
        }
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        BlockHash(out)
    }

    /// Hex-encode the full hash.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a hash from a 64-character hex string.
    pub fn from_hex(hex_str: &str) -> std::result::Result<Self, String> {
        let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex: {e}"))?;
        if bytes.len() != 32 {
            return Err(format!("expected 32 bytes, got {}", bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(BlockHash(arr))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

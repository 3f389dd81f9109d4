//! Commit Diff Encoding
//!
//! A diff carries one commit's own changes on one shard.
//! Format: `[lz4(bincode(Diff)): bytes][checksum: u32 LE]`

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{CommitInfo, ShardNumber};

/// A path's state as written by one commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entry {
    File(Vec<u8>),
    Dir,
    /// Hides the path inherited from the parent commit
    Deleted,
}

/// Everything a commit changed on one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub shard: ShardNumber,
    pub info: CommitInfo,
    pub entries: Vec<(String, Entry)>,
}

impl Diff {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let serialized = bincode::serialize(self)?;
        let mut data = lz4_flex::compress_prepend_size(&serialized);
        let checksum = crc32fast::hash(&data);
        data.extend_from_slice(&checksum.to_le_bytes());
        Ok(data)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::Storage("diff too short".into()));
        }
        let (data, checksum_bytes) = bytes.split_at(bytes.len() - 4);
        let mut stored = [0u8; 4];
        stored.copy_from_slice(checksum_bytes);
        if u32::from_le_bytes(stored) != crc32fast::hash(data) {
            return Err(Error::Storage("diff checksum mismatch".into()));
        }
        let serialized = lz4_flex::decompress_size_prepended(data)
            .map_err(|e| Error::Storage(format!("Decompression failed: {}", e)))?;
        Ok(bincode::deserialize(&serialized)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Commit, CommitType};

    fn sample() -> Diff {
        Diff {
            shard: 3,
            info: CommitInfo {
                commit: Commit::new("repo", "c2"),
                commit_type: CommitType::Read,
                parent: Some(Commit::new("repo", "c1")),
            },
            entries: vec![
                ("a".into(), Entry::Dir),
                ("a/b".into(), Entry::File(b"hello".to_vec())),
                ("old".into(), Entry::Deleted),
            ],
        }
    }

    #[test]
    fn test_decode_encoded() {
        let diff = sample();
        assert_eq!(Diff::decode(&diff.encode().unwrap()).unwrap(), diff);
    }

    #[test]
    fn test_corruption_detected() {
        let mut bytes = sample().encode().unwrap();
        bytes[0] ^= 0xff;
        assert!(Diff::decode(&bytes).is_err());
        assert!(Diff::decode(&[1, 2]).is_err());
    }
}

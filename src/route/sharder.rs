//! CRC32 path sharder

use super::Sharder;
use crate::error::{Error, Result};
use crate::types::{File, ShardNumber};

/// Hashes the file path modulo the shard count
#[derive(Debug, Clone)]
pub struct HashSharder {
    shard_count: u64,
}

impl HashSharder {
    pub fn new(shard_count: u64) -> Result<Self> {
        if shard_count == 0 {
            return Err(Error::Config("shard count must be positive".into()));
        }
        Ok(Self { shard_count })
    }

    pub fn shard_count(&self) -> u64 {
        self.shard_count
    }
}

impl Sharder for HashSharder {
    fn shard_for(&self, file: &File) -> Result<ShardNumber> {
        Ok(crc32fast::hash(file.path.as_bytes()) as u64 % self.shard_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Commit;

    #[test]
    fn test_deterministic_and_in_range() {
        let sharder = HashSharder::new(16).unwrap();
        for path in ["a", "a/b", "dir/file.txt", ""] {
            let file = File::new(Commit::new("repo", "c1"), path);
            let shard = sharder.shard_for(&file).unwrap();
            assert!(shard < 16);
            assert_eq!(shard, sharder.shard_for(&file).unwrap());
        }
    }

    #[test]
    fn test_independent_of_commit() {
        let sharder = HashSharder::new(7).unwrap();
        let a = File::new(Commit::new("repo", "c1"), "x/y");
        let b = File::new(Commit::new("other", "c9"), "x/y");
        assert_eq!(sharder.shard_for(&a).unwrap(), sharder.shard_for(&b).unwrap());
    }

    #[test]
    fn test_zero_shards_rejected() {
        assert!(HashSharder::new(0).is_err());
    }
}

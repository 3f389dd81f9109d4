//! Repository, commit and file model
//!
//! These are the values that flow through the request router, the driver
//! and the wire protocol. They are plain data: identity is structural.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Shard number in `[0, shard_count)`
pub type ShardNumber = u64;

/// Ordered set of shards; "any one shard" means the first element
pub type ShardSet = BTreeSet<ShardNumber>;

/// A named collection of commits
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Repo {
    pub name: String,
}

impl Repo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A commit within a repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Commit {
    pub repo: Repo,
    pub id: String,
}

impl Commit {
    pub fn new(repo: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            repo: Repo::new(repo),
            id: id.into(),
        }
    }
}

impl fmt::Display for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.repo, self.id)
    }
}

/// A path inside a commit
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct File {
    pub commit: Commit,
    pub path: String,
}

impl File {
    pub fn new(commit: Commit, path: impl Into<String>) -> Self {
        Self {
            commit,
            path: path.into(),
        }
    }

    /// Paths with a leading separator hash to a different shard than the
    /// same path without one, yet name the same entry once joined.
    pub fn has_leading_slash(&self) -> bool {
        self.path.starts_with('/')
    }
}

impl fmt::Display for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.commit, self.path)
    }
}

/// Whether a file holds bytes or other files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    Regular,
    Dir,
}

/// Open commits accept writes; finished commits are read-only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitType {
    /// Open, accepts file writes
    Write,
    /// Finished, sealed
    Read,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInfo {
    pub repo: Repo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub commit: Commit,
    pub commit_type: CommitType,
    pub parent: Option<Commit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file: File,
    pub file_type: FileType,
    pub size_bytes: u64,
    /// Commit that last wrote this entry
    pub commit_modified: Commit,
}

/// Congruence-class filter over shard numbers
///
/// Lets independent listers split one shard set without overlap: lister `k`
/// of `m` sees only shards where `shard % m == k`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardFilter {
    pub number: u64,
    pub modulo: u64,
}

impl Default for ShardFilter {
    fn default() -> Self {
        Self { number: 0, modulo: 1 }
    }
}

impl ShardFilter {
    pub fn new(number: u64, modulo: u64) -> Self {
        Self { number, modulo }
    }

    /// A zero modulo selects nothing meaningful and is rejected
    pub fn validate(&self) -> crate::Result<()> {
        if self.modulo == 0 {
            return Err(crate::Error::InvalidShardFilter {
                number: self.number,
                modulo: self.modulo,
            });
        }
        Ok(())
    }

    pub fn matches(&self, shard: ShardNumber) -> bool {
        shard % self.modulo == self.number
    }

    /// Keep only the shards this filter selects
    pub fn apply(&self, shards: &ShardSet) -> ShardSet {
        shards.iter().copied().filter(|s| self.matches(*s)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_slash() {
        let commit = Commit::new("repo", "c1");
        assert!(File::new(commit.clone(), "/a/b").has_leading_slash());
        assert!(!File::new(commit, "a/b").has_leading_slash());
    }

    #[test]
    fn test_shard_filter_partitions() {
        let shards: ShardSet = (0..10).collect();
        let mut union = ShardSet::new();
        for k in 0..3 {
            let part = ShardFilter::new(k, 3).apply(&shards);
            assert!(part.iter().all(|s| s % 3 == k));
            assert!(union.is_disjoint(&part));
            union.extend(part);
        }
        assert_eq!(union, shards);
        assert_eq!(ShardFilter::default().apply(&shards), shards);
    }

    #[test]
    fn test_zero_modulo_rejected() {
        assert!(ShardFilter::new(0, 0).validate().is_err());
        assert!(ShardFilter::new(1, 2).validate().is_ok());
    }
}

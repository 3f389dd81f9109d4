//! Storage Driver Module
//!
//! The storage engine capability set. The request router never touches
//! storage except through this trait.

pub mod diff;
mod memory;

pub use diff::{Diff, Entry};
pub use memory::MemoryDriver;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

use crate::error::Result;
use crate::types::{
    Commit, CommitInfo, File, FileInfo, Repo, RepoInfo, ShardNumber, ShardSet,
};

/// Readable, seekable file content handed out by `Driver::file_get`
pub trait FileReader: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> FileReader for T {}

/// Content-addressed storage engine, one partition per shard
#[async_trait]
pub trait Driver: Send + Sync {
    /// Create a repository on every shard the driver stores
    async fn repo_create(&self, repo: &Repo) -> Result<()>;

    /// Create a repository on one shard; a no-op where it already exists
    async fn repo_ensure(&self, repo: &Repo, shard: ShardNumber) -> Result<()>;

    async fn repo_inspect(&self, repo: &Repo, shard: ShardNumber) -> Result<RepoInfo>;

    async fn repo_list(&self, shard: ShardNumber) -> Result<Vec<RepoInfo>>;

    async fn repo_delete(&self, repo: &Repo, shards: &ShardSet) -> Result<()>;

    async fn commit_start(
        &self,
        parent: Option<&Commit>,
        commit: Option<&Commit>,
        shards: &ShardSet,
    ) -> Result<Commit>;

    async fn commit_finish(&self, commit: &Commit, shards: &ShardSet) -> Result<()>;

    async fn commit_inspect(&self, commit: &Commit, shard: ShardNumber) -> Result<CommitInfo>;

    /// Commits in creation order
    async fn commit_list(&self, repo: &Repo, shard: ShardNumber) -> Result<Vec<CommitInfo>>;

    async fn commit_delete(&self, commit: &Commit, shards: &ShardSet) -> Result<()>;

    async fn make_directory(&self, file: &File, shards: &ShardSet) -> Result<()>;

    async fn file_put(
        &self,
        file: &File,
        shard: ShardNumber,
        offset_bytes: u64,
        value: &[u8],
    ) -> Result<()>;

    async fn file_get(&self, file: &File, shard: ShardNumber) -> Result<Box<dyn FileReader>>;

    async fn file_inspect(&self, file: &File, shard: ShardNumber) -> Result<FileInfo>;

    /// Direct children of the directory `file`
    async fn file_list(&self, file: &File, shard: ShardNumber) -> Result<Vec<FileInfo>>;

    async fn file_delete(&self, file: &File, shard: ShardNumber) -> Result<()>;

    /// Write everything `commit` changed on `shard` to `sink`
    async fn diff_pull(
        &self,
        commit: &Commit,
        shard: ShardNumber,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()>;

    /// Apply a diff produced by `diff_pull`; the diff names its own shard
    async fn diff_push(&self, commit: &Commit, source: &mut (dyn AsyncRead + Send + Unpin))
        -> Result<()>;
}

//! Internal API
//!
//! The request/response surface every node exposes. The same trait is
//! implemented by the local request router and by the remote client, so a
//! replica connection handle is simply an `Arc<dyn InternalApi>`.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::TryStreamExt;

use crate::error::Result;
use crate::types::{
    Commit, CommitInfo, File, FileInfo, FileType, Repo, RepoInfo, ShardFilter, ShardNumber,
};

/// Finite, non-restartable sequence of byte chunks
///
/// The stream owns whatever resource produces the bytes (a file reader, a
/// TCP connection); dropping it early releases that resource.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Repository, commit, file and replication operations
#[async_trait]
pub trait InternalApi: Send + Sync {
    async fn repo_create(&self, repo: &Repo) -> Result<()>;

    async fn repo_inspect(&self, repo: &Repo) -> Result<RepoInfo>;

    async fn repo_list(&self) -> Result<Vec<RepoInfo>>;

    async fn repo_delete(&self, repo: &Repo) -> Result<()>;

    /// Start a commit. `parent` or `commit` names the repository; a commit
    /// without an id gets one from the driver.
    async fn commit_start(&self, parent: Option<&Commit>, commit: Option<&Commit>)
        -> Result<Commit>;

    /// Finish a commit and propagate it to every backup replica
    async fn commit_finish(&self, commit: &Commit) -> Result<()>;

    async fn commit_inspect(&self, commit: &Commit) -> Result<CommitInfo>;

    async fn commit_list(&self, repo: &Repo) -> Result<Vec<CommitInfo>>;

    async fn commit_delete(&self, commit: &Commit) -> Result<()>;

    async fn file_put(
        &self,
        file: &File,
        file_type: FileType,
        offset_bytes: u64,
        value: Bytes,
    ) -> Result<()>;

    /// Read `[offset_bytes, offset_bytes + size_bytes)`, clipped to the file
    async fn file_get(&self, file: &File, offset_bytes: u64, size_bytes: u64)
        -> Result<ByteStream>;

    async fn file_inspect(&self, file: &File) -> Result<FileInfo>;

    async fn file_list(&self, file: &File, filter: Option<ShardFilter>) -> Result<Vec<FileInfo>>;

    async fn file_delete(&self, file: &File) -> Result<()>;

    /// Stream the diff of `commit` on `shard`
    async fn pull_diff(&self, commit: &Commit, shard: ShardNumber) -> Result<ByteStream>;

    /// Apply a diff to a replica shard
    async fn push_diff(&self, commit: &Commit, shard: ShardNumber, value: Bytes) -> Result<()>;
}

/// Drain a byte stream into one buffer
pub async fn collect_bytes(stream: ByteStream) -> Result<Bytes> {
    let buffer = stream
        .try_fold(BytesMut::new(), |mut buffer, chunk| async move {
            buffer.extend_from_slice(&chunk);
            Ok(buffer)
        })
        .await?;
    Ok(buffer.freeze())
}

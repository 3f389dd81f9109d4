//! Internal API Server
//!
//! Resolves every operation to the shard(s) that must serve it and runs it
//! against the local driver. Writes go to master shards only; reads accept
//! any locally served shard.

mod replication;

pub use replication::assume_role;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::api::{ByteStream, InternalApi};
use crate::drive::Driver;
use crate::error::{Error, Result};
use crate::route::{Router, Sharder};
use crate::types::{
    Commit, CommitInfo, File, FileInfo, FileType, Repo, RepoInfo, ShardFilter, ShardNumber,
    ShardSet,
};

/// Default size of streamed chunks
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Request router and replication endpoint for one node
pub struct InternalApiServer {
    sharder: Arc<dyn Sharder>,
    router: Arc<dyn Router>,
    driver: Arc<dyn Driver>,
    chunk_size: usize,
}

impl InternalApiServer {
    pub fn new(sharder: Arc<dyn Sharder>, router: Arc<dyn Router>, driver: Arc<dyn Driver>) -> Self {
        Self {
            sharder,
            router,
            driver,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Set the size of chunks in streamed responses
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Lowest locally served shard, for operations any shard can answer
    async fn any_shard(&self, operation: &'static str) -> Result<ShardNumber> {
        self.router
            .all_shards()
            .await?
            .first()
            .copied()
            .ok_or(Error::NoLocalShards { operation })
    }

    async fn all_shards(&self, operation: &'static str) -> Result<ShardSet> {
        non_empty(self.router.all_shards().await?, operation)
    }

    async fn master_shards(&self, operation: &'static str) -> Result<ShardSet> {
        non_empty(self.router.master_shards().await?, operation)
    }

    /// Hashed shard for a file, which must be mastered here
    async fn master_shard_for(&self, file: &File) -> Result<ShardNumber> {
        let shard = self.sharder.shard_for(file)?;
        if !self.router.master_shards().await?.contains(&shard) {
            return Err(Error::ShardNotLocal(shard));
        }
        Ok(shard)
    }

    /// Hashed shard for a file, served here in either role
    async fn shard_for(&self, file: &File) -> Result<ShardNumber> {
        let shard = self.sharder.shard_for(file)?;
        if !self.router.all_shards().await?.contains(&shard) {
            return Err(Error::ShardNotLocal(shard));
        }
        Ok(shard)
    }
}

fn non_empty(shards: ShardSet, operation: &'static str) -> Result<ShardSet> {
    if shards.is_empty() {
        return Err(Error::NoLocalShards { operation });
    }
    Ok(shards)
}

fn reject_leading_slash(file: &File) -> Result<()> {
    // "foo" and "/foo" hash to different shards but name the same entry
    // once joined under a base directory.
    if file.has_leading_slash() {
        return Err(Error::LeadingSlash(file.path.clone()));
    }
    Ok(())
}

/// Merge per-shard listings, keeping the first occurrence of each directory
fn merge_listings(listings: Vec<Vec<FileInfo>>) -> Vec<FileInfo> {
    let mut seen_directories = HashSet::new();
    let mut merged = Vec::new();
    for info in listings.into_iter().flatten() {
        if info.file_type == FileType::Dir && !seen_directories.insert(info.file.path.clone()) {
            continue;
        }
        merged.push(info);
    }
    merged
}

#[async_trait]
impl InternalApi for InternalApiServer {
    async fn repo_create(&self, repo: &Repo) -> Result<()> {
        self.driver.repo_create(repo).await?;
        tracing::info!("Created repository {}", repo);
        Ok(())
    }

    async fn repo_inspect(&self, repo: &Repo) -> Result<RepoInfo> {
        let shard = self.any_shard("RepoInspect").await?;
        self.driver.repo_inspect(repo, shard).await
    }

    async fn repo_list(&self) -> Result<Vec<RepoInfo>> {
        let shard = self.any_shard("RepoList").await?;
        self.driver.repo_list(shard).await
    }

    async fn repo_delete(&self, repo: &Repo) -> Result<()> {
        let shards = self.all_shards("RepoDelete").await?;
        self.driver.repo_delete(repo, &shards).await?;
        tracing::info!("Deleted repository {} from {} shards", repo, shards.len());
        Ok(())
    }

    async fn commit_start(
        &self,
        parent: Option<&Commit>,
        commit: Option<&Commit>,
    ) -> Result<Commit> {
        match (parent, commit) {
            (None, None) => {
                return Err(Error::InvalidRequest("commit start needs a repository".into()))
            }
            (Some(p), Some(c)) if p.repo != c.repo => {
                return Err(Error::InvalidRequest(format!(
                    "parent {} is not in repository {}",
                    p, c.repo
                )))
            }
            _ => {}
        }
        let shards = self.master_shards("CommitStart").await?;
        let started = self.driver.commit_start(parent, commit, &shards).await?;
        tracing::debug!("Started commit {} on {} shards", started, shards.len());
        Ok(started)
    }

    async fn commit_finish(&self, commit: &Commit) -> Result<()> {
        let shards = self.master_shards("CommitFinish").await?;
        self.driver.commit_finish(commit, &shards).await?;
        tracing::debug!("Finished commit {} on {} shards", commit, shards.len());
        self.commit_to_replicas(commit).await
    }

    async fn commit_inspect(&self, commit: &Commit) -> Result<CommitInfo> {
        let shard = self.any_shard("CommitInspect").await?;
        self.driver.commit_inspect(commit, shard).await
    }

    async fn commit_list(&self, repo: &Repo) -> Result<Vec<CommitInfo>> {
        let shard = self.any_shard("CommitList").await?;
        self.driver.commit_list(repo, shard).await
    }

    async fn commit_delete(&self, commit: &Commit) -> Result<()> {
        let shards = self.master_shards("CommitDelete").await?;
        self.driver.commit_delete(commit, &shards).await
    }

    async fn file_put(
        &self,
        file: &File,
        file_type: FileType,
        offset_bytes: u64,
        value: Bytes,
    ) -> Result<()> {
        reject_leading_slash(file)?;
        if file_type == FileType::Dir {
            if !value.is_empty() {
                return Err(Error::DirectoryWithValue);
            }
            let shards = self.master_shards("FilePut").await?;
            return self.driver.make_directory(file, &shards).await;
        }
        let shard = self.master_shard_for(file).await?;
        tracing::trace!("FilePut {} -> shard {}", file, shard);
        self.driver.file_put(file, shard, offset_bytes, &value).await
    }

    async fn file_get(
        &self,
        file: &File,
        offset_bytes: u64,
        size_bytes: u64,
    ) -> Result<ByteStream> {
        let shard = self.shard_for(file).await?;
        let mut reader = self.driver.file_get(file, shard).await?;
        reader.seek(std::io::SeekFrom::Start(offset_bytes)).await?;
        // The stream owns the reader; it is released when the stream ends or is dropped
        let section = reader.take(size_bytes);
        Ok(ReaderStream::with_capacity(section, self.chunk_size)
            .map(|chunk| chunk.map_err(Error::from))
            .boxed())
    }

    async fn file_inspect(&self, file: &File) -> Result<FileInfo> {
        let shard = self.shard_for(file).await?;
        self.driver.file_inspect(file, shard).await
    }

    async fn file_list(&self, file: &File, filter: Option<ShardFilter>) -> Result<Vec<FileInfo>> {
        let filter = filter.unwrap_or_default();
        filter.validate()?;
        let shards = filter.apply(&self.master_shards("FileList").await?);

        let mut listings = Vec::with_capacity(shards.len());
        for shard in shards {
            listings.push(self.driver.file_list(file, shard).await?);
        }
        Ok(merge_listings(listings))
    }

    async fn file_delete(&self, file: &File) -> Result<()> {
        reject_leading_slash(file)?;
        let shard = self.master_shard_for(file).await?;
        self.driver.file_delete(file, shard).await
    }

    async fn pull_diff(&self, commit: &Commit, shard: ShardNumber) -> Result<ByteStream> {
        self.serve_pull_diff(commit, shard).await
    }

    async fn push_diff(&self, commit: &Commit, shard: ShardNumber, value: Bytes) -> Result<()> {
        self.serve_push_diff(commit, shard, value).await
    }
}

//! In-Memory Driver
//!
//! Keeps every shard partition in process memory. Each commit stores only
//! the paths it wrote; reads walk the parent chain, so a diff is exactly a
//! commit's own entries.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::RwLock;

use super::diff::{Diff, Entry};
use super::{Driver, FileReader};
use crate::error::{Error, Result};
use crate::types::{
    Commit, CommitInfo, CommitType, File, FileInfo, FileType, Repo, RepoInfo, ShardNumber,
    ShardSet,
};

struct CommitState {
    info: CommitInfo,
    entries: BTreeMap<String, Entry>,
}

#[derive(Default)]
struct RepoState {
    /// Creation order
    commits: Vec<CommitState>,
}

impl RepoState {
    fn get(&self, id: &str) -> Option<&CommitState> {
        self.commits.iter().find(|c| c.info.commit.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut CommitState> {
        self.commits.iter_mut().find(|c| c.info.commit.id == id)
    }
}

#[derive(Default)]
struct ShardState {
    repos: BTreeMap<String, RepoState>,
}

impl ShardState {
    fn repo(&self, repo: &Repo) -> Result<&RepoState> {
        self.repos
            .get(&repo.name)
            .ok_or_else(|| Error::RepoNotFound(repo.name.clone()))
    }

    fn repo_mut(&mut self, repo: &Repo) -> Result<&mut RepoState> {
        self.repos
            .get_mut(&repo.name)
            .ok_or_else(|| Error::RepoNotFound(repo.name.clone()))
    }

    fn commit(&self, commit: &Commit) -> Result<&CommitState> {
        self.repo(&commit.repo)?
            .get(&commit.id)
            .ok_or_else(|| commit_not_found(commit))
    }

    /// Commit that accepts writes
    fn open_commit_mut(&mut self, commit: &Commit) -> Result<&mut CommitState> {
        let state = self
            .repo_mut(&commit.repo)?
            .get_mut(&commit.id)
            .ok_or_else(|| commit_not_found(commit))?;
        if state.info.commit_type == CommitType::Read {
            return Err(Error::CommitFinished {
                repo: commit.repo.name.clone(),
                id: commit.id.clone(),
            });
        }
        Ok(state)
    }

    /// Find the newest entry for `path`, walking from `commit` to its ancestors
    fn resolve(&self, commit: &Commit, path: &str) -> Result<Option<(&Entry, &Commit)>> {
        let repo = self.repo(&commit.repo)?;
        let mut current = Some(
            repo.get(&commit.id)
                .ok_or_else(|| commit_not_found(commit))?,
        );
        while let Some(state) = current {
            if let Some(entry) = state.entries.get(path) {
                return Ok(match entry {
                    Entry::Deleted => None,
                    entry => Some((entry, &state.info.commit)),
                });
            }
            current = state.info.parent.as_ref().and_then(|p| repo.get(&p.id));
        }
        Ok(None)
    }

    fn file_info(&self, file: &File) -> Result<FileInfo> {
        match self.resolve(&file.commit, &file.path)? {
            Some((entry, modified)) => Ok(make_info(file.clone(), entry, modified)),
            None => Err(Error::FileNotFound(file.to_string())),
        }
    }
}

fn commit_not_found(commit: &Commit) -> Error {
    Error::CommitNotFound {
        repo: commit.repo.name.clone(),
        id: commit.id.clone(),
    }
}

fn make_info(file: File, entry: &Entry, modified: &Commit) -> FileInfo {
    let (file_type, size_bytes) = match entry {
        Entry::File(data) => (FileType::Regular, data.len() as u64),
        _ => (FileType::Dir, 0),
    };
    FileInfo {
        file,
        file_type,
        size_bytes,
        commit_modified: modified.clone(),
    }
}

fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Record every ancestor directory of `path` in the commit
fn ensure_parents(entries: &mut BTreeMap<String, Entry>, path: &str) {
    let mut dir = parent_dir(path);
    while !dir.is_empty() {
        match entries.get(dir) {
            Some(Entry::Dir) => {}
            _ => {
                entries.insert(dir.to_string(), Entry::Dir);
            }
        }
        dir = parent_dir(dir);
    }
}

/// Largest file a put may produce
pub const MAX_FILE_SIZE: u64 = 128 * 1024 * 1024;

/// File content handed to a reader, counted until the reader is dropped
struct OpenFile {
    content: Cursor<Vec<u8>>,
    open: Arc<AtomicU64>,
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::Relaxed);
    }
}

impl AsyncRead for OpenFile {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().content).poll_read(cx, buf)
    }
}

impl AsyncSeek for OpenFile {
    fn start_seek(self: Pin<&mut Self>, position: std::io::SeekFrom) -> std::io::Result<()> {
        Pin::new(&mut self.get_mut().content).start_seek(position)
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        Pin::new(&mut self.get_mut().content).poll_complete(cx)
    }
}

/// Driver storing all shard partitions in memory
pub struct MemoryDriver {
    shard_count: u64,
    shards: RwLock<HashMap<ShardNumber, ShardState>>,
    mutations: AtomicU64,
    open_files: Arc<AtomicU64>,
}

impl MemoryDriver {
    pub fn new(shard_count: u64) -> Self {
        Self {
            shard_count,
            shards: RwLock::new(HashMap::new()),
            mutations: AtomicU64::new(0),
            open_files: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of successful mutating calls so far
    pub fn mutations(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    /// Readers handed out by `file_get` that have not been dropped yet
    pub fn open_files(&self) -> u64 {
        self.open_files.load(Ordering::Relaxed)
    }

    fn record_mutation(&self) {
        self.mutations.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn repo_create(&self, repo: &Repo) -> Result<()> {
        let mut shards = self.shards.write().await;
        for shard in 0..self.shard_count {
            if shards
                .get(&shard)
                .is_some_and(|s| s.repos.contains_key(&repo.name))
            {
                return Err(Error::RepoExists(repo.name.clone()));
            }
        }
        for shard in 0..self.shard_count {
            shards
                .entry(shard)
                .or_default()
                .repos
                .insert(repo.name.clone(), RepoState::default());
        }
        self.record_mutation();
        tracing::debug!("Created repository {} on {} shards", repo, self.shard_count);
        Ok(())
    }

    async fn repo_ensure(&self, repo: &Repo, shard: ShardNumber) -> Result<()> {
        if shard >= self.shard_count {
            return Err(Error::InvalidRequest(format!(
                "shard {} out of range (shard count {})",
                shard, self.shard_count
            )));
        }
        let mut shards = self.shards.write().await;
        let repos = &mut shards.entry(shard).or_default().repos;
        if !repos.contains_key(&repo.name) {
            repos.insert(repo.name.clone(), RepoState::default());
            self.record_mutation();
            tracing::debug!("Created repository {} on shard {}", repo, shard);
        }
        Ok(())
    }

    async fn repo_inspect(&self, repo: &Repo, shard: ShardNumber) -> Result<RepoInfo> {
        let shards = self.shards.read().await;
        shards
            .get(&shard)
            .ok_or_else(|| Error::RepoNotFound(repo.name.clone()))?
            .repo(repo)?;
        Ok(RepoInfo { repo: repo.clone() })
    }

    async fn repo_list(&self, shard: ShardNumber) -> Result<Vec<RepoInfo>> {
        let shards = self.shards.read().await;
        Ok(shards
            .get(&shard)
            .map(|s| {
                s.repos
                    .keys()
                    .map(|name| RepoInfo { repo: Repo::new(name.clone()) })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn repo_delete(&self, repo: &Repo, shards: &ShardSet) -> Result<()> {
        let mut state = self.shards.write().await;
        for shard in shards {
            state
                .get(shard)
                .ok_or_else(|| Error::RepoNotFound(repo.name.clone()))?
                .repo(repo)?;
        }
        for shard in shards {
            if let Some(s) = state.get_mut(shard) {
                s.repos.remove(&repo.name);
            }
        }
        self.record_mutation();
        Ok(())
    }

    async fn commit_start(
        &self,
        parent: Option<&Commit>,
        commit: Option<&Commit>,
        shards: &ShardSet,
    ) -> Result<Commit> {
        let repo = match (commit, parent) {
            (Some(c), _) => c.repo.clone(),
            (None, Some(p)) => p.repo.clone(),
            (None, None) => {
                return Err(Error::InvalidRequest("commit start needs a repository".into()))
            }
        };
        let id = commit
            .map(|c| c.id.clone())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let new_commit = Commit { repo, id };

        let mut state = self.shards.write().await;
        for shard in shards {
            let shard_state = state
                .get(shard)
                .ok_or_else(|| Error::RepoNotFound(new_commit.repo.name.clone()))?;
            let repo_state = shard_state.repo(&new_commit.repo)?;
            if repo_state.get(&new_commit.id).is_some() {
                return Err(Error::Storage(format!("commit {} already exists", new_commit)));
            }
            if let Some(p) = parent {
                shard_state.commit(p)?;
            }
        }
        for shard in shards {
            if let Some(repo_state) = state
                .get_mut(shard)
                .and_then(|s| s.repos.get_mut(&new_commit.repo.name))
            {
                repo_state.commits.push(CommitState {
                    info: CommitInfo {
                        commit: new_commit.clone(),
                        commit_type: CommitType::Write,
                        parent: parent.cloned(),
                    },
                    entries: BTreeMap::new(),
                });
            }
        }
        self.record_mutation();
        Ok(new_commit)
    }

    async fn commit_finish(&self, commit: &Commit, shards: &ShardSet) -> Result<()> {
        let mut state = self.shards.write().await;
        for shard in shards {
            state
                .get_mut(shard)
                .ok_or_else(|| commit_not_found(commit))?
                .open_commit_mut(commit)?;
        }
        for shard in shards {
            if let Some(s) = state.get_mut(shard) {
                s.open_commit_mut(commit)?.info.commit_type = CommitType::Read;
            }
        }
        self.record_mutation();
        Ok(())
    }

    async fn commit_inspect(&self, commit: &Commit, shard: ShardNumber) -> Result<CommitInfo> {
        let state = self.shards.read().await;
        Ok(state
            .get(&shard)
            .ok_or_else(|| commit_not_found(commit))?
            .commit(commit)?
            .info
            .clone())
    }

    async fn commit_list(&self, repo: &Repo, shard: ShardNumber) -> Result<Vec<CommitInfo>> {
        let state = self.shards.read().await;
        Ok(state
            .get(&shard)
            .ok_or_else(|| Error::RepoNotFound(repo.name.clone()))?
            .repo(repo)?
            .commits
            .iter()
            .map(|c| c.info.clone())
            .collect())
    }

    async fn commit_delete(&self, commit: &Commit, shards: &ShardSet) -> Result<()> {
        let mut state = self.shards.write().await;
        for shard in shards {
            state
                .get(shard)
                .ok_or_else(|| commit_not_found(commit))?
                .commit(commit)?;
        }
        for shard in shards {
            if let Some(repo_state) = state
                .get_mut(shard)
                .and_then(|s| s.repos.get_mut(&commit.repo.name))
            {
                repo_state.commits.retain(|c| c.info.commit.id != commit.id);
            }
        }
        self.record_mutation();
        Ok(())
    }

    async fn make_directory(&self, file: &File, shards: &ShardSet) -> Result<()> {
        let path = normalize(&file.path);
        let mut state = self.shards.write().await;
        for shard in shards {
            let shard_state = state
                .get_mut(shard)
                .ok_or_else(|| Error::RepoNotFound(file.commit.repo.name.clone()))?;
            if let Some((Entry::File(_), _)) = shard_state.resolve(&file.commit, path)? {
                return Err(Error::Storage(format!("{} is a regular file", file)));
            }
            shard_state.open_commit_mut(&file.commit)?;
        }
        for shard in shards {
            if let Some(shard_state) = state.get_mut(shard) {
                let entries = &mut shard_state.open_commit_mut(&file.commit)?.entries;
                ensure_parents(entries, path);
                entries.insert(path.to_string(), Entry::Dir);
            }
        }
        self.record_mutation();
        Ok(())
    }

    async fn file_put(
        &self,
        file: &File,
        shard: ShardNumber,
        offset_bytes: u64,
        value: &[u8],
    ) -> Result<()> {
        let path = normalize(&file.path);
        let (offset, end) = offset_bytes
            .checked_add(value.len() as u64)
            .filter(|end| *end <= MAX_FILE_SIZE)
            .and_then(|end| Some((usize::try_from(offset_bytes).ok()?, usize::try_from(end).ok()?)))
            .ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "write of {} bytes at offset {} exceeds the {} byte file limit",
                    value.len(),
                    offset_bytes,
                    MAX_FILE_SIZE
                ))
            })?;

        let mut state = self.shards.write().await;
        let shard_state = state
            .get_mut(&shard)
            .ok_or_else(|| Error::RepoNotFound(file.commit.repo.name.clone()))?;

        let mut content = match shard_state.resolve(&file.commit, path)? {
            Some((Entry::File(data), _)) => data.clone(),
            Some(_) => return Err(Error::Storage(format!("{} is a directory", file))),
            None => Vec::new(),
        };
        if content.len() < end {
            content.resize(end, 0);
        }
        content[offset..end].copy_from_slice(value);

        let entries = &mut shard_state.open_commit_mut(&file.commit)?.entries;
        ensure_parents(entries, path);
        entries.insert(path.to_string(), Entry::File(content));
        self.record_mutation();
        Ok(())
    }

    async fn file_get(&self, file: &File, shard: ShardNumber) -> Result<Box<dyn FileReader>> {
        let state = self.shards.read().await;
        let shard_state = state
            .get(&shard)
            .ok_or_else(|| Error::FileNotFound(file.to_string()))?;
        match shard_state.resolve(&file.commit, normalize(&file.path))? {
            Some((Entry::File(data), _)) => {
                self.open_files.fetch_add(1, Ordering::Relaxed);
                Ok(Box::new(OpenFile {
                    content: Cursor::new(data.clone()),
                    open: self.open_files.clone(),
                }))
            }
            Some(_) => Err(Error::Storage(format!("{} is a directory", file))),
            None => Err(Error::FileNotFound(file.to_string())),
        }
    }

    async fn file_inspect(&self, file: &File, shard: ShardNumber) -> Result<FileInfo> {
        let state = self.shards.read().await;
        let shard_state = state
            .get(&shard)
            .ok_or_else(|| Error::FileNotFound(file.to_string()))?;
        let normalized = File::new(file.commit.clone(), normalize(&file.path));
        shard_state.file_info(&normalized)
    }

    async fn file_list(&self, file: &File, shard: ShardNumber) -> Result<Vec<FileInfo>> {
        let dir = normalize(&file.path);
        let state = self.shards.read().await;
        let shard_state = state
            .get(&shard)
            .ok_or_else(|| Error::RepoNotFound(file.commit.repo.name.clone()))?;

        if !dir.is_empty() {
            match shard_state.resolve(&file.commit, dir)? {
                Some((Entry::Dir, _)) => {}
                Some(_) => return Err(Error::Storage(format!("{} is not a directory", file))),
                // The directory may live only on other shards
                None => return Ok(Vec::new()),
            }
        }

        let repo = shard_state.repo(&file.commit.repo)?;
        let mut seen: BTreeMap<&str, Option<FileInfo>> = BTreeMap::new();
        let mut current = Some(
            repo.get(&file.commit.id)
                .ok_or_else(|| commit_not_found(&file.commit))?,
        );
        while let Some(commit_state) = current {
            for (path, entry) in &commit_state.entries {
                if parent_dir(path) != dir || seen.contains_key(path.as_str()) {
                    continue;
                }
                let info = match entry {
                    Entry::Deleted => None,
                    entry => Some(make_info(
                        File::new(file.commit.clone(), path.clone()),
                        entry,
                        &commit_state.info.commit,
                    )),
                };
                seen.insert(path.as_str(), info);
            }
            current = commit_state
                .info
                .parent
                .as_ref()
                .and_then(|p| repo.get(&p.id));
        }
        Ok(seen.into_values().flatten().collect())
    }

    async fn file_delete(&self, file: &File, shard: ShardNumber) -> Result<()> {
        let path = normalize(&file.path);
        let mut state = self.shards.write().await;
        let shard_state = state
            .get_mut(&shard)
            .ok_or_else(|| Error::FileNotFound(file.to_string()))?;
        if shard_state.resolve(&file.commit, path)?.is_none() {
            return Err(Error::FileNotFound(file.to_string()));
        }
        shard_state
            .open_commit_mut(&file.commit)?
            .entries
            .insert(path.to_string(), Entry::Deleted);
        self.record_mutation();
        Ok(())
    }

    async fn diff_pull(
        &self,
        commit: &Commit,
        shard: ShardNumber,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let encoded = {
            let state = self.shards.read().await;
            let commit_state = state
                .get(&shard)
                .ok_or_else(|| commit_not_found(commit))?
                .commit(commit)?;
            if commit_state.info.commit_type != CommitType::Read {
                return Err(Error::CommitNotFinished {
                    repo: commit.repo.name.clone(),
                    id: commit.id.clone(),
                });
            }
            Diff {
                shard,
                info: commit_state.info.clone(),
                entries: commit_state
                    .entries
                    .iter()
                    .map(|(path, entry)| (path.clone(), entry.clone()))
                    .collect(),
            }
            .encode()?
        };
        sink.write_all(&encoded).await?;
        sink.flush().await?;
        Ok(())
    }

    async fn diff_push(
        &self,
        commit: &Commit,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes).await?;
        let diff = Diff::decode(&bytes)?;
        if diff.info.commit != *commit {
            return Err(Error::InvalidRequest(format!(
                "diff for {} pushed as {}",
                diff.info.commit, commit
            )));
        }

        let mut state = self.shards.write().await;
        let repo_state = state
            .entry(diff.shard)
            .or_default()
            .repos
            .entry(commit.repo.name.clone())
            .or_default();

        let entries: BTreeMap<String, Entry> = diff.entries.into_iter().collect();
        if let Some(existing) = repo_state.get(&commit.id) {
            if existing.info == diff.info && existing.entries == entries {
                tracing::debug!("Diff for {} on shard {} already applied", commit, diff.shard);
                return Ok(());
            }
            return Err(Error::Replication(format!(
                "conflicting diff for {} on shard {}",
                commit, diff.shard
            )));
        }
        if let Some(parent) = &diff.info.parent {
            if repo_state.get(&parent.id).is_none() {
                return Err(Error::Replication(format!(
                    "diff for {} arrived before its parent {}",
                    commit, parent
                )));
            }
        }
        repo_state.commits.push(CommitState {
            info: diff.info,
            entries,
        });
        self.record_mutation();
        tracing::debug!("Applied diff for {} on shard {}", commit, diff.shard);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn shards(list: &[ShardNumber]) -> ShardSet {
        list.iter().copied().collect()
    }

    async fn read_all(mut reader: Box<dyn FileReader>) -> Vec<u8> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_repo_lifecycle() {
        let driver = MemoryDriver::new(2);
        let repo = Repo::new("data");
        driver.repo_create(&repo).await.unwrap();
        assert!(matches!(driver.repo_create(&repo).await, Err(Error::RepoExists(_))));

        assert_eq!(driver.repo_list(1).await.unwrap().len(), 1);
        driver.repo_delete(&repo, &shards(&[0, 1])).await.unwrap();
        assert!(driver.repo_inspect(&repo, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_write_inherit_and_delete() {
        let driver = MemoryDriver::new(1);
        let all = shards(&[0]);
        driver.repo_create(&Repo::new("r")).await.unwrap();

        let c1 = driver
            .commit_start(None, Some(&Commit::new("r", "c1")), &all)
            .await
            .unwrap();
        let a = File::new(c1.clone(), "dir/a");
        driver.file_put(&a, 0, 0, b"hello").await.unwrap();
        driver.file_put(&a, 0, 5, b" world").await.unwrap();
        driver.commit_finish(&c1, &all).await.unwrap();
        assert!(matches!(
            driver.file_put(&a, 0, 0, b"x").await,
            Err(Error::CommitFinished { .. })
        ));

        let c2 = driver.commit_start(Some(&c1), None, &all).await.unwrap();
        assert_eq!(c2.repo, c1.repo);
        let inherited = File::new(c2.clone(), "dir/a");
        assert_eq!(
            read_all(driver.file_get(&inherited, 0).await.unwrap()).await,
            b"hello world"
        );
        assert_eq!(driver.file_inspect(&inherited, 0).await.unwrap().commit_modified, c1);

        driver.file_delete(&inherited, 0).await.unwrap();
        assert!(matches!(
            driver.file_get(&inherited, 0).await,
            Err(Error::FileNotFound(_))
        ));
        // Parent still sees it
        assert!(driver.file_get(&a, 0).await.is_ok());

        let listing = driver
            .file_list(&File::new(c1.clone(), ""), 0)
            .await
            .unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].file.path, "dir");
        assert_eq!(listing[0].file_type, FileType::Dir);
    }

    #[tokio::test]
    async fn test_oversized_write_rejected() {
        let driver = MemoryDriver::new(1);
        let all = shards(&[0]);
        driver.repo_create(&Repo::new("r")).await.unwrap();
        let c1 = driver
            .commit_start(None, Some(&Commit::new("r", "c1")), &all)
            .await
            .unwrap();
        let a = File::new(c1.clone(), "a");
        let before = driver.mutations();

        for offset in [u64::MAX, 1 << 40, MAX_FILE_SIZE] {
            assert!(matches!(
                driver.file_put(&a, 0, offset, b"x").await,
                Err(Error::InvalidRequest(_))
            ));
        }
        assert_eq!(driver.mutations(), before);
        assert!(matches!(driver.file_get(&a, 0).await, Err(Error::FileNotFound(_))));

        // Up to the limit is fine
        driver.file_put(&a, 0, MAX_FILE_SIZE - 1, b"x").await.unwrap();
        assert_eq!(driver.file_inspect(&a, 0).await.unwrap().size_bytes, MAX_FILE_SIZE);
    }

    #[tokio::test]
    async fn test_dropped_reader_is_released() {
        let driver = MemoryDriver::new(1);
        let all = shards(&[0]);
        driver.repo_create(&Repo::new("r")).await.unwrap();
        let c1 = driver
            .commit_start(None, Some(&Commit::new("r", "c1")), &all)
            .await
            .unwrap();
        let a = File::new(c1.clone(), "a");
        driver.file_put(&a, 0, 0, b"some content").await.unwrap();

        let mut reader = driver.file_get(&a, 0).await.unwrap();
        let second = driver.file_get(&a, 0).await.unwrap();
        assert_eq!(driver.open_files(), 2);

        let mut head = [0u8; 4];
        reader.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"some");
        drop(reader);
        assert_eq!(driver.open_files(), 1);
        assert_eq!(read_all(second).await, b"some content");
        assert_eq!(driver.open_files(), 0);
    }

    #[tokio::test]
    async fn test_diff_requires_finished_commit() {
        let driver = MemoryDriver::new(1);
        let all = shards(&[0]);
        driver.repo_create(&Repo::new("r")).await.unwrap();
        let c1 = driver
            .commit_start(None, Some(&Commit::new("r", "c1")), &all)
            .await
            .unwrap();

        let mut sink = Vec::new();
        assert!(matches!(
            driver.diff_pull(&c1, 0, &mut sink).await,
            Err(Error::CommitNotFinished { .. })
        ));
    }

    #[tokio::test]
    async fn test_diff_transfer_is_idempotent() {
        let source = MemoryDriver::new(2);
        let target = MemoryDriver::new(2);
        let master = shards(&[1]);
        source.repo_create(&Repo::new("r")).await.unwrap();
        let c1 = source
            .commit_start(None, Some(&Commit::new("r", "c1")), &master)
            .await
            .unwrap();
        source.file_put(&File::new(c1.clone(), "f"), 1, 0, b"abc").await.unwrap();
        source.commit_finish(&c1, &master).await.unwrap();

        let mut diff = Vec::new();
        source.diff_pull(&c1, 1, &mut diff).await.unwrap();

        target.diff_push(&c1, &mut diff.as_slice()).await.unwrap();
        let mutations = target.mutations();
        target.diff_push(&c1, &mut diff.as_slice()).await.unwrap();
        assert_eq!(target.mutations(), mutations);

        assert_eq!(
            target.commit_list(&Repo::new("r"), 1).await.unwrap(),
            source.commit_list(&Repo::new("r"), 1).await.unwrap()
        );
        let f = File::new(c1.clone(), "f");
        assert_eq!(read_all(target.file_get(&f, 1).await.unwrap()).await, b"abc");
        // Other shards untouched
        assert!(target.repo_list(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_diff_out_of_order_rejected() {
        let source = MemoryDriver::new(1);
        let target = MemoryDriver::new(1);
        let all = shards(&[0]);
        source.repo_create(&Repo::new("r")).await.unwrap();
        let c1 = source
            .commit_start(None, Some(&Commit::new("r", "c1")), &all)
            .await
            .unwrap();
        source.commit_finish(&c1, &all).await.unwrap();
        let c2 = source
            .commit_start(Some(&c1), Some(&Commit::new("r", "c2")), &all)
            .await
            .unwrap();
        source.commit_finish(&c2, &all).await.unwrap();

        let mut diff = Vec::new();
        source.diff_pull(&c2, 0, &mut diff).await.unwrap();
        assert!(matches!(
            target.diff_push(&c2, &mut diff.as_slice()).await,
            Err(Error::Replication(_))
        ));
    }
}

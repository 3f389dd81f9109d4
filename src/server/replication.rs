//! Replication Protocol
//!
//! Diff shipping between a shard's master and its backup replicas:
//! - `PullDiff` streams the diff of a (commit, shard) from any served shard
//! - `PushDiff` applies a diff to a replica shard
//! - finishing a commit pushes its diffs to every replica
//! - taking over a shard as master first catches up from every replica

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use tokio_util::io::StreamReader;

use super::InternalApiServer;
use crate::api::ByteStream;
use crate::error::{Error, Result};
use crate::route::{ShardRole, ShardTable};
use crate::types::{Commit, ShardNumber};

/// Split a buffer into a stream of `chunk_size` pieces
fn chunked(buffer: Bytes, chunk_size: usize) -> ByteStream {
    let chunks: Vec<Result<Bytes>> = (0..buffer.len())
        .step_by(chunk_size)
        .map(|start| Ok(buffer.slice(start..(start + chunk_size).min(buffer.len()))))
        .collect();
    futures::stream::iter(chunks).boxed()
}

impl InternalApiServer {
    pub(super) async fn serve_pull_diff(
        &self,
        commit: &Commit,
        shard: ShardNumber,
    ) -> Result<ByteStream> {
        if !self.router.all_shards().await?.contains(&shard) {
            return Err(Error::UnknownShard(shard));
        }
        let mut buffer = Vec::new();
        self.driver.diff_pull(commit, shard, &mut buffer).await?;
        Ok(chunked(Bytes::from(buffer), self.chunk_size))
    }

    pub(super) async fn serve_push_diff(
        &self,
        commit: &Commit,
        shard: ShardNumber,
        value: Bytes,
    ) -> Result<()> {
        if !self.router.replica_shards().await?.contains(&shard) {
            return Err(Error::UnknownShard(shard));
        }
        let mut source: &[u8] = &value;
        self.driver.diff_push(commit, &mut source).await?;
        tracing::debug!("Accepted diff for {} on replica shard {}", commit, shard);
        Ok(())
    }

    /// Push a just-finished commit to every replica of every mastered shard
    pub(super) async fn commit_to_replicas(&self, commit: &Commit) -> Result<()> {
        let shards = self.router.master_shards().await?;
        for shard in shards {
            let clients = self.router.replica_clients(shard).await?;
            let mut diff = Vec::new();
            self.driver.diff_pull(commit, shard, &mut diff).await?;
            let diff = Bytes::from(diff);

            for client in clients {
                if let Err(e) = client.push_diff(commit, shard, diff.clone()).await {
                    tracing::warn!("Failed to push {} on shard {} to replica: {}", commit, shard, e);
                    return Err(Error::Replication(format!(
                        "push of {} on shard {} failed: {}",
                        commit, shard, e
                    )));
                }
            }
            tracing::debug!("Replicated {} on shard {}", commit, shard);
        }
        Ok(())
    }

    /// Catch up on `shard` from every replica before serving it as master
    ///
    /// Commit histories are compared position by position. Any mismatch in
    /// the overlapping prefix aborts with `Divergent`; commits only the
    /// replica has are pulled and applied one at a time, in list order.
    pub async fn master(&self, shard: ShardNumber) -> Result<()> {
        let clients = self.router.replica_clients(shard).await?;
        tracing::info!("Reconciling shard {} against {} replicas", shard, clients.len());

        for client in clients {
            for repo_info in client.repo_list().await? {
                let repo = repo_info.repo;
                // The repository may already exist on other local shards
                self.driver.repo_ensure(&repo, shard).await?;

                let remote_commits = client.commit_list(&repo).await?;
                let local_commits = self.driver.commit_list(&repo, shard).await?;

                for (index, commit_info) in remote_commits.iter().enumerate() {
                    if let Some(local) = local_commits.get(index) {
                        if local != commit_info {
                            tracing::error!(
                                "Divergent history for {} on shard {} at index {}",
                                repo, shard, index
                            );
                            return Err(Error::Divergent {
                                repo: repo.name.clone(),
                                index,
                            });
                        }
                        continue;
                    }

                    let stream = client.pull_diff(&commit_info.commit, shard).await?;
                    let mut source = StreamReader::new(stream.map_err(std::io::Error::other));
                    self.driver.diff_push(&commit_info.commit, &mut source).await?;
                    tracing::info!("Caught up {} on shard {}", commit_info.commit, shard);
                }
            }
        }
        Ok(())
    }

    /// Replicas are passive; they only accept pushed diffs
    pub async fn replica(&self, _shard: ShardNumber) -> Result<()> {
        Ok(())
    }

    /// Releasing a shard is left to cluster membership
    pub async fn clear(&self, _shard: ShardNumber) -> Result<()> {
        Ok(())
    }
}

/// Move `shard` to `role`, running the matching lifecycle hook first
///
/// The role is recorded only after the hook succeeds, so a shard whose
/// reconciliation fails is never served as master. Concurrent calls are
/// serialized, so a second takeover of the same shard sees the first one's
/// result instead of reconciling again.
pub async fn assume_role(
    table: &ShardTable,
    server: &InternalApiServer,
    shard: ShardNumber,
    role: ShardRole,
) -> Result<()> {
    let _transition = table.lock_transitions().await;
    let from = table.check_transition(shard, role).await?;
    if from == role {
        return Ok(());
    }
    match role {
        ShardRole::Master => server.master(shard).await?,
        ShardRole::Replica => server.replica(shard).await?,
        ShardRole::Unowned => server.clear(shard).await?,
    }
    table.assign(shard, role).await?;
    tracing::info!("Shard {} is now {} (was {})", shard, role, from);
    Ok(())
}

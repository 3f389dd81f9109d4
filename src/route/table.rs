//! Shard Role Table
//!
//! In-process `Router` backed by a role map and a set of replica handles per
//! shard. Roles are assigned by whoever drives cluster membership (the node
//! bootstrap in `main.rs`, or tests).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard, RwLock};

use super::{Router, ShardRole};
use crate::api::InternalApi;
use crate::error::{Error, Result};
use crate::types::{ShardNumber, ShardSet};

/// Role map and replica connection registry for one node
pub struct ShardTable {
    shard_count: u64,
    roles: RwLock<HashMap<ShardNumber, ShardRole>>,
    replicas: RwLock<HashMap<ShardNumber, Vec<Arc<dyn InternalApi>>>>,
    transitions: Mutex<()>,
}

impl ShardTable {
    /// Create a table where every shard starts unowned
    pub fn new(shard_count: u64) -> Self {
        Self {
            shard_count,
            roles: RwLock::new(HashMap::new()),
            replicas: RwLock::new(HashMap::new()),
            transitions: Mutex::new(()),
        }
    }

    pub fn shard_count(&self) -> u64 {
        self.shard_count
    }

    /// Current role for a shard
    pub async fn role(&self, shard: ShardNumber) -> ShardRole {
        self.roles
            .read()
            .await
            .get(&shard)
            .copied()
            .unwrap_or_default()
    }

    /// Check that `shard` may move to `role`, returning its current role
    pub async fn check_transition(&self, shard: ShardNumber, role: ShardRole) -> Result<ShardRole> {
        if shard >= self.shard_count {
            return Err(Error::InvalidRequest(format!(
                "shard {} out of range (shard count {})",
                shard, self.shard_count
            )));
        }
        let from = self.role(shard).await;
        if !from.can_transition_to(role) {
            return Err(Error::InvalidTransition { shard, from, to: role });
        }
        Ok(from)
    }

    /// Serialize role changes that run a hook between check and assign
    pub async fn lock_transitions(&self) -> MutexGuard<'_, ()> {
        self.transitions.lock().await
    }

    /// Record a new role for a shard, returning the previous one
    pub async fn assign(&self, shard: ShardNumber, role: ShardRole) -> Result<ShardRole> {
        let from = self.check_transition(shard, role).await?;
        let mut roles = self.roles.write().await;
        match role {
            ShardRole::Unowned => roles.remove(&shard),
            _ => roles.insert(shard, role),
        };
        tracing::debug!("Shard {} role {} -> {}", shard, from, role);
        Ok(from)
    }

    /// Register a backup replica connection for a shard
    pub async fn add_replica_client(&self, shard: ShardNumber, client: Arc<dyn InternalApi>) {
        self.replicas
            .write()
            .await
            .entry(shard)
            .or_default()
            .push(client);
    }

    async fn shards_with(&self, wanted: impl Fn(ShardRole) -> bool) -> ShardSet {
        self.roles
            .read()
            .await
            .iter()
            .filter(|(_, role)| wanted(**role))
            .map(|(shard, _)| *shard)
            .collect()
    }
}

#[async_trait]
impl Router for ShardTable {
    async fn all_shards(&self) -> Result<ShardSet> {
        Ok(self.shards_with(|role| role != ShardRole::Unowned).await)
    }

    async fn master_shards(&self) -> Result<ShardSet> {
        Ok(self.shards_with(|role| role == ShardRole::Master).await)
    }

    async fn replica_shards(&self) -> Result<ShardSet> {
        Ok(self.shards_with(|role| role == ShardRole::Replica).await)
    }

    async fn replica_clients(&self, shard: ShardNumber) -> Result<Vec<Arc<dyn InternalApi>>> {
        Ok(self
            .replicas
            .read()
            .await
            .get(&shard)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_role_sets() {
        let table = ShardTable::new(4);
        table.assign(0, ShardRole::Master).await.unwrap();
        table.assign(1, ShardRole::Replica).await.unwrap();
        table.assign(2, ShardRole::Master).await.unwrap();

        assert_eq!(table.master_shards().await.unwrap(), ShardSet::from([0, 2]));
        assert_eq!(table.replica_shards().await.unwrap(), ShardSet::from([1]));
        assert_eq!(table.all_shards().await.unwrap(), ShardSet::from([0, 1, 2]));
    }

    #[tokio::test]
    async fn test_illegal_transition() {
        let table = ShardTable::new(2);
        table.assign(0, ShardRole::Master).await.unwrap();

        let err = table.assign(0, ShardRole::Replica).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { shard: 0, .. }));
        assert_eq!(table.role(0).await, ShardRole::Master);

        assert_eq!(table.assign(0, ShardRole::Unowned).await.unwrap(), ShardRole::Master);
        assert_eq!(table.assign(0, ShardRole::Replica).await.unwrap(), ShardRole::Unowned);
        assert!(table.master_shards().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range() {
        let table = ShardTable::new(2);
        assert!(table.assign(2, ShardRole::Master).await.is_err());
    }

    #[tokio::test]
    async fn test_no_replicas_registered() {
        let table = ShardTable::new(2);
        assert!(table.replica_clients(1).await.unwrap().is_empty());
    }
}

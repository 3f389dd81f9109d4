//! Shard Routing Module
//!
//! Placement (`Sharder`) and topology (`Router`) capabilities consumed by the
//! request router, plus the per-shard role state machine.

mod sharder;
mod table;

pub use sharder::HashSharder;
pub use table::ShardTable;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::api::InternalApi;
use crate::error::Result;
use crate::types::{File, ShardNumber, ShardSet};

/// Maps a file to the shard that owns it
pub trait Sharder: Send + Sync {
    /// Deterministic and independent of cluster state
    fn shard_for(&self, file: &File) -> Result<ShardNumber>;
}

/// Which shards this node serves, and in which role
///
/// Every call is a snapshot; callers must not cache the answer across
/// requests since roles move on failover.
#[async_trait]
pub trait Router: Send + Sync {
    /// Shards served locally in either role
    async fn all_shards(&self) -> Result<ShardSet>;

    /// Shards mastered locally
    async fn master_shards(&self) -> Result<ShardSet>;

    /// Shards replicated locally
    async fn replica_shards(&self) -> Result<ShardSet>;

    /// Connection handles to every backup replica of `shard`
    async fn replica_clients(&self, shard: ShardNumber) -> Result<Vec<Arc<dyn InternalApi>>>;
}

/// Role a node holds for one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ShardRole {
    #[default]
    Unowned,
    Master,
    Replica,
}

impl ShardRole {
    /// Master and replica never swap directly; a shard is released first
    pub fn can_transition_to(self, to: ShardRole) -> bool {
        !matches!(
            (self, to),
            (ShardRole::Master, ShardRole::Replica) | (ShardRole::Replica, ShardRole::Master)
        )
    }
}

impl std::fmt::Display for ShardRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardRole::Unowned => write!(f, "UNOWNED"),
            ShardRole::Master => write!(f, "MASTER"),
            ShardRole::Replica => write!(f, "REPLICA"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_transitions() {
        use ShardRole::*;
        assert!(Unowned.can_transition_to(Master));
        assert!(Unowned.can_transition_to(Replica));
        assert!(Master.can_transition_to(Unowned));
        assert!(Replica.can_transition_to(Unowned));
        assert!(Master.can_transition_to(Master));
        assert!(!Master.can_transition_to(Replica));
        assert!(!Replica.can_transition_to(Master));
    }
}

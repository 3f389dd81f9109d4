//! WolfStore - Sharded, Versioned File Store
//!
//! The shard routing and replica reconciliation core of a distributed,
//! version-controlled file store. Data lives in repositories made of
//! commits; files inside a commit are spread across a fixed number of
//! shards by hashing their path.
//!
//! # Architecture
//!
//! Every node serves a subset of shards, each either as master (accepts
//! writes) or as replica (accepts pushed diffs, serves reads). The
//! `InternalApiServer` resolves each request to the shard(s) that must
//! serve it and runs it against the local storage driver. Finishing a
//! commit pushes its per-shard diff to every replica; taking over a shard
//! as master first catches up from its replicas.
//!
//! # Features
//!
//! - Path-hash sharding with master/replica roles per shard
//! - Synchronous commit replication to every replica of a shard
//! - Divergence-checked reconciliation on master takeover
//! - In-memory copy-on-write storage driver with compressed diffs
//! - Framed TCP transport exposing the internal API between nodes

pub mod config;
pub mod error;
pub mod types;
pub mod api;
pub mod route;
pub mod drive;
pub mod server;
pub mod network;

pub use config::WolfStoreConfig;
pub use error::{Error, ErrorKind, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::api::{ByteStream, InternalApi};
    pub use crate::config::WolfStoreConfig;
    pub use crate::drive::{Driver, MemoryDriver};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::network::{NetworkServer, RemoteClient};
    pub use crate::route::{HashSharder, Router, ShardRole, ShardTable, Sharder};
    pub use crate::server::{assume_role, InternalApiServer};
    pub use crate::types::{Commit, File, FileType, Repo, ShardFilter, ShardNumber};
}

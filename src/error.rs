//! WolfStore Error Types

use thiserror::Error;

use crate::network::ErrorCode;
use crate::types::ShardNumber;

/// Result type alias for WolfStore operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfStore error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Routing errors
    #[error("{operation} on server with no local shards")]
    NoLocalShards { operation: &'static str },

    #[error("shard {0} not found locally")]
    ShardNotLocal(ShardNumber),

    // Validation errors
    #[error("leading slash in path: {0}")]
    LeadingSlash(String),

    #[error("file put shouldn't have type dir and a value")]
    DirectoryWithValue,

    #[error("invalid shard filter: number {number}, modulo {modulo}")]
    InvalidShardFilter { number: u64, modulo: u64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Storage (driver) errors
    #[error("repository not found: {0}")]
    RepoNotFound(String),

    #[error("repository already exists: {0}")]
    RepoExists(String),

    #[error("commit not found: {repo}/{id}")]
    CommitNotFound { repo: String, id: String },

    #[error("commit {repo}/{id} is already finished")]
    CommitFinished { repo: String, id: String },

    #[error("commit {repo}/{id} is not finished")]
    CommitNotFinished { repo: String, id: String },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Diff serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Replication errors
    #[error("illegal diff request for unknown shard {0}")]
    UnknownShard(ShardNumber),

    #[error("Replication error: {0}")]
    Replication(String),

    #[error("divergent data in repository {repo} at commit index {index}")]
    Divergent { repo: String, index: usize },

    #[error("illegal shard role transition for shard {shard}: {from} -> {to}")]
    InvalidTransition {
        shard: ShardNumber,
        from: crate::route::ShardRole,
        to: crate::route::ShardRole,
    },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Remote error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad classes of failure, used by callers to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Request reached the wrong node; caller must re-route
    Routing,
    /// Request rejected before touching any shard
    Validation,
    /// Failure reported by the storage driver, sharder or router
    Collaborator,
    /// Diff shipping failed or targeted an unknown shard
    Replication,
    /// Histories disagree between master and replica
    Divergence,
    /// Connection, framing or timeout failure
    Transport,
    /// Bad configuration
    Config,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoLocalShards { .. } | Error::ShardNotLocal(_) => ErrorKind::Routing,
            Error::LeadingSlash(_)
            | Error::DirectoryWithValue
            | Error::InvalidShardFilter { .. }
            | Error::InvalidRequest(_)
            | Error::InvalidTransition { .. } => ErrorKind::Validation,
            Error::RepoNotFound(_)
            | Error::RepoExists(_)
            | Error::CommitNotFound { .. }
            | Error::CommitFinished { .. }
            | Error::CommitNotFinished { .. }
            | Error::FileNotFound(_)
            | Error::Storage(_)
            | Error::Serialization(_)
            | Error::Internal(_) => ErrorKind::Collaborator,
            Error::UnknownShard(_) | Error::Replication(_) => ErrorKind::Replication,
            Error::Divergent { .. } => ErrorKind::Divergence,
            Error::Network(_)
            | Error::ConnectionFailed { .. }
            | Error::ConnectionTimeout(_)
            | Error::Io(_) => ErrorKind::Transport,
            Error::Config(_) | Error::ConfigParse(_) => ErrorKind::Config,
            Error::Remote { code, .. } => code.kind(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_) | Error::ConnectionFailed { .. } | Error::Network(_)
        )
    }

    /// Wire code used when this error crosses a node boundary
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NoLocalShards { .. } => ErrorCode::NoLocalShards,
            Error::ShardNotLocal(_) => ErrorCode::ShardNotLocal,
            Error::UnknownShard(_) => ErrorCode::UnknownShard,
            Error::Divergent { .. } => ErrorCode::Divergent,
            Error::Remote { code, .. } => *code,
            other => match other.kind() {
                ErrorKind::Validation => ErrorCode::Validation,
                ErrorKind::Collaborator => ErrorCode::Storage,
                ErrorKind::Replication => ErrorCode::Replication,
                _ => ErrorCode::Internal,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::LeadingSlash("/a".into()).kind(), ErrorKind::Validation);
        assert_eq!(Error::ShardNotLocal(3).kind(), ErrorKind::Routing);
        assert_eq!(Error::UnknownShard(3).kind(), ErrorKind::Replication);
        let transition = Error::InvalidTransition {
            shard: 1,
            from: crate::route::ShardRole::Master,
            to: crate::route::ShardRole::Replica,
        };
        assert_eq!(transition.kind(), ErrorKind::Validation);
        assert_eq!(transition.code(), ErrorCode::Validation);
        assert_eq!(
            Error::Divergent { repo: "r".into(), index: 1 }.kind(),
            ErrorKind::Divergence
        );
        assert_eq!(
            Error::Remote { code: ErrorCode::ShardNotLocal, message: String::new() }.kind(),
            ErrorKind::Routing
        );
    }

    #[test]
    fn test_retryable() {
        assert!(Error::ConnectionTimeout("x:1".into()).is_retryable());
        assert!(!Error::ShardNotLocal(1).is_retryable());
        assert!(!Error::Divergent { repo: "r".into(), index: 0 }.is_retryable());
    }
}

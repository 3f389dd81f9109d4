//! Wire Protocol
//!
//! Defines the messages exchanged between nodes. One request per exchange:
//! unary calls get a single `Response` or `Error`; streamed calls get
//! `Chunk` frames closed by `EndOfStream`, or an `Error` at any point.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::types::{
    Commit, CommitInfo, File, FileInfo, FileType, Repo, RepoInfo, ShardFilter, ShardNumber,
};

/// Upper bound on a single frame body
pub const MAX_FRAME_SIZE: u32 = 256 * 1024 * 1024;

/// Internal API calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    // ========== Repositories ==========
    RepoCreate { repo: Repo },
    RepoInspect { repo: Repo },
    RepoList,
    RepoDelete { repo: Repo },

    // ========== Commits ==========
    CommitStart {
        parent: Option<Commit>,
        commit: Option<Commit>,
    },
    CommitFinish { commit: Commit },
    CommitInspect { commit: Commit },
    CommitList { repo: Repo },
    CommitDelete { commit: Commit },

    // ========== Files ==========
    FilePut {
        file: File,
        file_type: FileType,
        offset_bytes: u64,
        value: Vec<u8>,
    },
    FileGet {
        file: File,
        offset_bytes: u64,
        size_bytes: u64,
    },
    FileInspect { file: File },
    FileList {
        file: File,
        filter: Option<ShardFilter>,
    },
    FileDelete { file: File },

    // ========== Replication ==========
    PullDiff { commit: Commit, shard: ShardNumber },
    PushDiff {
        commit: Commit,
        shard: ShardNumber,
        value: Vec<u8>,
    },
}

impl Request {
    /// Get the request type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::RepoCreate { .. } => "RepoCreate",
            Request::RepoInspect { .. } => "RepoInspect",
            Request::RepoList => "RepoList",
            Request::RepoDelete { .. } => "RepoDelete",
            Request::CommitStart { .. } => "CommitStart",
            Request::CommitFinish { .. } => "CommitFinish",
            Request::CommitInspect { .. } => "CommitInspect",
            Request::CommitList { .. } => "CommitList",
            Request::CommitDelete { .. } => "CommitDelete",
            Request::FilePut { .. } => "FilePut",
            Request::FileGet { .. } => "FileGet",
            Request::FileInspect { .. } => "FileInspect",
            Request::FileList { .. } => "FileList",
            Request::FileDelete { .. } => "FileDelete",
            Request::PullDiff { .. } => "PullDiff",
            Request::PushDiff { .. } => "PushDiff",
        }
    }
}

/// Unary call results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Empty,
    RepoInfo(RepoInfo),
    RepoInfos(Vec<RepoInfo>),
    Commit(Commit),
    CommitInfo(CommitInfo),
    CommitInfos(Vec<CommitInfo>),
    FileInfo(FileInfo),
    FileInfos(Vec<FileInfo>),
}

/// Frames on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Response(Response),
    /// Piece of a streamed response
    Chunk(Vec<u8>),
    EndOfStream,
    Error { code: ErrorCode, message: String },
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Request(request) => request.type_name(),
            Message::Response(_) => "Response",
            Message::Chunk(_) => "Chunk",
            Message::EndOfStream => "EndOfStream",
            Message::Error { .. } => "Error",
        }
    }
}

/// Error codes for errors crossing a node boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NoLocalShards,
    ShardNotLocal,
    Validation,
    Storage,
    UnknownShard,
    Replication,
    Divergent,
    Internal,
}

impl ErrorCode {
    /// Error class the code was produced from
    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorCode::NoLocalShards | ErrorCode::ShardNotLocal => ErrorKind::Routing,
            ErrorCode::Validation => ErrorKind::Validation,
            ErrorCode::Storage | ErrorCode::Internal => ErrorKind::Collaborator,
            ErrorCode::UnknownShard | ErrorCode::Replication => ErrorKind::Replication,
            ErrorCode::Divergent => ErrorKind::Divergence,
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            checksum: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

//! Network Client
//!
//! `InternalApi` implementation that forwards every call to a peer node.
//! Each call opens its own connection; streamed calls keep it open until
//! the returned stream is exhausted or dropped.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{read_message, write_message, Message, Request, Response};
use crate::api::{ByteStream, InternalApi};
use crate::error::{Error, Result};
use crate::types::{
    Commit, CommitInfo, File, FileInfo, FileType, Repo, RepoInfo, ShardFilter, ShardNumber,
};

/// Client for a peer node's internal API
#[derive(Debug, Clone)]
pub struct RemoteClient {
    address: String,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl RemoteClient {
    /// Create a client for the node listening on `address`
    pub fn new(address: impl Into<String>, connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
            request_timeout,
        }
    }

    /// Peer address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connect to the peer
    async fn connect(&self) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(&self.address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: self.address.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(self.address.clone())),
        }
    }

    /// Send a request and wait for its single response frame
    async fn call(&self, request: Request) -> Result<Response> {
        tracing::trace!("Sending {} to {}", request.type_name(), self.address);

        let result = timeout(self.request_timeout, async {
            let mut stream = self.connect().await?;
            let (mut reader, mut writer) = stream.split();
            write_message(&mut writer, &Message::Request(request)).await?;
            read_message(&mut reader).await
        })
        .await;

        let message = match result {
            Ok(inner) => inner?,
            Err(_) => return Err(Error::ConnectionTimeout(self.address.clone())),
        };

        match message {
            Message::Response(response) => Ok(response),
            Message::Error { code, message } => Err(Error::Remote { code, message }),
            other => Err(unexpected(other.type_name())),
        }
    }

    /// Send a request whose response is a chunk stream
    ///
    /// The first frame is read before returning so that errors raised
    /// before any data is produced surface from this call.
    async fn call_streaming(&self, request: Request) -> Result<ByteStream> {
        tracing::trace!("Sending {} to {}", request.type_name(), self.address);

        let stream = self.connect().await?;
        let (reader, mut writer) = stream.into_split();
        write_message(&mut writer, &Message::Request(request)).await?;

        let mut chunks = ChunkReader {
            reader,
            _writer: writer,
            address: self.address.clone(),
            request_timeout: self.request_timeout,
            next: NextChunk::Read,
        };

        chunks.next = match chunks.read().await? {
            Message::Chunk(data) => NextChunk::First(Bytes::from(data)),
            Message::EndOfStream => NextChunk::Done,
            Message::Error { code, message } => return Err(Error::Remote { code, message }),
            other => return Err(unexpected(other.type_name())),
        };

        Ok(futures::stream::unfold(chunks, ChunkReader::advance).boxed())
    }
}

fn unexpected(type_name: &str) -> Error {
    Error::Network(format!("Unexpected {} message from peer", type_name))
}

enum NextChunk {
    First(Bytes),
    Read,
    Done,
}

/// Read side of a streamed response
struct ChunkReader {
    reader: OwnedReadHalf,
    _writer: OwnedWriteHalf,
    address: String,
    request_timeout: Duration,
    next: NextChunk,
}

impl ChunkReader {
    async fn read(&mut self) -> Result<Message> {
        match timeout(self.request_timeout, read_message(&mut self.reader)).await {
            Ok(inner) => inner,
            Err(_) => Err(Error::ConnectionTimeout(self.address.clone())),
        }
    }

    async fn advance(mut self) -> Option<(Result<Bytes>, Self)> {
        match std::mem::replace(&mut self.next, NextChunk::Read) {
            NextChunk::Done => None,
            NextChunk::First(bytes) => Some((Ok(bytes), self)),
            NextChunk::Read => {
                let item = match self.read().await {
                    Ok(Message::Chunk(data)) => return Some((Ok(Bytes::from(data)), self)),
                    Ok(Message::EndOfStream) => return None,
                    Ok(Message::Error { code, message }) => Err(Error::Remote { code, message }),
                    Ok(other) => Err(unexpected(other.type_name())),
                    Err(e) => Err(e),
                };
                self.next = NextChunk::Done;
                Some((item, self))
            }
        }
    }
}

#[async_trait]
impl InternalApi for RemoteClient {
    async fn repo_create(&self, repo: &Repo) -> Result<()> {
        match self.call(Request::RepoCreate { repo: repo.clone() }).await? {
            Response::Empty => Ok(()),
            _ => Err(unexpected("response")),
        }
    }

    async fn repo_inspect(&self, repo: &Repo) -> Result<RepoInfo> {
        match self.call(Request::RepoInspect { repo: repo.clone() }).await? {
            Response::RepoInfo(info) => Ok(info),
            _ => Err(unexpected("response")),
        }
    }

    async fn repo_list(&self) -> Result<Vec<RepoInfo>> {
        match self.call(Request::RepoList).await? {
            Response::RepoInfos(infos) => Ok(infos),
            _ => Err(unexpected("response")),
        }
    }

    async fn repo_delete(&self, repo: &Repo) -> Result<()> {
        match self.call(Request::RepoDelete { repo: repo.clone() }).await? {
            Response::Empty => Ok(()),
            _ => Err(unexpected("response")),
        }
    }

    async fn commit_start(&self, parent: Option<&Commit>, commit: Option<&Commit>) -> Result<Commit> {
        let request = Request::CommitStart {
            parent: parent.cloned(),
            commit: commit.cloned(),
        };
        match self.call(request).await? {
            Response::Commit(commit) => Ok(commit),
            _ => Err(unexpected("response")),
        }
    }

    async fn commit_finish(&self, commit: &Commit) -> Result<()> {
        match self.call(Request::CommitFinish { commit: commit.clone() }).await? {
            Response::Empty => Ok(()),
            _ => Err(unexpected("response")),
        }
    }

    async fn commit_inspect(&self, commit: &Commit) -> Result<CommitInfo> {
        match self.call(Request::CommitInspect { commit: commit.clone() }).await? {
            Response::CommitInfo(info) => Ok(info),
            _ => Err(unexpected("response")),
        }
    }

    async fn commit_list(&self, repo: &Repo) -> Result<Vec<CommitInfo>> {
        match self.call(Request::CommitList { repo: repo.clone() }).await? {
            Response::CommitInfos(infos) => Ok(infos),
            _ => Err(unexpected("response")),
        }
    }

    async fn commit_delete(&self, commit: &Commit) -> Result<()> {
        match self.call(Request::CommitDelete { commit: commit.clone() }).await? {
            Response::Empty => Ok(()),
            _ => Err(unexpected("response")),
        }
    }

    async fn file_put(
        &self,
        file: &File,
        file_type: FileType,
        offset_bytes: u64,
        value: Bytes,
    ) -> Result<()> {
        let request = Request::FilePut {
            file: file.clone(),
            file_type,
            offset_bytes,
            value: value.to_vec(),
        };
        match self.call(request).await? {
            Response::Empty => Ok(()),
            _ => Err(unexpected("response")),
        }
    }

    async fn file_get(&self, file: &File, offset_bytes: u64, size_bytes: u64) -> Result<ByteStream> {
        self.call_streaming(Request::FileGet {
            file: file.clone(),
            offset_bytes,
            size_bytes,
        })
        .await
    }

    async fn file_inspect(&self, file: &File) -> Result<FileInfo> {
        match self.call(Request::FileInspect { file: file.clone() }).await? {
            Response::FileInfo(info) => Ok(info),
            _ => Err(unexpected("response")),
        }
    }

    async fn file_list(&self, file: &File, filter: Option<ShardFilter>) -> Result<Vec<FileInfo>> {
        match self.call(Request::FileList { file: file.clone(), filter }).await? {
            Response::FileInfos(infos) => Ok(infos),
            _ => Err(unexpected("response")),
        }
    }

    async fn file_delete(&self, file: &File) -> Result<()> {
        match self.call(Request::FileDelete { file: file.clone() }).await? {
            Response::Empty => Ok(()),
            _ => Err(unexpected("response")),
        }
    }

    async fn pull_diff(&self, commit: &Commit, shard: ShardNumber) -> Result<ByteStream> {
        self.call_streaming(Request::PullDiff {
            commit: commit.clone(),
            shard,
        })
        .await
    }

    async fn push_diff(&self, commit: &Commit, shard: ShardNumber, value: Bytes) -> Result<()> {
        let request = Request::PushDiff {
            commit: commit.clone(),
            shard,
            value: value.to_vec(),
        };
        match self.call(request).await? {
            Response::Empty => Ok(()),
            _ => Err(unexpected("response")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_failure() {
        let client = RemoteClient::new(
            "127.0.0.1:1",
            Duration::from_millis(100),
            Duration::from_millis(500),
        );

        // Nothing listens on port 1
        let err = client.repo_list().await.unwrap_err();
        assert!(err.is_retryable());
    }
}

//! Network Server
//!
//! TCP server exposing a node's `InternalApi` to its peers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWrite;
use tokio::net::{TcpListener, TcpStream};

use super::{read_message, write_message, Message, Request, Response};
use crate::api::{ByteStream, InternalApi};
use crate::error::{Error, Result};

/// Network server for cluster communication
pub struct NetworkServer {
    /// Bind address
    bind_address: String,
    /// Local API every request is dispatched to
    api: Arc<dyn InternalApi>,
    /// Shutdown signal
    shutdown: tokio::sync::watch::Sender<bool>,
    /// Connections whose task is still running
    connections: Arc<AtomicUsize>,
}

/// Held by a connection task for as long as it runs
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn new(connections: &Arc<AtomicUsize>) -> Self {
        connections.fetch_add(1, Ordering::Relaxed);
        Self(connections.clone())
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl NetworkServer {
    /// Create a new network server
    pub fn new(bind_address: String, api: Arc<dyn InternalApi>) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        Self {
            bind_address,
            api,
            shutdown: shutdown_tx,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of open peer connections
    pub fn active_connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        self.run(listener).await
    }

    /// Serve on an already bound listener until stopped
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("Network server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        while !*shutdown_rx.borrow() {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let api = self.api.clone();
                            let guard = ConnectionGuard::new(&self.connections);

                            tokio::spawn(async move {
                                let _guard = guard;
                                if let Err(e) = handle_connection(socket, &peer_addr, api).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Network server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Serve requests on one connection until the peer closes it
async fn handle_connection(socket: TcpStream, peer_addr: &str, api: Arc<dyn InternalApi>) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        match read_message(&mut reader).await {
            Ok(Message::Request(request)) => {
                tracing::trace!("Received {} from {}", request.type_name(), peer_addr);
                dispatch(api.as_ref(), request, &mut writer).await?;
            }
            Ok(other) => {
                tracing::warn!("Unexpected {} from {}", other.type_name(), peer_addr);
                let error = Error::InvalidRequest(format!("expected a request, got {}", other.type_name()));
                write_message(&mut writer, &error_message(&error)).await?;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message: {}", e);
                break;
            }
        }
    }

    Ok(())
}

/// Run one request against the local API and write its response frames
async fn dispatch<W: AsyncWrite + Unpin>(
    api: &dyn InternalApi,
    request: Request,
    writer: &mut W,
) -> Result<()> {
    let result = match request {
        Request::RepoCreate { repo } => api.repo_create(&repo).await.map(|_| Response::Empty),
        Request::RepoInspect { repo } => api.repo_inspect(&repo).await.map(Response::RepoInfo),
        Request::RepoList => api.repo_list().await.map(Response::RepoInfos),
        Request::RepoDelete { repo } => api.repo_delete(&repo).await.map(|_| Response::Empty),
        Request::CommitStart { parent, commit } => api
            .commit_start(parent.as_ref(), commit.as_ref())
            .await
            .map(Response::Commit),
        Request::CommitFinish { commit } => api.commit_finish(&commit).await.map(|_| Response::Empty),
        Request::CommitInspect { commit } => api.commit_inspect(&commit).await.map(Response::CommitInfo),
        Request::CommitList { repo } => api.commit_list(&repo).await.map(Response::CommitInfos),
        Request::CommitDelete { commit } => api.commit_delete(&commit).await.map(|_| Response::Empty),
        Request::FilePut {
            file,
            file_type,
            offset_bytes,
            value,
        } => api
            .file_put(&file, file_type, offset_bytes, Bytes::from(value))
            .await
            .map(|_| Response::Empty),
        Request::FileGet {
            file,
            offset_bytes,
            size_bytes,
        } => {
            let stream = api.file_get(&file, offset_bytes, size_bytes).await;
            return write_stream(stream, writer).await;
        }
        Request::FileInspect { file } => api.file_inspect(&file).await.map(Response::FileInfo),
        Request::FileList { file, filter } => api.file_list(&file, filter).await.map(Response::FileInfos),
        Request::FileDelete { file } => api.file_delete(&file).await.map(|_| Response::Empty),
        Request::PullDiff { commit, shard } => {
            let stream = api.pull_diff(&commit, shard).await;
            return write_stream(stream, writer).await;
        }
        Request::PushDiff { commit, shard, value } => api
            .push_diff(&commit, shard, Bytes::from(value))
            .await
            .map(|_| Response::Empty),
    };

    let message = match result {
        Ok(response) => Message::Response(response),
        Err(e) => error_message(&e),
    };
    write_message(writer, &message).await
}

/// Forward a byte stream as chunk frames; the stream is dropped on any exit
async fn write_stream<W: AsyncWrite + Unpin>(stream: Result<ByteStream>, writer: &mut W) -> Result<()> {
    let mut stream = match stream {
        Ok(stream) => stream,
        Err(e) => return write_message(writer, &error_message(&e)).await,
    };

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => write_message(writer, &Message::Chunk(bytes.to_vec())).await?,
            Err(e) => return write_message(writer, &error_message(&e)).await,
        }
    }

    write_message(writer, &Message::EndOfStream).await
}

fn error_message(error: &Error) -> Message {
    Message::Error {
        code: error.code(),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use crate::api::collect_bytes;
    use crate::drive::Driver;
    use crate::error::ErrorKind;
    use crate::network::{ErrorCode, RemoteClient};
    use crate::route::ShardRole;
    use crate::server::assume_role;
    use crate::server::tests::{node, FixedSharder, TestNode};
    use crate::types::{Commit, File, FileType, Repo, ShardNumber};

    fn sharder() -> Arc<FixedSharder> {
        let paths: HashMap<String, ShardNumber> =
            [("a".to_string(), 0), ("b".to_string(), 1)].into_iter().collect();
        Arc::new(FixedSharder(paths))
    }

    /// Serve a node on an ephemeral port and return a client for it
    async fn serve(node: &TestNode) -> (Arc<NetworkServer>, RemoteClient) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = Arc::new(NetworkServer::new(address.clone(), node.server.clone()));

        let running = server.clone();
        tokio::spawn(async move { running.run(listener).await });

        let client = RemoteClient::new(address, Duration::from_secs(1), Duration::from_secs(5));
        (server, client)
    }

    #[tokio::test]
    async fn test_unary_and_streamed_calls() {
        let n = node(sharder(), 2, &[0, 1], &[]).await;
        let (server, client) = serve(&n).await;

        client.repo_create(&Repo::new("repo")).await.unwrap();
        let commit = client
            .commit_start(None, Some(&Commit::new("repo", "c1")))
            .await
            .unwrap();
        assert_eq!(commit, Commit::new("repo", "c1"));

        let file = File::new(commit.clone(), "a");
        client
            .file_put(&file, FileType::Regular, 0, Bytes::from_static(b"hello remote world"))
            .await
            .unwrap();

        // Chunk size is 4, so this spans several frames
        let data = collect_bytes(client.file_get(&file, 6, 6).await.unwrap()).await.unwrap();
        assert_eq!(&data[..], b"remote");

        let info = client.file_inspect(&file).await.unwrap();
        assert_eq!(info.size_bytes, 18);

        let repos = client.repo_list().await.unwrap();
        assert_eq!(repos.len(), 1);

        server.stop();
    }

    #[tokio::test]
    async fn test_remote_errors_keep_their_kind() {
        let n = node(sharder(), 2, &[0], &[]).await;
        let (server, client) = serve(&n).await;

        client.repo_create(&Repo::new("repo")).await.unwrap();
        let commit = client
            .commit_start(None, Some(&Commit::new("repo", "c1")))
            .await
            .unwrap();

        // "b" hashes to shard 1, which this node does not master
        let err = client
            .file_put(&File::new(commit.clone(), "b"), FileType::Regular, 0, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Remote { code: ErrorCode::ShardNotLocal, .. }));
        assert_eq!(err.kind(), ErrorKind::Routing);

        // Streamed calls surface errors before any data
        let err = client.pull_diff(&commit, 9).await.err().unwrap();
        assert!(matches!(err, Error::Remote { code: ErrorCode::UnknownShard, .. }));
        assert_eq!(err.kind(), ErrorKind::Replication);

        server.stop();
    }

    #[tokio::test]
    async fn test_replication_over_tcp() {
        let master = node(sharder(), 1, &[0], &[]).await;
        let replica = node(sharder(), 1, &[], &[0]).await;
        let (server, client) = serve(&replica).await;
        master.table.add_replica_client(0, Arc::new(client)).await;

        master.server.repo_create(&Repo::new("repo")).await.unwrap();
        let commit = master
            .server
            .commit_start(None, Some(&Commit::new("repo", "c1")))
            .await
            .unwrap();
        master
            .server
            .file_put(&File::new(commit.clone(), "a"), FileType::Regular, 0, Bytes::from_static(b"replicated"))
            .await
            .unwrap();
        master.server.commit_finish(&commit).await.unwrap();

        let commits = replica.driver.commit_list(&Repo::new("repo"), 0).await.unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].commit, commit);

        server.stop();
    }

    #[tokio::test]
    async fn test_reconcile_from_remote_replica() {
        let source = node(sharder(), 1, &[0], &[]).await;
        source.server.repo_create(&Repo::new("repo")).await.unwrap();
        let commit = source
            .server
            .commit_start(None, Some(&Commit::new("repo", "c1")))
            .await
            .unwrap();
        source
            .server
            .file_put(&File::new(commit.clone(), "a"), FileType::Regular, 0, Bytes::from_static(b"data"))
            .await
            .unwrap();
        source.server.commit_finish(&commit).await.unwrap();
        let (server, client) = serve(&source).await;

        let candidate = node(sharder(), 1, &[], &[]).await;
        candidate.table.add_replica_client(0, Arc::new(client)).await;
        assume_role(&candidate.table, &candidate.server, 0, ShardRole::Master)
            .await
            .unwrap();

        assert_eq!(candidate.table.role(0).await, ShardRole::Master);
        let data = collect_bytes(
            candidate
                .server
                .file_get(&File::new(commit, "a"), 0, 100)
                .await
                .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(&data[..], b"data");

        server.stop();
    }

    /// Wait until the server has no connections and the driver no open files
    async fn wait_released(server: &NetworkServer, n: &TestNode) {
        let released = async {
            while server.active_connections() > 0 || n.driver.open_files() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), released)
            .await
            .expect("connection was not released");
    }

    #[tokio::test]
    async fn test_dropped_remote_stream_ends_connection() {
        let n = node(sharder(), 1, &[0], &[]).await;
        n.server.repo_create(&Repo::new("repo")).await.unwrap();
        let commit = n
            .server
            .commit_start(None, Some(&Commit::new("repo", "c1")))
            .await
            .unwrap();
        let file = File::new(commit.clone(), "a");
        // Far more chunk frames than the socket buffers hold
        let content: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        n.server
            .file_put(&file, FileType::Regular, 0, Bytes::from(content))
            .await
            .unwrap();
        n.server.commit_finish(&commit).await.unwrap();

        let (server, client) = serve(&n).await;

        let mut stream = client.file_get(&file, 0, 4 * 1024 * 1024).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(&first[..], &[0, 1, 2, 3]);
        assert_eq!(server.active_connections(), 1);
        assert_eq!(n.driver.open_files(), 1);
        drop(stream);
        wait_released(&server, &n).await;

        let mut stream = client.pull_diff(&commit, 0).await.unwrap();
        assert!(stream.next().await.unwrap().is_ok());
        drop(stream);
        wait_released(&server, &n).await;

        // The server keeps serving new connections
        assert_eq!(client.file_inspect(&file).await.unwrap().size_bytes, 4 * 1024 * 1024);
        server.stop();
    }

    #[tokio::test]
    async fn test_stop_ends_run() {
        let n = node(sharder(), 1, &[0], &[]).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Arc::new(NetworkServer::new("127.0.0.1:0".to_string(), n.server.clone()));
        let running = server.clone();
        let handle = tokio::spawn(async move { running.run(listener).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        server.stop();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap();
        assert!(result.unwrap().is_ok());
    }
}

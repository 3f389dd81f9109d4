//! WolfStore - Sharded, Versioned File Store Node
//!
//! Runs a storage node from a TOML configuration, or talks to a running
//! node's internal API from the command line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfstore::api::InternalApi;
use wolfstore::config::WolfStoreConfig;
use wolfstore::drive::MemoryDriver;
use wolfstore::network::{NetworkServer, RemoteClient};
use wolfstore::route::{HashSharder, ShardRole, ShardTable};
use wolfstore::server::{assume_role, InternalApiServer};
use wolfstore::types::{Commit, File, FileType, Repo, ShardFilter, ShardNumber};

/// WolfStore - Sharded, Versioned File Store
#[derive(Parser)]
#[command(name = "wolfstore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfstore.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to the configured level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WolfStore node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfstore.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,

        /// Total number of shards
        #[arg(long, default_value = "16", value_parser = clap::value_parser!(u64).range(1..))]
        shards: u64,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,

    /// Repository operations
    Repo {
        #[command(flatten)]
        target: Target,

        #[command(subcommand)]
        action: RepoCommand,
    },

    /// Commit operations
    Commit {
        #[command(flatten)]
        target: Target,

        #[command(subcommand)]
        action: CommitCommand,
    },

    /// File operations
    File {
        #[command(flatten)]
        target: Target,

        #[command(subcommand)]
        action: FileCommand,
    },

    /// Replication diagnostics
    Diff {
        #[command(flatten)]
        target: Target,

        #[command(subcommand)]
        action: DiffCommand,
    },
}

/// Node a client command is sent to
#[derive(Args)]
struct Target {
    /// Node address to query
    #[arg(short, long, default_value = "127.0.0.1:7654")]
    address: String,
}

#[derive(Subcommand)]
enum RepoCommand {
    Create { repo: String },
    Inspect { repo: String },
    List,
    Delete { repo: String },
}

#[derive(Subcommand)]
enum CommitCommand {
    /// Start a commit; the id is generated when omitted
    Start {
        repo: String,
        #[arg(long)]
        parent: Option<String>,
        #[arg(long)]
        id: Option<String>,
    },
    Finish { repo: String, id: String },
    Inspect { repo: String, id: String },
    List { repo: String },
    Delete { repo: String, id: String },
}

#[derive(Subcommand)]
enum FileCommand {
    /// Write a file from stdin, or create a directory
    Put {
        repo: String,
        commit: String,
        path: String,
        #[arg(long)]
        dir: bool,
        #[arg(long, default_value = "0")]
        offset: u64,
        /// Read content from this file instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Write a byte range of a file to stdout
    Get {
        repo: String,
        commit: String,
        path: String,
        #[arg(long, default_value = "0")]
        offset: u64,
        #[arg(long, default_value_t = u64::MAX)]
        size: u64,
    },
    Inspect { repo: String, commit: String, path: String },
    List {
        repo: String,
        commit: String,
        #[arg(default_value = "")]
        path: String,
        /// Only list shards where shard % modulo == number
        #[arg(long, requires = "modulo")]
        number: Option<u64>,
        #[arg(long, requires = "number")]
        modulo: Option<u64>,
    },
    Delete { repo: String, commit: String, path: String },
}

#[derive(Subcommand)]
enum DiffCommand {
    /// Write a finished commit's diff for one shard
    Pull {
        repo: String,
        commit: String,
        shard: ShardNumber,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, node_id, shards } => run_init(output, node_id, shards),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Repo { target, action } => run_repo(client(&target), action).await,
        Commands::Commit { target, action } => run_commit(client(&target), action).await,
        Commands::File { target, action } => run_file(client(&target), action).await,
        Commands::Diff { target, action } => run_diff(client(&target), action).await,
    }
}

/// Initialize logging from the command line, falling back to the config file
fn init_logging(cli: &Cli) {
    let configured = WolfStoreConfig::from_file(&cli.config).ok().map(|c| c.logging);
    let level = cli
        .log_level
        .clone()
        .or_else(|| configured.as_ref().map(|l| l.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let json = configured.is_some_and(|l| l.format == "json");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    // Logs go to stderr so client output on stdout stays clean
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Start the WolfStore node
async fn run_start(config_path: PathBuf) -> anyhow::Result<()> {
    tracing::info!("Starting WolfStore node...");

    let config = WolfStoreConfig::from_file(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    let driver = Arc::new(MemoryDriver::new(config.shards.count));
    let sharder = Arc::new(HashSharder::new(config.shards.count)?);
    let table = Arc::new(ShardTable::new(config.shards.count));

    for shard in config.master_shards() {
        for address in config.replica_addresses(shard) {
            let client = RemoteClient::new(address, config.connect_timeout(), config.request_timeout());
            table.add_replica_client(shard, Arc::new(client)).await;
        }
    }

    let server = Arc::new(
        InternalApiServer::new(sharder, table.clone(), driver)
            .with_chunk_size(config.network.chunk_size),
    );
    let network = Arc::new(NetworkServer::new(config.node.bind_address.clone(), server.clone()));

    // Listen before reconciling so peers catching up from this node are served
    let listener = TcpListener::bind(&config.node.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.node.bind_address))?;
    let mut network_handle = tokio::spawn({
        let network = network.clone();
        async move { network.run(listener).await }
    });

    for shard in config.replica_shards() {
        assume_role(&table, &server, shard, ShardRole::Replica).await?;
    }
    for shard in config.master_shards() {
        assume_role(&table, &server, shard, ShardRole::Master)
            .await
            .with_context(|| format!("failed to take over shard {} as master", shard))?;
    }
    tracing::info!(
        "Node {} serving {} master and {} replica shards at {}",
        config.node.id,
        config.shards.master.len(),
        config.shards.replica.len(),
        config.advertise_address()
    );

    tokio::select! {
        result = &mut network_handle => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            network.stop();
            network_handle.await??;
        }
    }

    tracing::info!("WolfStore shutdown complete");
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String, shards: u64) -> anyhow::Result<()> {
    let config_content = WolfStoreConfig::template(&node_id, shards)?;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure shard roles and replica peers.");
    println!("Then start with: wolfstore start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match WolfStoreConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Shards: {}", config.shards.count);
            println!("  Master: {:?}", config.master_shards());
            println!("  Replica: {:?}", config.replica_shards());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> anyhow::Result<()> {
    let config = WolfStoreConfig::from_file(&config_path)?;

    println!("WolfStore Node Information");
    println!("==========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Advertise:        {}", config.advertise_address());
    println!();
    println!("Shard Configuration:");
    println!("  Count:          {}", config.shards.count);
    for shard in config.master_shards() {
        let replicas = config.replica_addresses(shard);
        println!("  Master {:>4}:    replicas {:?}", shard, replicas);
    }
    for shard in config.replica_shards() {
        println!("  Replica {:>4}", shard);
    }
    println!();
    println!("Network Configuration:");
    println!("  Connect:        {} ms", config.network.connect_timeout_ms);
    println!("  Request:        {} ms", config.network.request_timeout_ms);
    println!("  Chunk Size:     {} bytes", config.network.chunk_size);

    Ok(())
}

fn client(target: &Target) -> RemoteClient {
    let network = wolfstore::config::NetworkConfig::default();
    RemoteClient::new(
        target.address.clone(),
        std::time::Duration::from_millis(network.connect_timeout_ms),
        std::time::Duration::from_millis(network.request_timeout_ms),
    )
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_repo(client: RemoteClient, action: RepoCommand) -> anyhow::Result<()> {
    match action {
        RepoCommand::Create { repo } => client.repo_create(&Repo::new(repo)).await?,
        RepoCommand::Inspect { repo } => print_json(&client.repo_inspect(&Repo::new(repo)).await?)?,
        RepoCommand::List => print_json(&client.repo_list().await?)?,
        RepoCommand::Delete { repo } => client.repo_delete(&Repo::new(repo)).await?,
    }
    Ok(())
}

async fn run_commit(client: RemoteClient, action: CommitCommand) -> anyhow::Result<()> {
    match action {
        CommitCommand::Start { repo, parent, id } => {
            let parent = parent.map(|p| Commit::new(repo.as_str(), p));
            let commit = Commit::new(repo, id.unwrap_or_default());
            print_json(&client.commit_start(parent.as_ref(), Some(&commit)).await?)?;
        }
        CommitCommand::Finish { repo, id } => client.commit_finish(&Commit::new(repo, id)).await?,
        CommitCommand::Inspect { repo, id } => {
            print_json(&client.commit_inspect(&Commit::new(repo, id)).await?)?
        }
        CommitCommand::List { repo } => print_json(&client.commit_list(&Repo::new(repo)).await?)?,
        CommitCommand::Delete { repo, id } => client.commit_delete(&Commit::new(repo, id)).await?,
    }
    Ok(())
}

async fn run_file(client: RemoteClient, action: FileCommand) -> anyhow::Result<()> {
    match action {
        FileCommand::Put { repo, commit, path, dir, offset, input } => {
            let file = File::new(Commit::new(repo, commit), path);
            if dir {
                client.file_put(&file, FileType::Dir, offset, Bytes::new()).await?;
            } else {
                let value = read_input(input.as_deref()).await?;
                client.file_put(&file, FileType::Regular, offset, value).await?;
            }
        }
        FileCommand::Get { repo, commit, path, offset, size } => {
            let file = File::new(Commit::new(repo, commit), path);
            let mut stream = client.file_get(&file, offset, size).await?;
            let mut stdout = tokio::io::stdout();
            while let Some(chunk) = stream.next().await {
                stdout.write_all(&chunk?).await?;
            }
            stdout.flush().await?;
        }
        FileCommand::Inspect { repo, commit, path } => {
            let file = File::new(Commit::new(repo, commit), path);
            print_json(&client.file_inspect(&file).await?)?;
        }
        FileCommand::List { repo, commit, path, number, modulo } => {
            let file = File::new(Commit::new(repo, commit), path);
            let filter = number.zip(modulo).map(|(number, modulo)| ShardFilter::new(number, modulo));
            print_json(&client.file_list(&file, filter).await?)?;
        }
        FileCommand::Delete { repo, commit, path } => {
            let file = File::new(Commit::new(repo, commit), path);
            client.file_delete(&file).await?;
        }
    }
    Ok(())
}

async fn run_diff(client: RemoteClient, action: DiffCommand) -> anyhow::Result<()> {
    match action {
        DiffCommand::Pull { repo, commit, shard, output } => {
            let mut stream = client.pull_diff(&Commit::new(repo, commit), shard).await?;
            let mut diff = Vec::new();
            while let Some(chunk) = stream.next().await {
                diff.extend_from_slice(&chunk?);
            }
            match output {
                Some(path) => {
                    tokio::fs::write(&path, &diff).await?;
                    println!("Wrote {} bytes to {}", diff.len(), path.display());
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&diff).await?;
                    stdout.flush().await?;
                }
            }
        }
    }
    Ok(())
}

async fn read_input(path: Option<&Path>) -> anyhow::Result<Bytes> {
    let mut value = Vec::new();
    match path {
        Some(path) => {
            value = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
        }
        None => {
            tokio::io::stdin().read_to_end(&mut value).await?;
        }
    }
    Ok(Bytes::from(value))
}

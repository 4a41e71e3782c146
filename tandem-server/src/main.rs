//! Tandem sync server binary.
//!
//! Every flag can also be set through its `TANDEM_*` environment variable.
//! Log level comes from `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tandem_collab::server::{ServerConfig, SyncServer};

/// Server command line arguments.
#[derive(Parser, Debug)]
#[command(name = "tandem-server")]
#[command(about = "Real-time collaborative text sync server")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "TANDEM_BIND", default_value = "127.0.0.1:8787")]
    bind: String,

    /// WebSocket endpoint path
    #[arg(long, env = "TANDEM_PATH", default_value = "/websocket")]
    path: String,

    /// Frames buffered per session before it is dropped for lagging
    #[arg(long, env = "TANDEM_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,

    /// Seconds a document may sit idle before it is evicted from memory
    #[arg(long, env = "TANDEM_IDLE_EVICTION_SECS", default_value_t = 600)]
    idle_eviction_secs: u64,

    /// RocksDB directory for snapshots (in-memory if omitted)
    #[arg(long, env = "TANDEM_STORAGE", value_name = "PATH")]
    storage: Option<PathBuf>,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            bind_addr: args.bind,
            path: args.path,
            broadcast_capacity: args.broadcast_capacity,
            idle_eviction: Duration::from_secs(args.idle_eviction_secs),
            storage_path: args.storage,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Args::parse());
    match &config.storage_path {
        Some(path) => log::info!("Persisting snapshots to {}", path.display()),
        None => log::warn!("No storage path set, snapshots are kept in memory only"),
    }

    let server = SyncServer::new(config)?;
    server.run().await?;
    Ok(())
}

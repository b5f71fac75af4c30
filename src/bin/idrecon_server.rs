//! idrecon gRPC Server
//!
//! A standalone server binary for running identity reconciliation over gRPC.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use idrecon::storage::{open_database, PersistentConfig, PersistentContactStore};
use idrecon::transport::IdreconServiceImpl;
use idrecon::{ContactStore, IdentityService, InMemoryContactStore, ServiceConfig};

#[derive(Parser, Debug)]
#[command(name = "idrecon-server")]
#[command(about = "Identity reconciliation over gRPC")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(long, env = "IDRECON_ADDR", default_value = "127.0.0.1:50051")]
    addr: SocketAddr,

    /// Data directory for persistent storage
    #[arg(short, long, env = "IDRECON_DATA_DIR", default_value = "./contacts.idrecon")]
    data_dir: PathBuf,

    /// Keep contacts in memory only; nothing survives a restart
    #[arg(long)]
    in_memory: bool,

    /// Longest accepted email or phone number
    #[arg(long, default_value_t = ServiceConfig::DEFAULT_MAX_FIELD_LEN)]
    max_field_len: usize,

    /// Seconds between WAL size checks
    #[arg(long, default_value = "60")]
    compact_interval_secs: u64,

    /// Skip fsync after each commit (faster, loses the last commits on power failure)
    #[arg(long)]
    no_sync: bool,
}

fn spawn_compactor(store: Arc<PersistentContactStore>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let store = Arc::clone(&store);
            match tokio::task::spawn_blocking(move || store.maybe_compact()).await {
                Ok(Ok(Some(result))) => info!(
                    entries = result.entries_compacted,
                    rows = result.rows,
                    "background compaction finished"
                ),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => warn!(error = %e, "background compaction failed"),
                Err(e) => warn!(error = %e, "compaction task panicked"),
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let config = ServiceConfig {
        max_field_len: args.max_field_len,
    }
    .validate()?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting idrecon server");

    let store: Arc<dyn ContactStore> = if args.in_memory {
        info!("using in-memory contact store");
        Arc::new(InMemoryContactStore::new())
    } else {
        info!(data_dir = %args.data_dir.display(), "opening database");
        // Holds an exclusive lock on the directory for the process lifetime.
        let persistent = Arc::new(open_database(
            &args.data_dir,
            Some(PersistentConfig {
                sync_on_write: !args.no_sync,
                ..PersistentConfig::default()
            }),
        )?);
        info!(contacts = persistent.len()?, "database opened");
        spawn_compactor(
            Arc::clone(&persistent),
            Duration::from_secs(args.compact_interval_secs.max(1)),
        );
        persistent
    };

    let svc = IdreconServiceImpl::new(IdentityService::with_config(store, config)).into_server();

    info!(addr = %args.addr, "serving gRPC; press Ctrl+C to stop");

    Server::builder()
        .add_service(svc)
        .serve_with_shutdown(args.addr, async {
            let _ = signal::ctrl_c().await;
        })
        .await?;

    info!("shut down");
    Ok(())
}

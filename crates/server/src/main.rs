//! selfheald - SelfHeal server daemon

use clap::Parser;
use selfheal_common::{BlobStore, Database};
use selfheal_server::config::ServerConfig;
use selfheal_server::server::{self, AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "selfheald")]
#[command(about = "SelfHeal server daemon", version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store directory (overrides config)
    #[arg(long)]
    store: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let config_path = cli
        .config
        .unwrap_or_else(|| selfheal_common::default_store_path().join("config.toml"));
    let mut config = ServerConfig::load(&config_path)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    std::fs::create_dir_all(&config.store_path)?;
    info!("Store: {}", config.store_path.display());

    let db = Database::open(&config.db_path())?;
    let blobs = BlobStore::new(&config.blobs_path()).await?;
    let state = AppState::new(db, blobs, &config);

    let addr: SocketAddr = config.listen.parse()?;
    let server = tokio::spawn(server::serve(addr, state));

    tokio::select! {
        result = server => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use recache::cache::ObjectCache;
use recache::config::Config;
use recache::proxy::ProxyServer;

#[derive(Parser)]
#[command(name = "recache")]
#[command(about = "A caching forward HTTP proxy with conditional revalidation")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Address to listen on for proxy clients
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("recache={}", level))
        .init();

    info!("Starting recache proxy");

    let config = match &args.config {
        Some(path) => {
            let config = Config::from_file(path).await?;
            info!("Loaded configuration from {}", path);
            config
        }
        None => {
            let config = Config::default();
            config.validate()?;
            config
        }
    };

    let cache = match &config.cache.persist_path {
        Some(path) => {
            let cache = ObjectCache::with_log(&config.cache, path).await?;
            info!("Cache persistence enabled at {}", path.display());
            Arc::new(cache)
        }
        None => Arc::new(ObjectCache::new(&config.cache)),
    };

    let server = ProxyServer::new(config, args.bind, cache);

    let shutdown_signal = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        warn!("Received CTRL+C, shutting down gracefully...");
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                tracing::error!("Proxy server error: {}", e);
            }
        }
        _ = shutdown_signal => {
            info!("Shutdown signal received");
        }
    }

    info!("recache shutdown complete");
    Ok(())
}

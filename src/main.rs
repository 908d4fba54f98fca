use proxy_pool_server::scheduler::{reload_proxies, Scheduler};
use proxy_pool_server::server::{self, AppState};
use proxy_pool_server::telemetry;
use proxy_pool_server::{JsonFileStore, ProxyPool, ServerConfig};

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Proxy pool manager for scraping clients.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path of the YAML configuration file.
    #[arg(short, long, env = "PROXY_POOL_CONFIG", default_value = "config.yml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = ServerConfig::from_file(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    info!("configuration loaded from {}, pools: {:?}", cli.config.display(), config.pools);

    if config.metrics.enabled {
        match config.metrics.listen.parse::<std::net::SocketAddr>() {
            Ok(addr) => telemetry::install_exporter(addr),
            Err(e) => warn!("metrics address {} is invalid: {}", config.metrics.listen, e),
        }
    }

    let store = Arc::new(JsonFileStore::new(config.storage.path.clone()));
    let pool = Arc::new(ProxyPool::new(config.pool_settings(), store));
    pool.load().await;

    let state = AppState::new(pool.clone(), config.sources.clone());
    let added = reload_proxies(&state.pool, &state.client, &state.sources).await;
    info!("startup reload added {} proxies", added);
    let _scheduler = Scheduler::start(pool.clone(), config.sources.clone(), &config.schedule);

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    server::serve(listener, state).await?;

    if let Err(e) = pool.save_all().await {
        warn!("final save failed: {}", e);
    }
    Ok(())
}

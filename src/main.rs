use std::sync::Arc;

use alloy::providers::ProviderBuilder;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use equity_ledger::config::Config;
use equity_ledger::db::repository::PgLedgerStore;
use equity_ledger::db::LedgerStore;
use equity_ledger::indexer::pipeline::{IngestionPipeline, PipelineSettings};
use equity_ledger::indexer::source::{AlloyChainSource, ChainSource};
use equity_ledger::indexer::watcher::{LiveWatcher, WatcherSettings};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    // Initialize structured logging (set RUST_LOG=info for output)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    tracing::info!("Equity ledger indexer starting");

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path)?;
    let token = config.chain.token()?;
    tracing::info!(
        chain = %config.chain.name,
        token = %token,
        "Configuration loaded from {}",
        config_path
    );

    // Create database connection pool
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .map_err(|e| eyre::eyre!("Failed to connect to database: {}", e))?;

    tracing::info!("Connected to PostgreSQL");

    // Run migrations
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| eyre::eyre!("Failed to run migrations: {}", e))?;

    tracing::info!("Database migrations complete");

    let store = Arc::new(PgLedgerStore::new(pool));

    let rpc_url = config
        .chain
        .rpc_http
        .parse()
        .map_err(|e| eyre::eyre!("Invalid RPC URL: {}", e))?;
    let provider = ProviderBuilder::new().connect_http(rpc_url);
    let source: Arc<dyn ChainSource> = Arc::new(AlloyChainSource::new(provider, token));

    let ledger: Arc<dyn LedgerStore> = store.clone();
    let pipeline = Arc::new(IngestionPipeline::new(
        ledger.clone(),
        source,
        PipelineSettings {
            token,
            max_reorg_depth: config.chain.max_reorg_depth,
        },
    ));

    let watermark = pipeline.current_watermark().await?;
    tracing::info!(?watermark, start_block = config.chain.start_block, "Ledger state loaded");

    let watcher = Arc::new(LiveWatcher::new(
        pipeline,
        WatcherSettings::from(&config.chain),
    ));

    // Spawn API server
    if config.api.enabled {
        let api_store = ledger.clone();
        let api_watcher = watcher.clone();
        let host = config.api.host.clone();
        let port = config.api.port;
        tokio::spawn(async move {
            if let Err(e) = equity_ledger::api::serve(api_store, api_watcher, &host, port).await {
                tracing::error!(error = %e, "API server failed");
            }
        });
    }

    if config.chain.auto_start {
        watcher.start().await;
        tracing::info!("Live watcher started. Press Ctrl+C to stop.");
    } else {
        tracing::info!("Auto-start disabled; start the watcher via the API. Press Ctrl+C to stop.");
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping watcher...");

    if let Err(e) = watcher.stop().await {
        tracing::error!(error = %e, "Watcher had halted before shutdown");
    }

    store.close().await;

    tracing::info!("Equity ledger indexer stopped gracefully");
    Ok(())
}

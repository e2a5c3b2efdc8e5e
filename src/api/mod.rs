pub mod handlers;
pub mod types;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::analytics::CapTable;
use crate::db::LedgerStore;
use crate::indexer::watcher::LiveWatcher;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub cap_table: CapTable,
    pub watcher: Arc<LiveWatcher>,
}

pub fn router(store: Arc<dyn LedgerStore>, watcher: Arc<LiveWatcher>) -> Router {
    let state = Arc::new(AppState {
        cap_table: CapTable::new(store.clone()),
        store,
        watcher,
    });

    Router::new()
        .route("/api/v1/health", get(handlers::health))
        .route("/api/v1/captable/holders", get(handlers::captable_holders))
        .route("/api/v1/captable/top/{n}", get(handlers::captable_top))
        .route("/api/v1/captable/summary", get(handlers::captable_summary))
        .route("/api/v1/holders/{address}", get(handlers::holder_detail))
        .route("/api/v1/events", get(handlers::list_events))
        .route("/api/v1/balances", get(handlers::list_balances))
        .route("/api/v1/balances/{address}", get(handlers::balance_of))
        .route(
            "/api/v1/corporate-actions",
            get(handlers::list_corporate_actions),
        )
        .route("/api/v1/watcher", get(handlers::watcher_status))
        .route("/api/v1/watcher/start", post(handlers::watcher_start))
        .route("/api/v1/watcher/stop", post(handlers::watcher_stop))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub async fn serve(
    store: Arc<dyn LedgerStore>,
    watcher: Arc<LiveWatcher>,
    host: &str,
    port: u16,
) -> eyre::Result<()> {
    let app = router(store, watcher);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "API server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

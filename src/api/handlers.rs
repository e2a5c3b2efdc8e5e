use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use bigdecimal::{BigDecimal, Zero};
use std::str::FromStr;
use std::sync::Arc;

use super::types::*;
use super::AppState;
use crate::error::{IndexerError, QueryError};
use crate::indexer::types::EventKind;
use crate::indexer::watcher::WatcherStatus;
use crate::ledger::corporate;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;
type ApiError = (StatusCode, Json<ErrorResponse>);

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

fn api_error(status: StatusCode, msg: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: msg.into(),
        }),
    )
}

fn ledger_error(e: IndexerError) -> ApiError {
    tracing::error!(error = %e, "Ledger read failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn query_error(e: QueryError) -> ApiError {
    match e {
        QueryError::InvalidArgument(msg) => api_error(StatusCode::BAD_REQUEST, msg),
        QueryError::NotFound(msg) => api_error(StatusCode::NOT_FOUND, msg),
        QueryError::Ledger(e) => ledger_error(e),
    }
}

fn parse_address(hex: &str) -> Result<alloy::primitives::Address, ApiError> {
    hex_to_address(hex).map_err(|e| api_error(StatusCode::BAD_REQUEST, e))
}

fn parse_limit(limit: Option<i64>) -> Result<u32, ApiError> {
    match limit.unwrap_or(DEFAULT_LIMIT) {
        n if n <= 0 => Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("limit must be positive, got {}", n),
        )),
        n => Ok(n.min(MAX_LIMIT) as u32),
    }
}

// ============================================================
// Health
// ============================================================

pub async fn health(State(state): State<Arc<AppState>>) -> ApiResult<HealthResponse> {
    let watermark = state.store.watermark().await.map_err(ledger_error)?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        watermark,
        watcher: state.watcher.status().await,
    }))
}

// ============================================================
// Cap table
// ============================================================

pub async fn captable_holders(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitParams>,
) -> ApiResult<HoldersResponse> {
    let limit = match params.limit {
        Some(_) => Some(parse_limit(params.limit)? as usize),
        None => None,
    };
    let holders = state.cap_table.holders(limit).await.map_err(query_error)?;
    let holders: Vec<HolderResponse> = holders.into_iter().map(Into::into).collect();
    Ok(Json(HoldersResponse {
        count: holders.len(),
        holders,
    }))
}

pub async fn captable_top(
    State(state): State<Arc<AppState>>,
    Path(n): Path<i64>,
) -> ApiResult<HoldersResponse> {
    let holders = state.cap_table.top_n(n).await.map_err(query_error)?;
    let holders: Vec<HolderResponse> = holders.into_iter().map(Into::into).collect();
    Ok(Json(HoldersResponse {
        count: holders.len(),
        holders,
    }))
}

pub async fn captable_summary(State(state): State<Arc<AppState>>) -> ApiResult<SummaryResponse> {
    state
        .cap_table
        .summary()
        .await
        .map(|s| Json(s.into()))
        .map_err(query_error)
}

pub async fn holder_detail(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> ApiResult<HolderDetailResponse> {
    let addr = parse_address(&address)?;
    state
        .cap_table
        .holder_detail(addr)
        .await
        .map(|d| Json(d.into()))
        .map_err(query_error)
}

// ============================================================
// Events
// ============================================================

pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventParams>,
) -> ApiResult<EventsResponse> {
    let limit = parse_limit(params.limit)?;
    let kind = params
        .kind
        .as_deref()
        .map(EventKind::from_str)
        .transpose()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    let address = params.address.as_deref().map(parse_address).transpose()?;

    let events = if params.from_block.is_some() || params.to_block.is_some() {
        let from = params.from_block.unwrap_or(0);
        let to = params.to_block.unwrap_or(u64::MAX);
        if from > to {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                format!("from_block {} is after to_block {}", from, to),
            ));
        }
        state
            .store
            .events_by_block_range(from, to)
            .await
            .map_err(ledger_error)?
    } else if let Some(addr) = address {
        // The kind filter runs after the fetch, so widen it
        let fetch = if kind.is_some() { MAX_LIMIT as u32 } else { limit };
        state
            .store
            .events_by_address(addr, fetch)
            .await
            .map_err(ledger_error)?
    } else if let Some(kind) = kind {
        state
            .store
            .events_by_kind(kind, limit)
            .await
            .map_err(ledger_error)?
    } else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "One of kind, address, from_block or to_block is required",
        ));
    };

    let events: Vec<EventResponse> = events
        .into_iter()
        .filter(|e| kind.map_or(true, |k| e.event.kind == k))
        .filter(|e| {
            address.map_or(true, |a| e.event.from == Some(a) || e.event.to == Some(a))
        })
        .take(limit as usize)
        .map(Into::into)
        .collect();

    Ok(Json(EventsResponse {
        count: events.len(),
        events,
    }))
}

// ============================================================
// Balances
// ============================================================

pub async fn balance_of(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> ApiResult<BalanceResponse> {
    let addr = parse_address(&address)?;
    let raw_balance = state.store.balance(addr).await.map_err(ledger_error)?;
    Ok(Json(BalanceResponse {
        address: bytes_to_hex(addr.as_slice()),
        raw_balance,
    }))
}

pub async fn list_balances(
    State(state): State<Arc<AppState>>,
    Query(params): Query<BalanceParams>,
) -> ApiResult<BalancesResponse> {
    let limit = parse_limit(params.limit)?;
    let threshold = match params.min.as_deref() {
        Some(min) => BigDecimal::from_str(min)
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("Invalid min: {}", e)))?,
        None => BigDecimal::zero(),
    };

    let balances: Vec<BalanceResponse> = state
        .store
        .balances_above(&threshold, limit)
        .await
        .map_err(ledger_error)?
        .into_iter()
        .map(Into::into)
        .collect();

    Ok(Json(BalancesResponse {
        count: balances.len(),
        balances,
    }))
}

// ============================================================
// Corporate actions
// ============================================================

pub async fn list_corporate_actions(
    State(state): State<Arc<AppState>>,
) -> ApiResult<CorporateActionsResponse> {
    let actions = state.store.corporate_actions().await.map_err(ledger_error)?;

    let split_multiplier = corporate::split_multiplier(&actions)
        .map_err(ledger_error)?
        .basis_points()
        .clone();

    Ok(Json(CorporateActionsResponse {
        corporate_actions: actions.into_iter().map(Into::into).collect(),
        split_multiplier,
    }))
}

// ============================================================
// Watcher control
// ============================================================

pub async fn watcher_status(State(state): State<Arc<AppState>>) -> ApiResult<WatcherResponse> {
    let watermark = state.watcher.current_watermark().await.map_err(ledger_error)?;
    Ok(Json(WatcherResponse {
        watcher: state.watcher.status().await,
        watermark,
        changed: false,
    }))
}

pub async fn watcher_start(State(state): State<Arc<AppState>>) -> ApiResult<WatcherResponse> {
    let changed = state.watcher.start().await;
    tracing::info!(changed, "Watcher start requested");
    let watermark = state.watcher.current_watermark().await.map_err(ledger_error)?;
    Ok(Json(WatcherResponse {
        watcher: state.watcher.status().await,
        watermark,
        changed,
    }))
}

pub async fn watcher_stop(State(state): State<Arc<AppState>>) -> ApiResult<WatcherResponse> {
    let changed = state.watcher.status().await != WatcherStatus::Stopped;
    let watcher = match state.watcher.stop().await {
        Ok(()) => WatcherStatus::Stopped,
        Err(e) => WatcherStatus::Halted {
            reason: e.to_string(),
        },
    };
    tracing::info!(changed, "Watcher stop requested");

    let watermark = state.watcher.current_watermark().await.map_err(ledger_error)?;
    Ok(Json(WatcherResponse {
        watcher,
        watermark,
        changed,
    }))
}

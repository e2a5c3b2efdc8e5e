use alloy::primitives::Address;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analytics::captable::{BalanceChange, CapTableSummary, HolderDetail, HolderEntry};
use crate::indexer::types::StoredEvent;
use crate::indexer::watcher::WatcherStatus;
use crate::ledger::balances::BalanceRecord;
use crate::ledger::corporate::CorporateActionRecord;

// ============================================================
// Hex conversion helpers
// ============================================================

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

pub fn hex_to_bytes(hex_str: &str) -> Result<Vec<u8>, String> {
    let stripped = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    hex::decode(stripped).map_err(|e| format!("Invalid hex address: {}", e))
}

pub fn hex_to_address(hex_str: &str) -> Result<Address, String> {
    let bytes = hex_to_bytes(hex_str)?;
    if bytes.len() != 20 {
        return Err(format!(
            "Invalid address length: expected 20 bytes, got {}",
            bytes.len()
        ));
    }
    Ok(Address::from_slice(&bytes))
}

fn opt_hex(address: Option<Address>) -> Option<String> {
    address.map(|a| bytes_to_hex(a.as_slice()))
}

// ============================================================
// Query params
// ============================================================

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct EventParams {
    pub kind: Option<String>,
    pub address: Option<String>,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct BalanceParams {
    /// Raw balance threshold, decimal string.
    pub min: Option<String>,
    pub limit: Option<i64>,
}

// ============================================================
// Responses
// ============================================================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub watermark: Option<u64>,
    pub watcher: WatcherStatus,
}

#[derive(Debug, Serialize)]
pub struct WatcherResponse {
    pub watcher: WatcherStatus,
    pub watermark: Option<u64>,
    /// Whether the request changed anything.
    pub changed: bool,
}

#[derive(Debug, Serialize)]
pub struct HolderResponse {
    pub address: String,
    pub display_balance: BigDecimal,
    pub raw_balance: BigDecimal,
    pub ownership_percentage: f64,
}

impl From<HolderEntry> for HolderResponse {
    fn from(h: HolderEntry) -> Self {
        Self {
            address: bytes_to_hex(h.address.as_slice()),
            display_balance: h.display_balance,
            raw_balance: h.raw_balance,
            ownership_percentage: h.ownership_percentage,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HoldersResponse {
    pub holders: Vec<HolderResponse>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub holder_count: u64,
    pub total_supply: BigDecimal,
    pub median_holding: BigDecimal,
    pub average_holding: BigDecimal,
    pub top10_concentration: f64,
    pub hhi_index: f64,
    pub split_multiplier: BigDecimal,
    pub watermark: Option<u64>,
}

impl From<CapTableSummary> for SummaryResponse {
    fn from(s: CapTableSummary) -> Self {
        Self {
            holder_count: s.holder_count,
            total_supply: s.total_supply,
            median_holding: s.median_holding,
            average_holding: s.average_holding,
            top10_concentration: s.top10_concentration,
            hhi_index: s.hhi_index,
            split_multiplier: s.split_multiplier,
            watermark: s.watermark,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BalanceChangeResponse {
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: Option<u64>,
    pub counterparty: Option<String>,
    pub delta: BigDecimal,
    pub raw_balance: BigDecimal,
    pub timestamp: DateTime<Utc>,
}

impl From<BalanceChange> for BalanceChangeResponse {
    fn from(c: BalanceChange) -> Self {
        Self {
            block_number: c.block_number,
            tx_hash: bytes_to_hex(c.tx_hash.as_slice()),
            log_index: c.log_index,
            counterparty: opt_hex(c.counterparty),
            delta: c.delta,
            raw_balance: c.raw_balance,
            timestamp: c.timestamp,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HolderDetailResponse {
    pub address: String,
    pub balance: BigDecimal,
    pub raw_balance: BigDecimal,
    pub ownership_percentage: f64,
    pub is_approved: bool,
    pub balance_history: Vec<BalanceChangeResponse>,
}

impl From<HolderDetail> for HolderDetailResponse {
    fn from(d: HolderDetail) -> Self {
        Self {
            address: bytes_to_hex(d.address.as_slice()),
            balance: d.balance,
            raw_balance: d.raw_balance,
            ownership_percentage: d.ownership_percentage,
            is_approved: d.is_approved,
            balance_history: d.balance_history.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub id: i64,
    pub kind: String,
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: Option<u64>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub amount: Option<BigDecimal>,
    pub payload: Option<serde_json::Value>,
    pub block_timestamp: DateTime<Utc>,
}

impl From<StoredEvent> for EventResponse {
    fn from(s: StoredEvent) -> Self {
        let e = s.event;
        Self {
            id: s.id,
            kind: e.kind.to_string(),
            block_number: e.block_number,
            tx_hash: bytes_to_hex(e.tx_hash.as_slice()),
            log_index: e.log_index,
            from: opt_hex(e.from),
            to: opt_hex(e.to),
            amount: e.amount,
            payload: e.payload,
            block_timestamp: e.block_timestamp,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<EventResponse>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub address: String,
    pub raw_balance: BigDecimal,
}

impl From<BalanceRecord> for BalanceResponse {
    fn from(b: BalanceRecord) -> Self {
        Self {
            address: bytes_to_hex(b.address.as_slice()),
            raw_balance: b.raw_balance,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BalancesResponse {
    pub balances: Vec<BalanceResponse>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct CorporateActionResponse {
    pub kind: String,
    pub block_number: u64,
    pub tx_hash: String,
    pub old_value: String,
    pub new_value: String,
    pub block_timestamp: DateTime<Utc>,
}

impl From<CorporateActionRecord> for CorporateActionResponse {
    fn from(a: CorporateActionRecord) -> Self {
        Self {
            kind: a.kind.as_str().to_string(),
            block_number: a.block_number,
            tx_hash: bytes_to_hex(a.tx_hash.as_slice()),
            old_value: a.old_value,
            new_value: a.new_value,
            block_timestamp: a.block_timestamp,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CorporateActionsResponse {
    pub corporate_actions: Vec<CorporateActionResponse>,
    pub split_multiplier: BigDecimal,
}

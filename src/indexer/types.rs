use alloy::primitives::{Address, Bytes, B256};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

/// The seven event kinds the equity token emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Transfer,
    WalletApproved,
    WalletRevoked,
    StockSplit,
    SymbolChanged,
    NameChanged,
    TransferBlocked,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        Self::Transfer,
        Self::WalletApproved,
        Self::WalletRevoked,
        Self::StockSplit,
        Self::SymbolChanged,
        Self::NameChanged,
        Self::TransferBlocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transfer => "Transfer",
            Self::WalletApproved => "WalletApproved",
            Self::WalletRevoked => "WalletRevoked",
            Self::StockSplit => "StockSplit",
            Self::SymbolChanged => "SymbolChanged",
            Self::NameChanged => "NameChanged",
            Self::TransferBlocked => "TransferBlocked",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("Unknown event kind '{}'", s))
    }
}

/// A log as reported by the chain-log source, before classification.
#[derive(Debug, Clone)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: Option<u64>,
    pub block_hash: Option<B256>,
    pub tx_hash: Option<B256>,
    pub log_index: Option<u64>,
    /// Unix seconds.
    pub block_timestamp: Option<u64>,
}

/// A classified event, ready for the event store.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainEvent {
    pub block_number: u64,
    pub block_hash: Option<B256>,
    pub tx_hash: B256,
    pub log_index: Option<u64>,
    pub kind: EventKind,
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub amount: Option<BigDecimal>,
    pub payload: Option<JsonValue>,
    pub block_timestamp: DateTime<Utc>,
}

impl ChainEvent {
    /// Natural key used to make insertion idempotent.
    ///
    /// (tx hash, log index) when the log position is known, otherwise
    /// (block, kind, from, to, amount).
    pub fn dedupe_key(&self) -> String {
        match self.log_index {
            Some(index) => format!("log:{:#x}:{}", self.tx_hash, index),
            None => format!(
                "blk:{}:{}:{}:{}:{}",
                self.block_number,
                self.kind,
                self.from.map(|a| format!("{:#x}", a)).unwrap_or_default(),
                self.to.map(|a| format!("{:#x}", a)).unwrap_or_default(),
                self.amount
                    .as_ref()
                    .map(|a| a.with_scale(0).to_string())
                    .unwrap_or_default(),
            ),
        }
    }

    /// Ordering key for replay: ascending block, then log position.
    pub fn replay_order(&self) -> (u64, u64) {
        (self.block_number, self.log_index.unwrap_or(u64::MAX))
    }

    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.as_ref()?.get(field)?.as_str()
    }
}

/// An event as read back from the event store.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub id: i64,
    pub event: ChainEvent,
    pub ingested_at: DateTime<Utc>,
}

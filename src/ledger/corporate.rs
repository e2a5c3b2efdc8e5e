use alloy::primitives::B256;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use std::str::FromStr;

use super::multiplier::SplitMultiplier;
use crate::error::IndexerError;
use crate::indexer::types::{ChainEvent, EventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorporateActionKind {
    StockSplit,
    SymbolChange,
    NameChange,
}

impl CorporateActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StockSplit => "stock_split",
            Self::SymbolChange => "symbol_change",
            Self::NameChange => "name_change",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stock_split" => Some(Self::StockSplit),
            "symbol_change" => Some(Self::SymbolChange),
            "name_change" => Some(Self::NameChange),
            _ => None,
        }
    }
}

/// Audit row for a split, symbol change or name change.
#[derive(Debug, Clone, PartialEq)]
pub struct CorporateActionRecord {
    pub kind: CorporateActionKind,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: Option<u64>,
    /// For splits: cumulative multiplier before the split, in basis points.
    pub old_value: String,
    /// For splits: this split's ratio in basis points.
    pub new_value: String,
    pub block_timestamp: DateTime<Utc>,
}

impl CorporateActionRecord {
    /// Build the audit row for a corporate-action event. Old/new values come from
    /// the chain-reported payload, never recomputed here.
    pub fn from_event(event: &ChainEvent) -> Result<Option<Self>, IndexerError> {
        let (kind, old_field, new_field) = match event.kind {
            EventKind::StockSplit => (
                CorporateActionKind::StockSplit,
                "previous_multiplier",
                "split_multiplier",
            ),
            EventKind::SymbolChanged => (CorporateActionKind::SymbolChange, "old_symbol", "new_symbol"),
            EventKind::NameChanged => (CorporateActionKind::NameChange, "old_name", "new_name"),
            _ => return Ok(None),
        };

        let field = |name: &str| {
            event
                .payload_str(name)
                .map(str::to_string)
                .ok_or_else(|| IndexerError::MalformedPayload {
                    kind: event.kind.as_str(),
                    block_number: event.block_number,
                    reason: format!("payload has no '{}'", name),
                })
        };

        let record = Self {
            kind,
            block_number: event.block_number,
            tx_hash: event.tx_hash,
            log_index: event.log_index,
            old_value: field(old_field)?,
            new_value: field(new_field)?,
            block_timestamp: event.block_timestamp,
        };

        if kind == CorporateActionKind::StockSplit {
            record.split_ratio()?;
        }

        Ok(Some(record))
    }

    /// Ratio of a split in basis points. Errors for non-splits or non-positive values.
    pub fn split_ratio(&self) -> Result<BigDecimal, IndexerError> {
        let malformed = |reason: String| IndexerError::MalformedPayload {
            kind: EventKind::StockSplit.as_str(),
            block_number: self.block_number,
            reason,
        };

        if self.kind != CorporateActionKind::StockSplit {
            return Err(malformed(format!("{} has no split ratio", self.kind.as_str())));
        }

        let ratio = BigDecimal::from_str(&self.new_value)
            .map_err(|e| malformed(format!("split multiplier '{}': {}", self.new_value, e)))?;
        if !ratio.is_integer() || ratio <= BigDecimal::from(0) {
            return Err(malformed(format!(
                "split multiplier '{}' is not a positive integer",
                self.new_value
            )));
        }
        Ok(ratio.with_scale(0))
    }
}

/// Fold the splits among `actions` (block order) into the cumulative multiplier.
/// A stored split with an unreadable ratio is an error, not skipped.
pub fn split_multiplier(actions: &[CorporateActionRecord]) -> Result<SplitMultiplier, IndexerError> {
    let ratios = actions
        .iter()
        .filter(|a| a.kind == CorporateActionKind::StockSplit)
        .map(CorporateActionRecord::split_ratio)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SplitMultiplier::from_splits(&ratios))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: EventKind, payload: serde_json::Value) -> ChainEvent {
        ChainEvent {
            block_number: 12,
            block_hash: None,
            tx_hash: B256::repeat_byte(1),
            log_index: Some(0),
            kind,
            from: None,
            to: None,
            amount: None,
            payload: Some(payload),
            block_timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_split_record_uses_payload_values() {
        let ev = event(
            EventKind::StockSplit,
            json!({ "previous_multiplier": "10000", "split_multiplier": "20000" }),
        );
        let record = CorporateActionRecord::from_event(&ev).unwrap().unwrap();
        assert_eq!(record.kind, CorporateActionKind::StockSplit);
        assert_eq!(record.old_value, "10000");
        assert_eq!(record.new_value, "20000");
        assert_eq!(record.split_ratio().unwrap(), BigDecimal::from(20000));
    }

    #[test]
    fn test_name_change_record() {
        let ev = event(EventKind::NameChanged, json!({ "old_name": "Acme", "new_name": "Acme Holdings" }));
        let record = CorporateActionRecord::from_event(&ev).unwrap().unwrap();
        assert_eq!(record.kind, CorporateActionKind::NameChange);
        assert_eq!(record.new_value, "Acme Holdings");
        assert!(record.split_ratio().is_err());
    }

    #[test]
    fn test_missing_payload_field_is_malformed() {
        let ev = event(EventKind::SymbolChanged, json!({ "old_symbol": "ACME" }));
        assert!(matches!(
            CorporateActionRecord::from_event(&ev),
            Err(IndexerError::MalformedPayload { block_number: 12, .. })
        ));
    }

    #[test]
    fn test_non_integer_split_is_malformed() {
        let ev = event(
            EventKind::StockSplit,
            json!({ "previous_multiplier": "10000", "split_multiplier": "1.5" }),
        );
        assert!(CorporateActionRecord::from_event(&ev).is_err());
    }

    #[test]
    fn test_transfers_have_no_corporate_action() {
        let mut ev = event(EventKind::Transfer, json!(null));
        ev.payload = None;
        assert!(CorporateActionRecord::from_event(&ev).unwrap().is_none());
    }

    #[test]
    fn test_split_multiplier_skips_other_actions() {
        let split = |ratio: &str| {
            let ev = event(
                EventKind::StockSplit,
                json!({ "previous_multiplier": "10000", "split_multiplier": ratio }),
            );
            CorporateActionRecord::from_event(&ev).unwrap().unwrap()
        };
        let rename = CorporateActionRecord::from_event(&event(
            EventKind::SymbolChanged,
            json!({ "old_symbol": "ACME", "new_symbol": "ACMX" }),
        ))
        .unwrap()
        .unwrap();

        let m = split_multiplier(&[split("20000"), rename, split("15000")]).unwrap();
        assert_eq!(m.basis_points(), &BigDecimal::from(30000));
        assert_eq!(split_multiplier(&[]).unwrap(), SplitMultiplier::identity());
    }

    #[test]
    fn test_split_multiplier_rejects_corrupt_stored_split() {
        let mut corrupt = CorporateActionRecord::from_event(&event(
            EventKind::StockSplit,
            json!({ "previous_multiplier": "10000", "split_multiplier": "20000" }),
        ))
        .unwrap()
        .unwrap();
        corrupt.new_value = "two".into();

        assert!(matches!(
            split_multiplier(&[corrupt]),
            Err(IndexerError::MalformedPayload { block_number: 12, .. })
        ));
    }

    #[test]
    fn test_kind_round_trips() {
        for kind in [
            CorporateActionKind::StockSplit,
            CorporateActionKind::SymbolChange,
            CorporateActionKind::NameChange,
        ] {
            assert_eq!(CorporateActionKind::parse(kind.as_str()), Some(kind));
        }
    }
}

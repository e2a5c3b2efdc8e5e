use alloy::primitives::{Address, B256, U256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use bigdecimal::BigDecimal;
use chrono::DateTime;
use serde_json::json;
use std::str::FromStr;

use super::types::{ChainEvent, EventKind, RawLog};
use crate::error::IndexerError;

// Event ABI of the equity token. sol! gives us SIGNATURE_HASH and typed decoders.
sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);
    event WalletApproved(address indexed wallet);
    event WalletRevoked(address indexed wallet);
    event StockSplit(uint256 previousMultiplier, uint256 splitMultiplier);
    event SymbolChanged(string oldSymbol, string newSymbol);
    event NameChanged(string oldName, string newName);
    event TransferBlocked(address indexed from, address indexed to, uint256 amount);
}

/// Map a topic0 to the event kind it announces.
pub fn kind_for_signature(topic0: &B256) -> Option<EventKind> {
    EventKind::ALL
        .into_iter()
        .find(|kind| signature_for_kind(*kind) == *topic0)
}

/// The topic0 for an event kind. Used to build logs in tests and filters.
pub fn signature_for_kind(kind: EventKind) -> B256 {
    match kind {
        EventKind::Transfer => Transfer::SIGNATURE_HASH,
        EventKind::WalletApproved => WalletApproved::SIGNATURE_HASH,
        EventKind::WalletRevoked => WalletRevoked::SIGNATURE_HASH,
        EventKind::StockSplit => StockSplit::SIGNATURE_HASH,
        EventKind::SymbolChanged => SymbolChanged::SIGNATURE_HASH,
        EventKind::NameChanged => NameChanged::SIGNATURE_HASH,
        EventKind::TransferBlocked => TransferBlocked::SIGNATURE_HASH,
    }
}

/// Decoded fields of a log, before block metadata is attached.
struct Decoded {
    from: Option<Address>,
    to: Option<Address>,
    amount: Option<BigDecimal>,
    payload: Option<serde_json::Value>,
}

/// Classify a raw log into a [`ChainEvent`].
///
/// Returns `Ok(None)` if:
/// - The log was emitted by a contract other than `token`
/// - topic0 is not one of the seven known signatures
///
/// A known signature that fails to decode is an error: skipping it would
/// desynchronize the ledger from the chain.
pub fn classify_log(log: &RawLog, token: Address) -> Result<Option<ChainEvent>, IndexerError> {
    if log.address != token {
        return Ok(None);
    }

    let Some(kind) = log.topics.first().and_then(kind_for_signature) else {
        tracing::debug!(
            block = ?log.block_number,
            topic0 = ?log.topics.first(),
            "Ignoring log with unknown signature"
        );
        return Ok(None);
    };

    let malformed = |reason: String| IndexerError::MalformedPayload {
        kind: kind.as_str(),
        block_number: log.block_number.unwrap_or_default(),
        reason,
    };

    let block_number = log
        .block_number
        .ok_or_else(|| malformed("log has no block number".into()))?;
    let tx_hash = log
        .tx_hash
        .ok_or_else(|| malformed("log has no transaction hash".into()))?;
    let block_timestamp = log
        .block_timestamp
        .and_then(|ts| DateTime::from_timestamp(ts as i64, 0))
        .ok_or_else(|| malformed("log has no block timestamp".into()))?;

    let decoded = decode_fields(kind, log).map_err(malformed)?;

    Ok(Some(ChainEvent {
        block_number,
        block_hash: log.block_hash,
        tx_hash,
        log_index: log.log_index,
        kind,
        from: decoded.from,
        to: decoded.to,
        amount: decoded.amount,
        payload: decoded.payload,
        block_timestamp,
    }))
}

fn decode_fields(kind: EventKind, log: &RawLog) -> Result<Decoded, String> {
    let topics = log.topics.iter().copied();
    let data = log.data.as_ref();

    let decoded = match kind {
        EventKind::Transfer => {
            let ev = Transfer::decode_raw_log(topics, data).map_err(|e| e.to_string())?;
            Decoded {
                from: Some(ev.from),
                to: Some(ev.to),
                amount: Some(u256_to_decimal(ev.value)?),
                payload: None,
            }
        }
        EventKind::WalletApproved => {
            let ev = WalletApproved::decode_raw_log(topics, data).map_err(|e| e.to_string())?;
            Decoded {
                from: None,
                to: Some(ev.wallet),
                amount: None,
                payload: Some(json!({ "wallet": format!("{:#x}", ev.wallet) })),
            }
        }
        EventKind::WalletRevoked => {
            let ev = WalletRevoked::decode_raw_log(topics, data).map_err(|e| e.to_string())?;
            Decoded {
                from: None,
                to: Some(ev.wallet),
                amount: None,
                payload: Some(json!({ "wallet": format!("{:#x}", ev.wallet) })),
            }
        }
        EventKind::StockSplit => {
            let ev = StockSplit::decode_raw_log(topics, data).map_err(|e| e.to_string())?;
            if ev.previousMultiplier.is_zero() || ev.splitMultiplier.is_zero() {
                return Err("split multipliers must be positive".into());
            }
            Decoded {
                from: None,
                to: None,
                amount: None,
                payload: Some(json!({
                    "previous_multiplier": ev.previousMultiplier.to_string(),
                    "split_multiplier": ev.splitMultiplier.to_string(),
                })),
            }
        }
        EventKind::SymbolChanged => {
            let ev = SymbolChanged::decode_raw_log(topics, data).map_err(|e| e.to_string())?;
            Decoded {
                from: None,
                to: None,
                amount: None,
                payload: Some(json!({ "old_symbol": ev.oldSymbol, "new_symbol": ev.newSymbol })),
            }
        }
        EventKind::NameChanged => {
            let ev = NameChanged::decode_raw_log(topics, data).map_err(|e| e.to_string())?;
            Decoded {
                from: None,
                to: None,
                amount: None,
                payload: Some(json!({ "old_name": ev.oldName, "new_name": ev.newName })),
            }
        }
        EventKind::TransferBlocked => {
            let ev = TransferBlocked::decode_raw_log(topics, data).map_err(|e| e.to_string())?;
            Decoded {
                from: Some(ev.from),
                to: Some(ev.to),
                amount: Some(u256_to_decimal(ev.amount)?),
                payload: None,
            }
        }
    };

    Ok(decoded)
}

fn u256_to_decimal(value: U256) -> Result<BigDecimal, String> {
    BigDecimal::from_str(&value.to_string()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::testing::{split_log, symbol_log, transfer_log, TOKEN};
    use alloy::primitives::{address, Bytes};

    const ALICE: Address = address!("00000000000000000000000000000000000000a1");

    #[test]
    fn test_classify_mint() {
        let log = transfer_log(3, 0, Address::ZERO, ALICE, 1000);
        let event = classify_log(&log, TOKEN).unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Transfer);
        assert_eq!(event.block_number, 3);
        assert_eq!(event.from, Some(Address::ZERO));
        assert_eq!(event.to, Some(ALICE));
        assert_eq!(event.amount, Some(BigDecimal::from(1000)));
    }

    #[test]
    fn test_classify_split_payload() {
        let log = split_log(5, 1, 10_000, 20_000);
        let event = classify_log(&log, TOKEN).unwrap().unwrap();
        assert_eq!(event.kind, EventKind::StockSplit);
        assert_eq!(event.payload_str("previous_multiplier"), Some("10000"));
        assert_eq!(event.payload_str("split_multiplier"), Some("20000"));
    }

    #[test]
    fn test_classify_symbol_change() {
        let log = symbol_log(9, 0, "ACME", "ACMX");
        let event = classify_log(&log, TOKEN).unwrap().unwrap();
        assert_eq!(event.kind, EventKind::SymbolChanged);
        assert_eq!(event.payload_str("old_symbol"), Some("ACME"));
        assert_eq!(event.payload_str("new_symbol"), Some("ACMX"));
    }

    #[test]
    fn test_zero_split_multiplier_is_malformed() {
        let log = split_log(5, 1, 10_000, 0);
        let err = classify_log(&log, TOKEN).unwrap_err();
        assert!(matches!(err, IndexerError::MalformedPayload { kind: "StockSplit", .. }));
    }

    #[test]
    fn test_unknown_signature_is_ignored() {
        let mut log = transfer_log(3, 0, Address::ZERO, ALICE, 1000);
        log.topics[0] = B256::repeat_byte(0x42);
        assert!(classify_log(&log, TOKEN).unwrap().is_none());
    }

    #[test]
    fn test_other_contract_is_ignored() {
        let mut log = transfer_log(3, 0, Address::ZERO, ALICE, 1000);
        log.address = address!("00000000000000000000000000000000000000ff");
        assert!(classify_log(&log, TOKEN).unwrap().is_none());
    }

    #[test]
    fn test_truncated_transfer_is_malformed() {
        let mut log = transfer_log(3, 0, Address::ZERO, ALICE, 1000);
        log.data = Bytes::from(vec![0u8; 4]);
        assert!(matches!(
            classify_log(&log, TOKEN),
            Err(IndexerError::MalformedPayload { kind: "Transfer", block_number: 3, .. })
        ));
    }

    #[test]
    fn test_signatures_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(kind_for_signature(&signature_for_kind(kind)), Some(kind));
        }
    }
}

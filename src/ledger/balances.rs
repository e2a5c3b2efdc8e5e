use alloy::primitives::{Address, B256};
use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::IndexerError;
use crate::indexer::types::{ChainEvent, EventKind};

/// One row of the balance ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceRecord {
    pub address: Address,
    /// Pre-multiplier balance.
    pub raw_balance: BigDecimal,
    pub last_block: u64,
    pub last_updated_at: DateTime<Utc>,
}

/// The balance-relevant fields of a Transfer event.
#[derive(Debug, Clone)]
pub struct TransferEffect {
    pub from: Address,
    pub to: Address,
    pub amount: BigDecimal,
    pub block_number: u64,
    pub tx_hash: B256,
    pub timestamp: DateTime<Utc>,
}

impl TransferEffect {
    /// Extract the effect of a Transfer event. Other kinds have none.
    pub fn from_event(event: &ChainEvent) -> Result<Option<Self>, IndexerError> {
        if event.kind != EventKind::Transfer {
            return Ok(None);
        }

        let missing = |field: &str| IndexerError::MalformedPayload {
            kind: EventKind::Transfer.as_str(),
            block_number: event.block_number,
            reason: format!("transfer has no {}", field),
        };

        Ok(Some(Self {
            from: event.from.ok_or_else(|| missing("sender"))?,
            to: event.to.ok_or_else(|| missing("recipient"))?,
            amount: event.amount.clone().ok_or_else(|| missing("amount"))?,
            block_number: event.block_number,
            tx_hash: event.tx_hash,
            timestamp: event.block_timestamp,
        }))
    }
}

/// Working copy of the balances touched by one block range.
///
/// Loaded from the store, mutated in memory, then written back inside the same
/// transaction. Only touched addresses are written back.
#[derive(Debug, Default)]
pub struct BalanceSheet {
    entries: BTreeMap<Address, BalanceRecord>,
    dirty: BTreeSet<Address>,
}

impl BalanceSheet {
    pub fn new(rows: impl IntoIterator<Item = BalanceRecord>) -> Self {
        Self {
            entries: rows.into_iter().map(|r| (r.address, r)).collect(),
            dirty: BTreeSet::new(),
        }
    }

    /// Current raw balance, zero if the address was never seen.
    pub fn raw(&self, address: &Address) -> BigDecimal {
        self.entries
            .get(address)
            .map(|r| r.raw_balance.clone())
            .unwrap_or_else(BigDecimal::zero)
    }

    /// Apply a transfer. A zero sender is a mint and debits nobody.
    pub fn apply_transfer(&mut self, t: &TransferEffect) -> Result<(), IndexerError> {
        if t.to == Address::ZERO {
            return Err(IndexerError::TransferToZeroAddress {
                tx_hash: format!("{:#x}", t.tx_hash),
                block_number: t.block_number,
            });
        }

        if t.from != Address::ZERO {
            self.debit(t.from, &t.amount, t.block_number, t.timestamp)?;
        }
        self.credit(t.to, &t.amount, t.block_number, t.timestamp);
        Ok(())
    }

    /// Undo a previously applied transfer (reorg rollback).
    ///
    /// `as_of_block` becomes the last-updating block of every touched row.
    pub fn revert_transfer(
        &mut self,
        t: &TransferEffect,
        as_of_block: u64,
        now: DateTime<Utc>,
    ) -> Result<(), IndexerError> {
        self.debit(t.to, &t.amount, as_of_block, now)?;
        if t.from != Address::ZERO {
            self.credit(t.from, &t.amount, as_of_block, now);
        }
        Ok(())
    }

    fn debit(
        &mut self,
        address: Address,
        amount: &BigDecimal,
        block_number: u64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), IndexerError> {
        let current = self.raw(&address);
        if &current < amount {
            return Err(IndexerError::BalanceUnderflow {
                address: format!("{:#x}", address),
                block_number,
                balance: current,
                amount: amount.clone(),
            });
        }
        self.set(address, current - amount, block_number, timestamp);
        Ok(())
    }

    fn credit(
        &mut self,
        address: Address,
        amount: &BigDecimal,
        block_number: u64,
        timestamp: DateTime<Utc>,
    ) {
        let current = self.raw(&address);
        self.set(address, current + amount, block_number, timestamp);
    }

    fn set(
        &mut self,
        address: Address,
        raw_balance: BigDecimal,
        block_number: u64,
        timestamp: DateTime<Utc>,
    ) {
        self.entries.insert(
            address,
            BalanceRecord {
                address,
                raw_balance: raw_balance.with_scale(0),
                last_block: block_number,
                last_updated_at: timestamp,
            },
        );
        self.dirty.insert(address);
    }

    /// Rows changed since the sheet was loaded, in address order.
    pub fn into_dirty(self) -> Vec<BalanceRecord> {
        let Self { mut entries, dirty } = self;
        dirty
            .into_iter()
            .filter_map(|address| entries.remove(&address))
            .collect()
    }
}

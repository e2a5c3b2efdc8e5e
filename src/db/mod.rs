//! Durable ledger storage: event store, balance ledger, corporate actions,
//! block hashes and the watermark.

#[cfg(test)]
pub mod memory;
pub mod repository;

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use bigdecimal::BigDecimal;

use crate::error::IndexerError;
use crate::indexer::types::{ChainEvent, EventKind, StoredEvent};
use crate::ledger::balances::{BalanceRecord, TransferEffect};
use crate::ledger::corporate::CorporateActionRecord;

/// Everything one block range contributes, committed as a single unit.
#[derive(Debug, Clone, Default)]
pub struct RangeBatch {
    pub from: u64,
    pub to: u64,
    /// Classified events in replay order.
    pub events: Vec<ChainEvent>,
    /// Canonical hashes observed for blocks in the range, for reorg detection.
    pub block_hashes: Vec<(u64, B256)>,
    /// Stored hashes below this block are no longer needed.
    pub prune_hashes_below: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    pub inserted: u64,
    pub duplicates: u64,
    pub transfers_applied: u64,
    pub corporate_actions: u64,
    pub watermark: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub events_deleted: u64,
    pub transfers_reverted: u64,
    pub corporate_actions_deleted: u64,
}

/// Consistent view of the ledger used by the cap table.
#[derive(Debug, Clone, Default)]
pub struct CapTableSnapshot {
    pub watermark: Option<u64>,
    /// Holders with a strictly positive raw balance.
    pub balances: Vec<BalanceRecord>,
    /// Split ratios in block order.
    pub split_ratios: Vec<BigDecimal>,
}

/// Consistent view of one address plus the cap table it sits in.
#[derive(Debug, Clone, Default)]
pub struct HolderSnapshot {
    pub cap_table: CapTableSnapshot,
    pub balance: Option<BalanceRecord>,
    pub approved: bool,
    /// Transfers touching the address, oldest first.
    pub transfers: Vec<StoredEvent>,
    /// Whether any stored event of any kind names the address.
    pub has_events: bool,
}

/// Storage behind the ledger.
///
/// Mutations (`commit_range`, `rollback_from`) are all-or-nothing. Reads that
/// return snapshots must not observe a partially committed range.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Highest block fully ingested, if any.
    async fn watermark(&self) -> Result<Option<u64>, IndexerError>;

    /// Stored canonical hash for a block.
    async fn block_hash(&self, block_number: u64) -> Result<Option<B256>, IndexerError>;

    /// Stored hashes in `[lowest, highest]`, newest first.
    async fn block_hashes_between(
        &self,
        lowest: u64,
        highest: u64,
    ) -> Result<Vec<(u64, B256)>, IndexerError>;

    /// Record a block range: events, balance effects, corporate actions, hashes and
    /// the watermark. Effects apply only for events not already stored.
    async fn commit_range(&self, batch: &RangeBatch) -> Result<CommitOutcome, IndexerError>;

    /// Remove everything at or above `fork_block` and undo its balance effects.
    async fn rollback_from(&self, fork_block: u64) -> Result<RollbackOutcome, IndexerError>;

    async fn events_by_kind(
        &self,
        kind: EventKind,
        limit: u32,
    ) -> Result<Vec<StoredEvent>, IndexerError>;

    async fn events_by_address(
        &self,
        address: Address,
        limit: u32,
    ) -> Result<Vec<StoredEvent>, IndexerError>;

    /// Events in `[from, to]` in replay order.
    async fn events_by_block_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<StoredEvent>, IndexerError>;

    /// Raw balance, zero if the address was never seen.
    async fn balance(&self, address: Address) -> Result<BigDecimal, IndexerError>;

    /// Balances strictly above `threshold`, largest first.
    async fn balances_above(
        &self,
        threshold: &BigDecimal,
        limit: u32,
    ) -> Result<Vec<BalanceRecord>, IndexerError>;

    /// Corporate actions in block order.
    async fn corporate_actions(&self) -> Result<Vec<CorporateActionRecord>, IndexerError>;

    async fn cap_table_snapshot(&self) -> Result<CapTableSnapshot, IndexerError>;

    async fn holder_snapshot(&self, address: Address) -> Result<HolderSnapshot, IndexerError>;
}

/// Ledger effects carried by one newly inserted event.
pub(crate) fn ledger_effects(
    event: &ChainEvent,
) -> Result<(Option<TransferEffect>, Option<CorporateActionRecord>), IndexerError> {
    Ok((
        TransferEffect::from_event(event)?,
        CorporateActionRecord::from_event(event)?,
    ))
}

/// Latest approval state from WalletApproved / WalletRevoked events, newest first.
pub(crate) fn approval_from_latest<'a, I>(events: I) -> bool
where
    I: IntoIterator<Item = &'a EventKind>,
{
    events
        .into_iter()
        .find(|k| matches!(k, EventKind::WalletApproved | EventKind::WalletRevoked))
        .map(|k| *k == EventKind::WalletApproved)
        .unwrap_or(false)
}

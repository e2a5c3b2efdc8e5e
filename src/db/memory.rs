//! In-memory [`LedgerStore`] for tests. Commits work on a copy of the state and
//! swap it in only on success, mirroring a database transaction.

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use bigdecimal::{BigDecimal, Zero};
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{
    approval_from_latest, ledger_effects, CapTableSnapshot, CommitOutcome, HolderSnapshot,
    LedgerStore, RangeBatch, RollbackOutcome,
};
use crate::error::IndexerError;
use crate::indexer::types::{EventKind, StoredEvent};
use crate::ledger::balances::{BalanceRecord, BalanceSheet, TransferEffect};
use crate::ledger::corporate::{CorporateActionKind, CorporateActionRecord};

#[derive(Debug, Clone, Default)]
struct LedgerState {
    events: Vec<StoredEvent>,
    keys: HashSet<String>,
    next_id: i64,
    balances: BTreeMap<Address, BalanceRecord>,
    corporate_actions: Vec<(i64, CorporateActionRecord)>,
    block_hashes: BTreeMap<u64, B256>,
    watermark: Option<u64>,
}

impl LedgerState {
    fn sheet_for(&self, effects: &[TransferEffect]) -> BalanceSheet {
        let touched: HashSet<Address> = effects.iter().flat_map(|t| [t.from, t.to]).collect();
        BalanceSheet::new(
            touched
                .into_iter()
                .filter_map(|a| self.balances.get(&a).cloned()),
        )
    }

    fn replay_sorted(&self, mut events: Vec<StoredEvent>) -> Vec<StoredEvent> {
        events.sort_by_key(|e| (e.event.replay_order(), e.id));
        events
    }

    fn newest_first(&self, mut events: Vec<StoredEvent>, limit: u32) -> Vec<StoredEvent> {
        events.sort_by_key(|e| std::cmp::Reverse((e.event.block_number, e.id)));
        events.truncate(limit as usize);
        events
    }

    fn cap_table(&self) -> Result<CapTableSnapshot, IndexerError> {
        let mut balances: Vec<BalanceRecord> = self
            .balances
            .values()
            .filter(|b| b.raw_balance > BigDecimal::zero())
            .cloned()
            .collect();
        balances.sort_by(|a, b| {
            b.raw_balance
                .cmp(&a.raw_balance)
                .then_with(|| a.address.cmp(&b.address))
        });

        let mut splits: Vec<&(i64, CorporateActionRecord)> = self
            .corporate_actions
            .iter()
            .filter(|(_, a)| a.kind == CorporateActionKind::StockSplit)
            .collect();
        splits.sort_by_key(|(id, a)| (a.block_number, a.log_index.unwrap_or(u64::MAX), *id));

        Ok(CapTableSnapshot {
            watermark: self.watermark,
            balances,
            split_ratios: splits
                .into_iter()
                .map(|(_, a)| a.split_ratio())
                .collect::<Result<_, _>>()?,
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    state: Mutex<LedgerState>,
    fail_next_commits: AtomicUsize,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a transient database error.
    pub fn fail_next_commits(&self, n: usize) {
        self.fail_next_commits.store(n, Ordering::SeqCst);
    }

    pub fn event_count(&self) -> usize {
        self.state.lock().unwrap().events.len()
    }

    pub fn all_balances(&self) -> BTreeMap<Address, BigDecimal> {
        self.state
            .lock()
            .unwrap()
            .balances
            .iter()
            .map(|(a, b)| (*a, b.raw_balance.clone()))
            .collect()
    }

    fn read(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn watermark(&self) -> Result<Option<u64>, IndexerError> {
        Ok(self.read().watermark)
    }

    async fn block_hash(&self, block_number: u64) -> Result<Option<B256>, IndexerError> {
        Ok(self.read().block_hashes.get(&block_number).copied())
    }

    async fn block_hashes_between(
        &self,
        lowest: u64,
        highest: u64,
    ) -> Result<Vec<(u64, B256)>, IndexerError> {
        if lowest > highest {
            return Ok(Vec::new());
        }
        Ok(self
            .read()
            .block_hashes
            .range(lowest..=highest)
            .rev()
            .map(|(n, h)| (*n, *h))
            .collect())
    }

    async fn commit_range(&self, batch: &RangeBatch) -> Result<CommitOutcome, IndexerError> {
        if self
            .fail_next_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(IndexerError::Database(sqlx::Error::PoolTimedOut));
        }

        let mut guard = self.state.lock().unwrap();
        let mut state = guard.clone();
        let mut outcome = CommitOutcome::default();
        let mut transfers = Vec::new();

        for event in &batch.events {
            if !state.keys.insert(event.dedupe_key()) {
                outcome.duplicates += 1;
                continue;
            }
            state.next_id += 1;
            let id = state.next_id;
            state.events.push(StoredEvent {
                id,
                event: event.clone(),
                ingested_at: Utc::now(),
            });
            outcome.inserted += 1;

            let (transfer, action) = ledger_effects(event)?;
            if let Some(t) = transfer {
                transfers.push(t);
            }
            if let Some(action) = action {
                state.corporate_actions.push((id, action));
                outcome.corporate_actions += 1;
            }
        }

        let mut sheet = state.sheet_for(&transfers);
        for t in &transfers {
            sheet.apply_transfer(t)?;
        }
        for row in sheet.into_dirty() {
            state.balances.insert(row.address, row);
        }
        outcome.transfers_applied = transfers.len() as u64;

        state.block_hashes.extend(batch.block_hashes.iter().copied());
        if let Some(below) = batch.prune_hashes_below {
            state.block_hashes = state.block_hashes.split_off(&below);
        }

        let watermark = state.watermark.map_or(batch.to, |w| w.max(batch.to));
        state.watermark = Some(watermark);
        outcome.watermark = watermark;

        *guard = state;
        Ok(outcome)
    }

    async fn rollback_from(&self, fork_block: u64) -> Result<RollbackOutcome, IndexerError> {
        let mut guard = self.state.lock().unwrap();
        let mut state = guard.clone();
        let mut outcome = RollbackOutcome::default();

        let (kept, removed): (Vec<_>, Vec<_>) = std::mem::take(&mut state.events)
            .into_iter()
            .partition(|e| e.event.block_number < fork_block);
        state.events = kept;

        let mut effects = Vec::new();
        for stored in state.replay_sorted(removed.clone()).iter().rev() {
            if let Some(effect) = TransferEffect::from_event(&stored.event)? {
                effects.push(effect);
            }
        }

        let mut sheet = state.sheet_for(&effects);
        let now = Utc::now();
        for t in &effects {
            sheet.revert_transfer(t, fork_block.saturating_sub(1), now)?;
        }
        for row in sheet.into_dirty() {
            state.balances.insert(row.address, row);
        }
        outcome.transfers_reverted = effects.len() as u64;

        for stored in &removed {
            state.keys.remove(&stored.event.dedupe_key());
        }
        outcome.events_deleted = removed.len() as u64;

        let before = state.corporate_actions.len();
        state
            .corporate_actions
            .retain(|(_, a)| a.block_number < fork_block);
        outcome.corporate_actions_deleted = (before - state.corporate_actions.len()) as u64;

        state.block_hashes.retain(|n, _| *n < fork_block);
        state.watermark = match (fork_block, state.watermark) {
            (0, _) => None,
            (_, Some(w)) => Some(w.min(fork_block - 1)),
            (_, None) => None,
        };

        *guard = state;
        Ok(outcome)
    }

    async fn events_by_kind(
        &self,
        kind: EventKind,
        limit: u32,
    ) -> Result<Vec<StoredEvent>, IndexerError> {
        let state = self.read();
        let matching = state
            .events
            .iter()
            .filter(|e| e.event.kind == kind)
            .cloned()
            .collect();
        Ok(state.newest_first(matching, limit))
    }

    async fn events_by_address(
        &self,
        address: Address,
        limit: u32,
    ) -> Result<Vec<StoredEvent>, IndexerError> {
        let state = self.read();
        let matching = state
            .events
            .iter()
            .filter(|e| e.event.from == Some(address) || e.event.to == Some(address))
            .cloned()
            .collect();
        Ok(state.newest_first(matching, limit))
    }

    async fn events_by_block_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<StoredEvent>, IndexerError> {
        let state = self.read();
        let matching = state
            .events
            .iter()
            .filter(|e| (from..=to).contains(&e.event.block_number))
            .cloned()
            .collect();
        Ok(state.replay_sorted(matching))
    }

    async fn balance(&self, address: Address) -> Result<BigDecimal, IndexerError> {
        Ok(self
            .read()
            .balances
            .get(&address)
            .map(|b| b.raw_balance.clone())
            .unwrap_or_else(BigDecimal::zero))
    }

    async fn balances_above(
        &self,
        threshold: &BigDecimal,
        limit: u32,
    ) -> Result<Vec<BalanceRecord>, IndexerError> {
        let mut rows: Vec<BalanceRecord> = self
            .read()
            .balances
            .values()
            .filter(|b| &b.raw_balance > threshold)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.raw_balance
                .cmp(&a.raw_balance)
                .then_with(|| a.address.cmp(&b.address))
        });
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn corporate_actions(&self) -> Result<Vec<CorporateActionRecord>, IndexerError> {
        let state = self.read();
        let mut actions = state.corporate_actions.clone();
        actions.sort_by_key(|(id, a)| (a.block_number, a.log_index.unwrap_or(u64::MAX), *id));
        Ok(actions.into_iter().map(|(_, a)| a).collect())
    }

    async fn cap_table_snapshot(&self) -> Result<CapTableSnapshot, IndexerError> {
        self.read().cap_table()
    }

    async fn holder_snapshot(&self, address: Address) -> Result<HolderSnapshot, IndexerError> {
        let state = self.read();

        let mut approvals: Vec<&StoredEvent> = state
            .events
            .iter()
            .filter(|e| e.event.to == Some(address))
            .collect();
        approvals.sort_by_key(|e| std::cmp::Reverse((e.event.replay_order(), e.id)));

        let transfers = state
            .events
            .iter()
            .filter(|e| e.event.kind == EventKind::Transfer)
            .filter(|e| e.event.from == Some(address) || e.event.to == Some(address))
            .cloned()
            .collect();

        Ok(HolderSnapshot {
            cap_table: state.cap_table()?,
            balance: state.balances.get(&address).cloned(),
            approved: approval_from_latest(approvals.iter().map(|e| &e.event.kind)),
            transfers: state.replay_sorted(transfers),
            has_events: state
                .events
                .iter()
                .any(|e| e.event.from == Some(address) || e.event.to == Some(address)),
        })
    }
}

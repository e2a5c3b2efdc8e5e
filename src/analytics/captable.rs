use alloy::primitives::{Address, B256};
use bigdecimal::{BigDecimal, RoundingMode, ToPrimitive, Zero};
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::db::{CapTableSnapshot, HolderSnapshot, LedgerStore};
use crate::error::QueryError;
use crate::indexer::types::StoredEvent;
use crate::ledger::multiplier::SplitMultiplier;

/// Decimal places kept for the average holding.
const AVERAGE_SCALE: i64 = 6;

/// How many of the largest holders the concentration ratio covers.
const CONCENTRATION_TOP: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct HolderEntry {
    pub address: Address,
    pub raw_balance: BigDecimal,
    pub display_balance: BigDecimal,
    pub ownership_percentage: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapTableSummary {
    pub holder_count: u64,
    pub total_supply: BigDecimal,
    pub median_holding: BigDecimal,
    pub average_holding: BigDecimal,
    pub top10_concentration: f64,
    pub hhi_index: f64,
    /// Cumulative split multiplier in basis points.
    pub split_multiplier: BigDecimal,
    pub watermark: Option<u64>,
}

/// One transfer as seen from a single holder.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceChange {
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: Option<u64>,
    pub counterparty: Option<Address>,
    /// Signed raw delta; zero for a self-transfer.
    pub delta: BigDecimal,
    /// Raw balance after this transfer.
    pub raw_balance: BigDecimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HolderDetail {
    pub address: Address,
    pub balance: BigDecimal,
    pub raw_balance: BigDecimal,
    pub ownership_percentage: f64,
    pub is_approved: bool,
    pub balance_history: Vec<BalanceChange>,
}

/// Holders ranked by display balance (desc, then address), plus total display supply.
pub fn rank_holders(snapshot: &CapTableSnapshot) -> (Vec<HolderEntry>, BigDecimal) {
    let multiplier = SplitMultiplier::from_splits(&snapshot.split_ratios);

    let mut holders: Vec<(Address, BigDecimal, BigDecimal)> = snapshot
        .balances
        .iter()
        .filter(|b| b.raw_balance > BigDecimal::zero())
        .map(|b| {
            (
                b.address,
                b.raw_balance.clone(),
                multiplier.to_display(&b.raw_balance),
            )
        })
        .collect();
    holders.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(&b.0)));

    let total: BigDecimal = holders.iter().map(|(_, _, display)| display).sum();

    let entries = holders
        .into_iter()
        .map(|(address, raw_balance, display_balance)| HolderEntry {
            ownership_percentage: ownership_percentage(&display_balance, &total),
            address,
            raw_balance,
            display_balance,
        })
        .collect();

    (entries, total)
}

/// `part / total * 100`. Exact integers up to here; f64 only for the ratio.
pub fn ownership_percentage(part: &BigDecimal, total: &BigDecimal) -> f64 {
    if total.is_zero() {
        return 0.0;
    }
    match (part.to_f64(), total.to_f64()) {
        (Some(p), Some(t)) if t > 0.0 => p / t * 100.0,
        _ => 0.0,
    }
}

pub fn summarize(snapshot: &CapTableSnapshot) -> CapTableSummary {
    let (holders, total) = rank_holders(snapshot);
    let multiplier = SplitMultiplier::from_splits(&snapshot.split_ratios);
    let count = holders.len();

    let mut ascending: Vec<&BigDecimal> = holders.iter().map(|h| &h.display_balance).collect();
    ascending.sort();

    let median = match count {
        0 => BigDecimal::zero(),
        n if n % 2 == 1 => ascending[n / 2].clone(),
        n => (ascending[n / 2 - 1] + ascending[n / 2]) / BigDecimal::from(2),
    };

    let average = if count == 0 {
        BigDecimal::zero()
    } else {
        (&total / BigDecimal::from(count as u64))
            .with_scale_round(AVERAGE_SCALE, RoundingMode::HalfEven)
    };

    let top10_concentration = holders
        .iter()
        .take(CONCENTRATION_TOP)
        .map(|h| h.ownership_percentage)
        .sum();

    let hhi_index = holders
        .iter()
        .map(|h| h.ownership_percentage * h.ownership_percentage)
        .sum();

    CapTableSummary {
        holder_count: count as u64,
        total_supply: total,
        median_holding: median,
        average_holding: average,
        top10_concentration,
        hhi_index,
        split_multiplier: multiplier.basis_points().clone(),
        watermark: snapshot.watermark,
    }
}

/// Replay an address's transfers (oldest first) into signed deltas and running balances.
pub fn balance_history(address: Address, transfers: &[StoredEvent]) -> Vec<BalanceChange> {
    let mut running = BigDecimal::zero();
    let mut history = Vec::with_capacity(transfers.len());

    for stored in transfers {
        let event = &stored.event;
        let Some(amount) = event.amount.as_ref() else {
            continue;
        };
        let incoming = event.to == Some(address);
        let outgoing = event.from == Some(address);

        let (delta, counterparty) = match (incoming, outgoing) {
            (true, true) => (BigDecimal::zero(), Some(address)),
            (true, false) => (amount.clone(), event.from),
            (false, true) => (-amount.clone(), event.to),
            (false, false) => continue,
        };

        running += &delta;
        history.push(BalanceChange {
            block_number: event.block_number,
            tx_hash: event.tx_hash,
            log_index: event.log_index,
            counterparty,
            delta,
            raw_balance: running.clone(),
            timestamp: event.block_timestamp,
        });
    }

    history
}

fn holder_detail(address: Address, snapshot: &HolderSnapshot) -> HolderDetail {
    let multiplier = SplitMultiplier::from_splits(&snapshot.cap_table.split_ratios);
    let (_, total) = rank_holders(&snapshot.cap_table);

    let raw_balance = snapshot
        .balance
        .as_ref()
        .map(|b| b.raw_balance.clone())
        .unwrap_or_else(BigDecimal::zero);
    let balance = multiplier.to_display(&raw_balance);

    HolderDetail {
        address,
        ownership_percentage: ownership_percentage(&balance, &total),
        balance,
        raw_balance,
        is_approved: snapshot.approved,
        balance_history: balance_history(address, &snapshot.transfers),
    }
}

/// Read-side cap table queries. Every call works off one consistent snapshot.
#[derive(Clone)]
pub struct CapTable {
    store: Arc<dyn LedgerStore>,
}

impl CapTable {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Holders by display balance, largest first. `None` returns everyone.
    pub async fn holders(&self, limit: Option<usize>) -> Result<Vec<HolderEntry>, QueryError> {
        let snapshot = self.store.cap_table_snapshot().await?;
        let (mut holders, _) = rank_holders(&snapshot);
        if let Some(limit) = limit {
            holders.truncate(limit);
        }
        Ok(holders)
    }

    pub async fn top_n(&self, n: i64) -> Result<Vec<HolderEntry>, QueryError> {
        if n <= 0 {
            return Err(QueryError::InvalidArgument(format!(
                "n must be positive, got {}",
                n
            )));
        }
        self.holders(Some(usize::try_from(n).unwrap_or(usize::MAX)))
            .await
    }

    pub async fn summary(&self) -> Result<CapTableSummary, QueryError> {
        let snapshot = self.store.cap_table_snapshot().await?;
        Ok(summarize(&snapshot))
    }

    pub async fn holder_detail(&self, address: Address) -> Result<HolderDetail, QueryError> {
        let snapshot = self.store.holder_snapshot(address).await?;

        if snapshot.balance.is_none() && !snapshot.has_events {
            return Err(QueryError::NotFound(format!("holder {:#x}", address)));
        }

        Ok(holder_detail(address, &snapshot))
    }

    /// Cumulative split multiplier in basis points.
    pub async fn split_multiplier(&self) -> Result<BigDecimal, QueryError> {
        let snapshot = self.store.cap_table_snapshot().await?;
        Ok(SplitMultiplier::from_splits(&snapshot.split_ratios)
            .basis_points()
            .clone())
    }
}

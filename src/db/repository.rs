use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, Transaction};

use super::{
    approval_from_latest, ledger_effects, CapTableSnapshot, CommitOutcome, HolderSnapshot,
    LedgerStore, RangeBatch, RollbackOutcome,
};
use crate::error::IndexerError;
use crate::indexer::types::{ChainEvent, EventKind, StoredEvent};
use crate::ledger::balances::{BalanceRecord, BalanceSheet, TransferEffect};
use crate::ledger::corporate::{CorporateActionKind, CorporateActionRecord};

const EVENT_COLUMNS: &str = "id, block_number, block_hash, tx_hash, log_index, event_kind, \
     from_address, to_address, amount, payload, block_timestamp, ingested_at";

const REPLAY_ORDER: &str = "ORDER BY block_number ASC, log_index ASC NULLS LAST, id ASC";

/// PostgreSQL-backed ledger. Owns the pool handed to it by the composition root.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close the pool at shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Begin a read-only snapshot transaction.
    async fn snapshot_tx(&self) -> Result<Transaction<'_, Postgres>, IndexerError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }
}

// ============================================================
// Row mapping
// ============================================================

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    block_number: i64,
    block_hash: Option<Vec<u8>>,
    tx_hash: Vec<u8>,
    log_index: Option<i32>,
    event_kind: String,
    from_address: Option<Vec<u8>>,
    to_address: Option<Vec<u8>>,
    amount: Option<BigDecimal>,
    payload: Option<JsonValue>,
    block_timestamp: DateTime<Utc>,
    ingested_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for StoredEvent {
    type Error = IndexerError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let kind: EventKind = row.event_kind.parse().map_err(corrupt)?;
        Ok(StoredEvent {
            id: row.id,
            event: ChainEvent {
                block_number: row.block_number as u64,
                block_hash: row.block_hash.as_deref().map(to_hash).transpose()?,
                tx_hash: to_hash(&row.tx_hash)?,
                log_index: row.log_index.map(|i| i as u64),
                kind,
                from: row.from_address.as_deref().map(to_address).transpose()?,
                to: row.to_address.as_deref().map(to_address).transpose()?,
                amount: row.amount,
                payload: row.payload,
                block_timestamp: row.block_timestamp,
            },
            ingested_at: row.ingested_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BalanceRow {
    address: Vec<u8>,
    raw_balance: BigDecimal,
    last_block: i64,
    last_updated_at: DateTime<Utc>,
}

impl TryFrom<BalanceRow> for BalanceRecord {
    type Error = IndexerError;

    fn try_from(row: BalanceRow) -> Result<Self, Self::Error> {
        Ok(BalanceRecord {
            address: to_address(&row.address)?,
            raw_balance: row.raw_balance.with_scale(0),
            last_block: row.last_block as u64,
            last_updated_at: row.last_updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CorporateActionRow {
    action_kind: String,
    block_number: i64,
    tx_hash: Vec<u8>,
    log_index: Option<i32>,
    old_value: String,
    new_value: String,
    block_timestamp: DateTime<Utc>,
}

impl TryFrom<CorporateActionRow> for CorporateActionRecord {
    type Error = IndexerError;

    fn try_from(row: CorporateActionRow) -> Result<Self, Self::Error> {
        let kind = CorporateActionKind::parse(&row.action_kind)
            .ok_or_else(|| corrupt(format!("unknown corporate action '{}'", row.action_kind)))?;
        Ok(CorporateActionRecord {
            kind,
            block_number: row.block_number as u64,
            tx_hash: to_hash(&row.tx_hash)?,
            log_index: row.log_index.map(|i| i as u64),
            old_value: row.old_value,
            new_value: row.new_value,
            block_timestamp: row.block_timestamp,
        })
    }
}

fn corrupt(msg: String) -> IndexerError {
    IndexerError::Database(sqlx::Error::Decode(msg.into()))
}

/// BIGINT bound for a block number; open-ended ranges saturate instead of wrapping.
fn block_param(block_number: u64) -> i64 {
    i64::try_from(block_number).unwrap_or(i64::MAX)
}

fn to_address(bytes: &[u8]) -> Result<Address, IndexerError> {
    Address::try_from(bytes).map_err(|_| corrupt(format!("bad address length {}", bytes.len())))
}

fn to_hash(bytes: &[u8]) -> Result<B256, IndexerError> {
    B256::try_from(bytes).map_err(|_| corrupt(format!("bad hash length {}", bytes.len())))
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, IndexerError>
where
    T: TryFrom<R, Error = IndexerError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// ============================================================
// Transaction-scoped helpers
// ============================================================

/// Insert one event. Returns the new row id, or `None` if the natural key already exists.
async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    event: &ChainEvent,
) -> Result<Option<i64>, IndexerError> {
    let row: Option<(i64,)> = sqlx::query_as(
        "INSERT INTO events (dedupe_key, block_number, block_hash, tx_hash, log_index, event_kind,
                             from_address, to_address, amount, payload, block_timestamp)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
         ON CONFLICT (dedupe_key) DO NOTHING
         RETURNING id",
    )
    .bind(event.dedupe_key())
    .bind(event.block_number as i64)
    .bind(event.block_hash.map(|h| h.as_slice().to_vec()))
    .bind(event.tx_hash.as_slice())
    .bind(event.log_index.map(|i| i as i32))
    .bind(event.kind.as_str())
    .bind(event.from.map(|a| a.as_slice().to_vec()))
    .bind(event.to.map(|a| a.as_slice().to_vec()))
    .bind(event.amount.as_ref())
    .bind(event.payload.as_ref())
    .bind(event.block_timestamp)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.map(|(id,)| id))
}

async fn insert_corporate_action(
    tx: &mut Transaction<'_, Postgres>,
    event_id: i64,
    action: &CorporateActionRecord,
) -> Result<(), IndexerError> {
    sqlx::query(
        "INSERT INTO corporate_actions (event_id, action_kind, block_number, tx_hash, log_index,
                                        old_value, new_value, block_timestamp)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         ON CONFLICT (event_id) DO NOTHING",
    )
    .bind(event_id)
    .bind(action.kind.as_str())
    .bind(action.block_number as i64)
    .bind(action.tx_hash.as_slice())
    .bind(action.log_index.map(|i| i as i32))
    .bind(&action.old_value)
    .bind(&action.new_value)
    .bind(action.block_timestamp)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Lock and load the balance rows for a set of addresses.
async fn load_balances_for_update(
    tx: &mut Transaction<'_, Postgres>,
    addresses: &[Address],
) -> Result<BalanceSheet, IndexerError> {
    if addresses.is_empty() {
        return Ok(BalanceSheet::default());
    }

    let keys: Vec<Vec<u8>> = addresses.iter().map(|a| a.as_slice().to_vec()).collect();
    let rows: Vec<BalanceRow> = sqlx::query_as(
        "SELECT address, raw_balance, last_block, last_updated_at
         FROM balances WHERE address = ANY($1)
         ORDER BY address
         FOR UPDATE",
    )
    .bind(&keys)
    .fetch_all(&mut **tx)
    .await?;

    Ok(BalanceSheet::new(convert_all::<_, BalanceRecord>(rows)?))
}

async fn write_balances(
    tx: &mut Transaction<'_, Postgres>,
    rows: &[BalanceRecord],
) -> Result<(), IndexerError> {
    for row in rows {
        sqlx::query(
            "INSERT INTO balances (address, raw_balance, last_block, last_updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (address) DO UPDATE
             SET raw_balance = EXCLUDED.raw_balance,
                 last_block = EXCLUDED.last_block,
                 last_updated_at = EXCLUDED.last_updated_at",
        )
        .bind(row.address.as_slice())
        .bind(&row.raw_balance)
        .bind(row.last_block as i64)
        .bind(row.last_updated_at)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

fn touched_addresses(effects: &[TransferEffect]) -> Vec<Address> {
    let mut addresses: Vec<Address> = effects
        .iter()
        .flat_map(|t| [t.from, t.to])
        .filter(|a| *a != Address::ZERO)
        .collect();
    addresses.sort();
    addresses.dedup();
    addresses
}

async fn read_watermark<'e, E>(executor: E) -> Result<Option<u64>, IndexerError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT last_indexed_block FROM indexer_state WHERE id = 1")
            .fetch_optional(executor)
            .await?;
    Ok(row.map(|(b,)| b as u64))
}

async fn read_cap_table(
    tx: &mut Transaction<'_, Postgres>,
) -> Result<CapTableSnapshot, IndexerError> {
    let watermark = read_watermark(&mut **tx).await?;

    let rows: Vec<BalanceRow> = sqlx::query_as(
        "SELECT address, raw_balance, last_block, last_updated_at
         FROM balances WHERE raw_balance > 0
         ORDER BY raw_balance DESC, address ASC",
    )
    .fetch_all(&mut **tx)
    .await?;

    let splits: Vec<CorporateActionRow> = sqlx::query_as(&format!(
        "SELECT action_kind, block_number, tx_hash, log_index, old_value, new_value, block_timestamp
         FROM corporate_actions WHERE action_kind = 'stock_split' {}",
        REPLAY_ORDER
    ))
    .fetch_all(&mut **tx)
    .await?;

    let split_ratios = convert_all::<_, CorporateActionRecord>(splits)?
        .iter()
        .map(CorporateActionRecord::split_ratio)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CapTableSnapshot {
        watermark,
        balances: convert_all(rows)?,
        split_ratios,
    })
}

// ============================================================
// LedgerStore
// ============================================================

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn watermark(&self) -> Result<Option<u64>, IndexerError> {
        read_watermark(&self.pool).await
    }

    async fn block_hash(&self, block_number: u64) -> Result<Option<B256>, IndexerError> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT block_hash FROM block_hashes WHERE block_number = $1")
                .bind(block_number as i64)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(h,)| to_hash(&h)).transpose()
    }

    async fn block_hashes_between(
        &self,
        lowest: u64,
        highest: u64,
    ) -> Result<Vec<(u64, B256)>, IndexerError> {
        let rows: Vec<(i64, Vec<u8>)> = sqlx::query_as(
            "SELECT block_number, block_hash FROM block_hashes
             WHERE block_number >= $1 AND block_number <= $2
             ORDER BY block_number DESC",
        )
        .bind(lowest as i64)
        .bind(highest as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(n, h)| Ok((n as u64, to_hash(&h)?)))
            .collect()
    }

    async fn commit_range(&self, batch: &RangeBatch) -> Result<CommitOutcome, IndexerError> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = CommitOutcome::default();
        let mut transfers = Vec::new();

        for event in &batch.events {
            let Some(event_id) = insert_event(&mut tx, event).await? else {
                outcome.duplicates += 1;
                continue;
            };
            outcome.inserted += 1;

            let (transfer, action) = ledger_effects(event)?;
            if let Some(t) = transfer {
                transfers.push(t);
            }
            if let Some(action) = action {
                insert_corporate_action(&mut tx, event_id, &action).await?;
                outcome.corporate_actions += 1;
            }
        }

        if !transfers.is_empty() {
            let mut sheet = load_balances_for_update(&mut tx, &touched_addresses(&transfers)).await?;
            for t in &transfers {
                sheet.apply_transfer(t)?;
            }
            write_balances(&mut tx, &sheet.into_dirty()).await?;
            outcome.transfers_applied = transfers.len() as u64;
        }

        for (block_number, hash) in &batch.block_hashes {
            sqlx::query(
                "INSERT INTO block_hashes (block_number, block_hash)
                 VALUES ($1, $2)
                 ON CONFLICT (block_number) DO UPDATE SET block_hash = EXCLUDED.block_hash",
            )
            .bind(*block_number as i64)
            .bind(hash.as_slice())
            .execute(&mut *tx)
            .await?;
        }

        if let Some(below) = batch.prune_hashes_below {
            sqlx::query("DELETE FROM block_hashes WHERE block_number < $1")
                .bind(below as i64)
                .execute(&mut *tx)
                .await?;
        }

        // A replay of an older range never lowers the watermark
        let (watermark,): (i64,) = sqlx::query_as(
            "INSERT INTO indexer_state (id, last_indexed_block, updated_at)
             VALUES (1, $1, NOW())
             ON CONFLICT (id) DO UPDATE
             SET last_indexed_block = GREATEST(indexer_state.last_indexed_block, EXCLUDED.last_indexed_block),
                 updated_at = NOW()
             RETURNING last_indexed_block",
        )
        .bind(batch.to as i64)
        .fetch_one(&mut *tx)
        .await?;
        outcome.watermark = watermark as u64;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn rollback_from(&self, fork_block: u64) -> Result<RollbackOutcome, IndexerError> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = RollbackOutcome::default();

        // Newest first so every intermediate balance is one the ledger actually held
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {} FROM events
             WHERE block_number >= $1 AND event_kind = 'Transfer'
             ORDER BY block_number DESC, log_index DESC NULLS FIRST, id DESC",
            EVENT_COLUMNS
        ))
        .bind(fork_block as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut effects = Vec::with_capacity(rows.len());
        for row in rows {
            let stored = StoredEvent::try_from(row)?;
            if let Some(effect) = TransferEffect::from_event(&stored.event)? {
                effects.push(effect);
            }
        }

        if !effects.is_empty() {
            let as_of = fork_block.saturating_sub(1);
            let now = Utc::now();
            let mut sheet = load_balances_for_update(&mut tx, &touched_addresses(&effects)).await?;
            for t in &effects {
                sheet.revert_transfer(t, as_of, now)?;
            }
            write_balances(&mut tx, &sheet.into_dirty()).await?;
            outcome.transfers_reverted = effects.len() as u64;
        }

        outcome.corporate_actions_deleted =
            sqlx::query("DELETE FROM corporate_actions WHERE block_number >= $1")
                .bind(fork_block as i64)
                .execute(&mut *tx)
                .await?
                .rows_affected();

        outcome.events_deleted = sqlx::query("DELETE FROM events WHERE block_number >= $1")
            .bind(fork_block as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query("DELETE FROM block_hashes WHERE block_number >= $1")
            .bind(fork_block as i64)
            .execute(&mut *tx)
            .await?;

        if fork_block == 0 {
            sqlx::query("DELETE FROM indexer_state WHERE id = 1")
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query(
                "UPDATE indexer_state
                 SET last_indexed_block = LEAST(last_indexed_block, $1), updated_at = NOW()
                 WHERE id = 1",
            )
            .bind(fork_block as i64 - 1)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn events_by_kind(
        &self,
        kind: EventKind,
        limit: u32,
    ) -> Result<Vec<StoredEvent>, IndexerError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {} FROM events WHERE event_kind = $1
             ORDER BY block_number DESC, id DESC LIMIT $2",
            EVENT_COLUMNS
        ))
        .bind(kind.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn events_by_address(
        &self,
        address: Address,
        limit: u32,
    ) -> Result<Vec<StoredEvent>, IndexerError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {} FROM events WHERE from_address = $1 OR to_address = $1
             ORDER BY block_number DESC, id DESC LIMIT $2",
            EVENT_COLUMNS
        ))
        .bind(address.as_slice())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn events_by_block_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<StoredEvent>, IndexerError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {} FROM events WHERE block_number >= $1 AND block_number <= $2 {}",
            EVENT_COLUMNS, REPLAY_ORDER
        ))
        .bind(block_param(from))
        .bind(block_param(to))
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn balance(&self, address: Address) -> Result<BigDecimal, IndexerError> {
        let row: Option<(BigDecimal,)> =
            sqlx::query_as("SELECT raw_balance FROM balances WHERE address = $1")
                .bind(address.as_slice())
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(b,)| b.with_scale(0)).unwrap_or_else(BigDecimal::zero))
    }

    async fn balances_above(
        &self,
        threshold: &BigDecimal,
        limit: u32,
    ) -> Result<Vec<BalanceRecord>, IndexerError> {
        let rows: Vec<BalanceRow> = sqlx::query_as(
            "SELECT address, raw_balance, last_block, last_updated_at
             FROM balances WHERE raw_balance > $1
             ORDER BY raw_balance DESC, address ASC LIMIT $2",
        )
        .bind(threshold)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn corporate_actions(&self) -> Result<Vec<CorporateActionRecord>, IndexerError> {
        let rows: Vec<CorporateActionRow> = sqlx::query_as(&format!(
            "SELECT action_kind, block_number, tx_hash, log_index, old_value, new_value, block_timestamp
             FROM corporate_actions {}",
            REPLAY_ORDER
        ))
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn cap_table_snapshot(&self) -> Result<CapTableSnapshot, IndexerError> {
        let mut tx = self.snapshot_tx().await?;
        let snapshot = read_cap_table(&mut tx).await?;
        tx.commit().await?;
        Ok(snapshot)
    }

    async fn holder_snapshot(&self, address: Address) -> Result<HolderSnapshot, IndexerError> {
        let mut tx = self.snapshot_tx().await?;
        let cap_table = read_cap_table(&mut tx).await?;

        let balance: Option<BalanceRow> = sqlx::query_as(
            "SELECT address, raw_balance, last_block, last_updated_at
             FROM balances WHERE address = $1",
        )
        .bind(address.as_slice())
        .fetch_optional(&mut *tx)
        .await?;

        let approvals: Vec<(String,)> = sqlx::query_as(
            "SELECT event_kind FROM events
             WHERE to_address = $1 AND event_kind IN ('WalletApproved', 'WalletRevoked')
             ORDER BY block_number DESC, log_index DESC NULLS LAST, id DESC
             LIMIT 1",
        )
        .bind(address.as_slice())
        .fetch_all(&mut *tx)
        .await?;
        let approval_kinds = approvals
            .into_iter()
            .map(|(k,)| k.parse::<EventKind>().map_err(corrupt))
            .collect::<Result<Vec<_>, _>>()?;

        let transfers: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {} FROM events
             WHERE event_kind = 'Transfer' AND (from_address = $1 OR to_address = $1) {}",
            EVENT_COLUMNS, REPLAY_ORDER
        ))
        .bind(address.as_slice())
        .fetch_all(&mut *tx)
        .await?;

        let (has_events,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM events WHERE from_address = $1 OR to_address = $1)",
        )
        .bind(address.as_slice())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(HolderSnapshot {
            cap_table,
            balance: balance.map(BalanceRecord::try_from).transpose()?,
            approved: approval_from_latest(&approval_kinds),
            transfers: convert_all(transfers)?,
            has_events,
        })
    }
}

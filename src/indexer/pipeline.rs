use alloy::primitives::{Address, B256};
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::decoder;
use super::source::ChainSource;
use super::types::ChainEvent;
use crate::db::{CommitOutcome, LedgerStore, RangeBatch, RollbackOutcome};
use crate::error::IndexerError;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// The token contract whose logs are indexed.
    pub token: Address,
    /// How far back a reorg may reach before it is treated as fatal.
    pub max_reorg_depth: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgReport {
    pub fork_block: u64,
    pub rollback: RollbackOutcome,
}

/// Result of ingesting one block range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeReport {
    /// First block actually ingested; lower than requested after a reorg rollback.
    pub from: u64,
    pub to: u64,
    pub logs_fetched: u64,
    pub events_classified: u64,
    pub commit: CommitOutcome,
    pub reorg: Option<ReorgReport>,
}

/// Fetches, classifies and commits block ranges.
///
/// Every mutation goes through the writer lock, so the watcher and manual
/// backfills never interleave inside a range.
pub struct IngestionPipeline {
    store: Arc<dyn LedgerStore>,
    source: Arc<dyn ChainSource>,
    settings: PipelineSettings,
    writer: Mutex<()>,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        source: Arc<dyn ChainSource>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            source,
            settings,
            writer: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn source(&self) -> &Arc<dyn ChainSource> {
        &self.source
    }

    pub async fn current_watermark(&self) -> Result<Option<u64>, IndexerError> {
        self.store.watermark().await
    }

    /// Ingest `[from, to]` as one atomic unit.
    ///
    /// `from` may not skip past `watermark + 1`. Replaying an already ingested
    /// range is a no-op for the ledger.
    pub async fn ingest_range(&self, from: u64, to: u64) -> Result<RangeReport, IndexerError> {
        if from > to {
            return Err(IndexerError::InvalidRange {
                from,
                to,
                reason: "range is empty".into(),
            });
        }

        let _writer = self.writer.lock().await;

        if let Some(watermark) = self.store.watermark().await? {
            if from > watermark + 1 {
                return Err(IndexerError::InvalidRange {
                    from,
                    to,
                    reason: format!("gap after watermark {}", watermark),
                });
            }
        }

        let mut from = from;
        let mut reorg = None;
        if let Some(fork_block) = self.detect_reorg(from).await? {
            tracing::warn!(
                fork_block,
                requested_from = from,
                "Reorg detected! Parent hash mismatch. Rolling back..."
            );

            let rollback = self
                .store
                .rollback_from(fork_block)
                .await
                .map_err(|e| IndexerError::RollbackFailed {
                    fork_block,
                    source: Box::new(e),
                })?;

            tracing::info!(
                fork_block,
                deleted_events = rollback.events_deleted,
                reverted_transfers = rollback.transfers_reverted,
                deleted_corporate_actions = rollback.corporate_actions_deleted,
                "Reorg rollback complete"
            );

            from = fork_block.min(from);
            reorg = Some(ReorgReport {
                fork_block,
                rollback,
            });
        }

        let logs = self.source.logs(from, to).await?;

        let mut events = Vec::new();
        for log in &logs {
            if let Some(event) = decoder::classify_log(log, self.settings.token)? {
                if event.block_number < from || event.block_number > to {
                    tracing::warn!(
                        block = event.block_number,
                        from,
                        to,
                        "Source returned a log outside the requested range, skipping"
                    );
                    continue;
                }
                events.push(event);
            }
        }
        events.sort_by_key(ChainEvent::replay_order);

        let recent = self.recent_hashes(from, to).await?;
        let block_hashes = collect_block_hashes(&events, recent)?;

        let batch = RangeBatch {
            from,
            to,
            events,
            block_hashes,
            prune_hashes_below: to.checked_sub(self.settings.max_reorg_depth),
        };

        let commit = self.store.commit_range(&batch).await?;

        tracing::info!(
            from,
            to,
            logs = logs.len(),
            inserted = commit.inserted,
            duplicates = commit.duplicates,
            transfers = commit.transfers_applied,
            corporate_actions = commit.corporate_actions,
            watermark = commit.watermark,
            "Committed block range"
        );

        Ok(RangeReport {
            from,
            to,
            logs_fetched: logs.len() as u64,
            events_classified: batch.events.len() as u64,
            commit,
            reorg,
        })
    }

    /// Ingest a long range in `batch_size` chunks. Returns the last watermark.
    pub async fn backfill(
        &self,
        from: u64,
        to: u64,
        batch_size: u64,
    ) -> Result<Option<u64>, IndexerError> {
        let batch_size = batch_size.max(1);
        let mut current = from;

        while current <= to {
            let end = current.saturating_add(batch_size - 1).min(to);
            let report = self.ingest_range(current, end).await?;
            current = report.to + 1;
        }

        self.store.watermark().await
    }

    /// Compare the stored hash of `from - 1` with the chain's.
    /// Returns the divergence point if they differ.
    async fn detect_reorg(&self, from: u64) -> Result<Option<u64>, IndexerError> {
        let Some(parent) = from.checked_sub(1) else {
            return Ok(None);
        };
        let Some(stored) = self.store.block_hash(parent).await? else {
            return Ok(None);
        };

        let (_, canonical) = self.canonical_hash(parent).await?;
        if canonical == stored {
            return Ok(None);
        }

        self.find_fork_point(parent).await.map(Some)
    }

    /// Walk stored hashes backwards from `parent`; the block after the newest one
    /// that is still canonical is the fork point.
    async fn find_fork_point(&self, parent: u64) -> Result<u64, IndexerError> {
        let lowest = parent.saturating_sub(self.settings.max_reorg_depth);
        let stored = self.store.block_hashes_between(lowest, parent).await?;

        for (block_number, hash) in stored {
            let (_, canonical) = self.canonical_hash(block_number).await?;
            if canonical == hash {
                return Ok(block_number + 1);
            }
        }

        // The window reaches genesis: roll back everything
        if lowest == 0 {
            return Ok(0);
        }

        Err(IndexerError::ReorgTooDeep {
            block_number: parent,
            max_depth: self.settings.max_reorg_depth,
        })
    }

    /// Hashes for every block in the range a later reorg could still reach,
    /// so the fork search always finds a stored ancestor inside its window.
    async fn recent_hashes(&self, from: u64, to: u64) -> Result<Vec<(u64, B256)>, IndexerError> {
        let lowest = from.max(to.saturating_sub(self.settings.max_reorg_depth));
        try_join_all((lowest..=to).map(|n| self.canonical_hash(n))).await
    }

    /// The source's hash for a block. A block the node cannot serve yet is a
    /// transient failure, never evidence of a reorg.
    async fn canonical_hash(&self, block_number: u64) -> Result<(u64, B256), IndexerError> {
        self.source
            .block_hash(block_number)
            .await?
            .map(|hash| (block_number, hash))
            .ok_or_else(|| {
                IndexerError::ChainSource(format!(
                    "block {} not available from source",
                    block_number
                ))
            })
    }
}

/// Hashes observed for the range: every block that produced a log, plus the
/// recent blocks fetched directly.
///
/// Disagreeing hashes for the same block mean the chain moved while we were
/// fetching; that is retried, not committed.
fn collect_block_hashes(
    events: &[ChainEvent],
    recent: Vec<(u64, B256)>,
) -> Result<Vec<(u64, B256)>, IndexerError> {
    let mut hashes: BTreeMap<u64, B256> = BTreeMap::new();
    let observed = events
        .iter()
        .filter_map(|e| e.block_hash.map(|h| (e.block_number, h)))
        .chain(recent);

    for (block_number, hash) in observed {
        if let Some(existing) = hashes.insert(block_number, hash) {
            if existing != hash {
                return Err(IndexerError::ChainSource(format!(
                    "block {} changed hash during fetch",
                    block_number
                )));
            }
        }
    }

    Ok(hashes.into_iter().collect())
}

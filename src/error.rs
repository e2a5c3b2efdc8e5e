//! Error types for ingestion and ledger queries.

use bigdecimal::BigDecimal;
use thiserror::Error;

/// Errors raised while ingesting block ranges or touching the ledger tables.
#[derive(Error, Debug)]
pub enum IndexerError {
    /// The chain-log source failed (network, rate limit, timeout).
    #[error("chain source error: {0}")]
    ChainSource(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A debit would drive a balance below zero. The event stream is corrupt or out of order.
    #[error("balance underflow for {address} at block {block_number}: balance {balance}, debit {amount}")]
    BalanceUnderflow {
        address: String,
        block_number: u64,
        balance: BigDecimal,
        amount: BigDecimal,
    },

    /// Burns are not modelled; the contract rejects them too.
    #[error("transfer to the zero address in tx {tx_hash} at block {block_number}")]
    TransferToZeroAddress { tx_hash: String, block_number: u64 },

    /// A log with a known signature could not be decoded into the fields a ledger mutation needs.
    #[error("malformed {kind} payload at block {block_number}: {reason}")]
    MalformedPayload {
        kind: &'static str,
        block_number: u64,
        reason: String,
    },

    /// The requested block range is empty or not contiguous with the watermark.
    #[error("invalid block range {from}..={to}: {reason}")]
    InvalidRange { from: u64, to: u64, reason: String },

    /// No stored block hash within the reorg window matches the canonical chain.
    #[error("reorg below block {block_number} is deeper than {max_depth} blocks")]
    ReorgTooDeep { block_number: u64, max_depth: u64 },

    /// Undoing a reorged range failed; the ledger must not keep running on divergent data.
    #[error("reorg rollback from block {fork_block} failed: {source}")]
    RollbackFailed {
        fork_block: u64,
        #[source]
        source: Box<IndexerError>,
    },

    /// The watcher task panicked or was aborted.
    #[error("watcher task failed: {0}")]
    WatcherTask(String),
}

impl IndexerError {
    /// Whether the failure is worth retrying unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ChainSource(_) => true,
            Self::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_)
            ),
            _ => false,
        }
    }
}

/// Errors returned by read-side operations.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The caller passed an argument outside the accepted domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Nothing is recorded for the requested key.
    #[error("not found: {0}")]
    NotFound(String),

    /// The underlying ledger read failed.
    #[error(transparent)]
    Ledger(#[from] IndexerError),
}

impl From<sqlx::Error> for QueryError {
    fn from(e: sqlx::Error) -> Self {
        Self::Ledger(IndexerError::Database(e))
    }
}

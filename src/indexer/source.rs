use alloy::primitives::{Address, B256};
use alloy::providers::Provider;
use alloy::rpc::types::{BlockNumberOrTag, Filter, Log};
use async_trait::async_trait;
use futures::future::try_join_all;
use std::collections::{BTreeSet, HashMap};

use super::types::RawLog;
use crate::error::IndexerError;

/// Where raw token logs come from.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Latest block number known to the node.
    async fn chain_head(&self) -> Result<u64, IndexerError>;

    /// Canonical hash of a block, `None` if the node does not have it.
    async fn block_hash(&self, block_number: u64) -> Result<Option<B256>, IndexerError>;

    /// All logs emitted by the token in `[from, to]`, with timestamps filled in.
    async fn logs(&self, from: u64, to: u64) -> Result<Vec<RawLog>, IndexerError>;
}

/// [`ChainSource`] over an alloy JSON-RPC provider, filtered to one token contract.
pub struct AlloyChainSource<P> {
    provider: P,
    token: Address,
}

impl<P: Provider> AlloyChainSource<P> {
    pub fn new(provider: P, token: Address) -> Self {
        Self { provider, token }
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<(u64, u64), IndexerError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(block_number))
            .await
            .map_err(rpc_error)?
            .ok_or_else(|| {
                IndexerError::ChainSource(format!("block {} not available", block_number))
            })?;
        Ok((block_number, block.header.timestamp))
    }
}

fn rpc_error(e: impl std::fmt::Display) -> IndexerError {
    IndexerError::ChainSource(e.to_string())
}

fn to_raw(log: &Log) -> RawLog {
    RawLog {
        address: log.inner.address,
        topics: log.inner.data.topics().to_vec(),
        data: log.inner.data.data.clone(),
        block_number: log.block_number,
        block_hash: log.block_hash,
        tx_hash: log.transaction_hash,
        log_index: log.log_index,
        block_timestamp: log.block_timestamp,
    }
}

#[async_trait]
impl<P: Provider + 'static> ChainSource for AlloyChainSource<P> {
    async fn chain_head(&self) -> Result<u64, IndexerError> {
        self.provider.get_block_number().await.map_err(rpc_error)
    }

    async fn block_hash(&self, block_number: u64) -> Result<Option<B256>, IndexerError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(block_number))
            .await
            .map_err(rpc_error)?;
        Ok(block.map(|b| b.header.hash))
    }

    async fn logs(&self, from: u64, to: u64) -> Result<Vec<RawLog>, IndexerError> {
        let filter = Filter::new()
            .address(self.token)
            .from_block(from)
            .to_block(to);

        let logs = self.provider.get_logs(&filter).await.map_err(rpc_error)?;
        let mut raw: Vec<RawLog> = logs.iter().map(to_raw).collect();

        // Not every node fills blockTimestamp on logs; fetch headers for the rest
        let missing: BTreeSet<u64> = raw
            .iter()
            .filter(|l| l.block_timestamp.is_none())
            .filter_map(|l| l.block_number)
            .collect();

        if !missing.is_empty() {
            let timestamps: HashMap<u64, u64> =
                try_join_all(missing.into_iter().map(|n| self.block_timestamp(n)))
                    .await?
                    .into_iter()
                    .collect();

            for log in raw.iter_mut().filter(|l| l.block_timestamp.is_none()) {
                log.block_timestamp = log.block_number.and_then(|n| timestamps.get(&n).copied());
            }
        }

        tracing::debug!(from, to, logs = raw.len(), "Fetched token logs");
        Ok(raw)
    }
}

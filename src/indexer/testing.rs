//! Log builders and a scripted [`ChainSource`] for tests.

use alloy::primitives::{address, Address, LogData, B256, U256};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::decoder;
use super::source::ChainSource;
use super::types::RawLog;
use crate::error::IndexerError;

pub const TOKEN: Address = address!("00000000000000000000000000000000000000e0");

pub const ALICE: Address = address!("00000000000000000000000000000000000000a1");
pub const BOB: Address = address!("00000000000000000000000000000000000000b0");
pub const CAROL: Address = address!("00000000000000000000000000000000000000c4");

fn raw(block: u64, index: u64, data: LogData) -> RawLog {
    let mut tx = [0u8; 32];
    tx[..8].copy_from_slice(&block.to_be_bytes());
    tx[8..16].copy_from_slice(&index.to_be_bytes());
    RawLog {
        address: TOKEN,
        topics: data.topics().to_vec(),
        data: data.data,
        block_number: Some(block),
        block_hash: None,
        tx_hash: Some(B256::from(tx)),
        log_index: Some(index),
        block_timestamp: Some(1_700_000_000 + block * 12),
    }
}

pub fn transfer_log(block: u64, index: u64, from: Address, to: Address, amount: u64) -> RawLog {
    let ev = decoder::Transfer {
        from,
        to,
        value: U256::from(amount),
    };
    raw(block, index, ev.encode_log_data())
}

pub fn mint_log(block: u64, index: u64, to: Address, amount: u64) -> RawLog {
    transfer_log(block, index, Address::ZERO, to, amount)
}

pub fn split_log(block: u64, index: u64, previous: u64, ratio: u64) -> RawLog {
    let ev = decoder::StockSplit {
        previousMultiplier: U256::from(previous),
        splitMultiplier: U256::from(ratio),
    };
    raw(block, index, ev.encode_log_data())
}

pub fn symbol_log(block: u64, index: u64, old: &str, new: &str) -> RawLog {
    let ev = decoder::SymbolChanged {
        oldSymbol: old.to_string(),
        newSymbol: new.to_string(),
    };
    raw(block, index, ev.encode_log_data())
}

pub fn approval_log(block: u64, index: u64, wallet: Address, approved: bool) -> RawLog {
    let data = if approved {
        decoder::WalletApproved { wallet }.encode_log_data()
    } else {
        decoder::WalletRevoked { wallet }.encode_log_data()
    };
    raw(block, index, data)
}

/// Deterministic block hash; `salt` distinguishes competing forks.
pub fn scripted_hash(block: u64, salt: u8) -> B256 {
    let mut h = [0u8; 32];
    h[..8].copy_from_slice(&block.to_be_bytes());
    h[31] = salt;
    B256::from(h)
}

#[derive(Default)]
struct ChainState {
    head: u64,
    logs: BTreeMap<u64, Vec<RawLog>>,
    salts: BTreeMap<u64, u8>,
}

impl ChainState {
    fn hash(&self, block: u64) -> B256 {
        scripted_hash(block, self.salts.get(&block).copied().unwrap_or(0))
    }
}

/// An in-memory chain whose blocks, head and failures are scripted by the test.
#[derive(Default)]
pub struct ScriptedChain {
    state: Mutex<ChainState>,
    fail_next_calls: AtomicUsize,
    log_calls: AtomicUsize,
}

impl ScriptedChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append logs to their blocks and move the head to cover them.
    pub fn add_logs(&self, logs: Vec<RawLog>) {
        let mut state = self.state.lock().unwrap();
        for log in logs {
            let block = log.block_number.unwrap_or_default();
            state.head = state.head.max(block);
            state.logs.entry(block).or_default().push(log);
        }
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    /// Replace every block from `fork_block` on with a new fork carrying `logs`.
    pub fn reorg(&self, fork_block: u64, salt: u8, logs: Vec<RawLog>) {
        let mut state = self.state.lock().unwrap();
        let head = state.head;
        state.logs.retain(|n, _| *n < fork_block);
        for n in fork_block..=head {
            state.salts.insert(n, salt);
        }
        drop(state);
        self.add_logs(logs);
    }

    /// Make the next `n` calls of any kind fail with a transient error.
    pub fn fail_next_calls(&self, n: usize) {
        self.fail_next_calls.store(n, Ordering::SeqCst);
    }

    pub fn log_calls(&self) -> usize {
        self.log_calls.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self) -> Result<(), IndexerError> {
        if self
            .fail_next_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(IndexerError::ChainSource("connection reset".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainSource for ScriptedChain {
    async fn chain_head(&self) -> Result<u64, IndexerError> {
        self.maybe_fail()?;
        Ok(self.state.lock().unwrap().head)
    }

    async fn block_hash(&self, block_number: u64) -> Result<Option<B256>, IndexerError> {
        self.maybe_fail()?;
        let state = self.state.lock().unwrap();
        Ok((block_number <= state.head).then(|| state.hash(block_number)))
    }

    async fn logs(&self, from: u64, to: u64) -> Result<Vec<RawLog>, IndexerError> {
        self.maybe_fail()?;
        self.log_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        for (block, logs) in state.logs.range(from..=to) {
            let salt = state.salts.get(block).copied().unwrap_or(0);
            for log in logs {
                let mut log = log.clone();
                log.block_hash = Some(state.hash(*block));
                if let Some(tx) = log.tx_hash.as_mut() {
                    tx.0[30] = salt;
                }
                out.push(log);
            }
        }
        Ok(out)
    }
}

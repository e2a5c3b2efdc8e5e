//! Event-sourced ledger for a tokenized-equity contract: ingests on-chain logs,
//! maintains balances and corporate actions, and serves cap table analytics.

pub mod analytics;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod indexer;
pub mod ledger;

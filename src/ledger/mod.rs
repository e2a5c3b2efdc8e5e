//! Pure ledger arithmetic shared by every store implementation.

pub mod balances;
pub mod corporate;
pub mod multiplier;

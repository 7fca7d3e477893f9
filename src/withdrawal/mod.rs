//! Withdrawal Pipeline
//!
//! Claims pending withdrawals, signs them with the custodial key and
//! broadcasts them, recording each step in the ledger.

pub mod executor;

pub use executor::{ExecutionOutcome, WithdrawalCycleReport, WithdrawalExecutor};

//! Ledger Storage Module
//!
//! Persistence for deposits, withdrawals and balances.
//!
//! This module contains:
//! - Ledger trait definitions
//! - SQLite implementation (also used in-memory by tests)

pub mod sqlite;
pub mod traits;

// Re-exports for convenience
pub use sqlite::SqliteLedger;
pub use traits::{
    BroadcastOutcome, DepositLedger, InsertOutcome, LedgerError, LedgerResult, SettleOutcome,
    WithdrawalLedger,
};

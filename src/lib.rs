//! TRC20 Gateway
//!
//! Custodial deposit and withdrawal service for one TRC20 token on TRON.
//!
//! ## Pipelines
//!
//! 1. **Deposits** - poll the indexer for transfers into the watched address,
//!    record each transaction once, credit it when confirmations clear
//! 2. **Withdrawals** - claim pending requests, sign with the custodial key,
//!    broadcast, record the transaction hash
//!
//! The ledger's UNIQUE and status-guarded updates are the only coordination
//! between cycles and between instances.

pub mod api;
pub mod chain;
pub mod common;
pub mod deposit;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod types;
pub mod withdrawal;

#[cfg(test)]
mod testing;

// Re-exports: configuration and errors
pub use common::{CreditPolicy, ErrorClass, GatewayConfig, GatewayError, Result};

// Re-exports: chain access
pub use chain::{
    ChainError, ChainReader, ConfirmationOracle, SingleKeySigner, TransferBroadcaster,
    TransferSigner, TronGridClient,
};

// Re-exports: ledger
pub use storage::{DepositLedger, SqliteLedger, WithdrawalLedger};

// Re-exports: pipelines
pub use deposit::{CreditApplier, DeduplicationGate, DepositCycleReport, DepositReconciler};
pub use scheduler::{CycleReport, Scheduler, ServiceHealth};
pub use withdrawal::{WithdrawalCycleReport, WithdrawalExecutor};

pub use retry::RetryPolicy;
pub use types::{DepositRecord, DepositStatus, WithdrawalRecord, WithdrawalStatus};

//! Shared Types Module
//!
//! Data types shared across the gateway.

pub mod deposit;
pub mod units;
pub mod withdrawal;

// Re-exports for convenience
pub use deposit::{now_secs, DepositRecord, DepositStatus, TransferEvent, UNASSIGNED_USER};
pub use units::{format_units, from_base_units, parse_raw_amount, to_base_units, UnitsError};
pub use withdrawal::{WithdrawalRecord, WithdrawalStatus};

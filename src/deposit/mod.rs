//! Deposit Pipeline
//!
//! - [`DeduplicationGate`] answers "have we recorded this tx hash?"
//! - [`CreditApplier`] settles confirmed deposits into balances
//! - [`DepositReconciler`] drives one fetch → record → settle pass

pub mod credit;
pub mod gate;
pub mod reconciler;

pub use credit::CreditApplier;
pub use gate::{DeduplicationGate, GateOutcome};
pub use reconciler::{DepositCycleReport, DepositReconciler};

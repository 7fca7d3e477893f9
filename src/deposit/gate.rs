//! Deduplication Gate
//!
//! Answers whether a transaction hash is already in the ledger. A storage
//! failure is its own outcome: the caller skips the transfer rather than
//! guessing either way.

use std::sync::Arc;

use crate::storage::DepositLedger;

/// Gate verdict for one transaction hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Not recorded yet
    Unknown,
    /// A deposit row already exists for this hash
    AlreadyKnown,
    /// The ledger could not answer; skip this cycle
    LedgerUnavailable(String),
}

/// Ledger-backed existence check
#[derive(Clone)]
pub struct DeduplicationGate {
    ledger: Arc<dyn DepositLedger>,
}

impl DeduplicationGate {
    pub fn new(ledger: Arc<dyn DepositLedger>) -> Self {
        Self { ledger }
    }

    pub async fn check(&self, tx_hash: &str) -> GateOutcome {
        match self.ledger.exists_tx_hash(tx_hash).await {
            Ok(true) => GateOutcome::AlreadyKnown,
            Ok(false) => GateOutcome::Unknown,
            Err(e) => GateOutcome::LedgerUnavailable(e.to_string()),
        }
    }

    /// `true` only when the ledger positively confirms the hash
    pub async fn is_known(&self, tx_hash: &str) -> bool {
        self.check(tx_hash).await == GateOutcome::AlreadyKnown
    }
}

//! Credit Applier
//!
//! Moves a confirmed deposit to `completed` and increments the owner's
//! balance in a single ledger transaction. Safe to call any number of times
//! for the same deposit.

use std::sync::Arc;

use crate::common::{log_deposit_event, notify_operator_credit, Result};
use crate::storage::{DepositLedger, SettleOutcome};
use crate::types::now_secs;

/// Applies credits for confirmed deposits
#[derive(Clone)]
pub struct CreditApplier {
    ledger: Arc<dyn DepositLedger>,
}

impl CreditApplier {
    pub fn new(ledger: Arc<dyn DepositLedger>) -> Self {
        Self { ledger }
    }

    /// Settle a deposit whose confirmations have cleared
    ///
    /// Returns `AlreadySettled` when the deposit was completed earlier.
    /// Errors with `NotFound`, `InsufficientConfirmations` or
    /// `LedgerUnavailable`.
    pub async fn settle(&self, deposit_id: &str) -> Result<SettleOutcome> {
        let outcome = self.ledger.settle_deposit(deposit_id, now_secs()).await?;

        match outcome {
            SettleOutcome::Settled => self.announce(deposit_id, "deposit_settled").await,
            SettleOutcome::AlreadySettled => {
                tracing::debug!(deposit_id, "deposit already settled");
            }
        }
        Ok(outcome)
    }

    /// Operator approval under the manual credit policy
    ///
    /// Same guarantees as [`settle`](Self::settle); the confirmation
    /// threshold still applies.
    pub async fn approve(&self, deposit_id: &str) -> Result<SettleOutcome> {
        tracing::info!(deposit_id, "manual credit approval");
        self.settle(deposit_id).await
    }

    async fn announce(&self, deposit_id: &str, event_type: &str) {
        match self.ledger.get_deposit(deposit_id).await {
            Ok(Some(record)) => {
                let amount = record.amount.to_string();
                log_deposit_event(event_type, deposit_id, &record.tx_hash, &amount, None);
                notify_operator_credit(deposit_id, &record.tx_hash, &amount, &record.user_identity);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(deposit_id, error = %e, "settled, but could not load record for notification");
            }
        }
    }
}

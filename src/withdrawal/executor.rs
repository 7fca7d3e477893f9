//! Withdrawal Executor
//!
//! Per pending row: claim → scale → build → sign → persist signed id →
//! broadcast → record. The claim is a status-guarded update, so two
//! executors (in this process or another) can never both broadcast the same
//! withdrawal.
//!
//! Every pass starts by reconciling stale `processing` claims left behind by
//! a crash or an ambiguous broadcast. A signed transfer is only given up on
//! once it has expired and the solidity margin has passed without either
//! node knowing it.

use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chain::{
    address, ChainError, ConfirmationOracle, TransferBroadcaster, TransferRequest, TransferSigner,
    SOLIDIFICATION_MARGIN,
};
use crate::common::{
    log_withdrawal_event, ErrorClass, ExecutorConfig, GatewayError, ItemFailure, Result,
};
use crate::retry::RetryPolicy;
use crate::storage::{BroadcastOutcome, WithdrawalLedger};
use crate::types::{now_secs, to_base_units, WithdrawalRecord, WithdrawalStatus};

/// Pending rows taken per pass
pub const DEFAULT_BATCH_SIZE: u32 = 50;

/// What happened to one withdrawal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Another executor owns the row
    NotClaimed,
    Broadcasted { tx_hash: String },
    /// Someone else recorded the broadcast first
    AlreadyBroadcast,
    /// Marked `failed`; needs an operator
    Failed(ItemFailure),
    /// Claim given back after a transient failure
    Released {
        status: WithdrawalStatus,
        failure: ItemFailure,
    },
    /// Broadcast outcome unknown; left in `processing` for reconciliation
    InDoubt(ItemFailure),
    /// Could not even claim; untouched
    Deferred(ItemFailure),
}

/// What one executor pass did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WithdrawalCycleReport {
    /// Stale claims found on chain and recorded as broadcast
    pub recovered: usize,
    /// Stale claims returned to `pending` (or failed when out of attempts)
    pub requeued: usize,
    /// Stale claims whose signed transfer may still land; left alone
    pub unresolved: usize,
    pub broadcasted: usize,
    /// Claims lost to a concurrent executor
    pub skipped: usize,
    pub released: usize,
    pub failed: usize,
    pub in_doubt: usize,
    pub cancelled: bool,
    pub failures: Vec<ItemFailure>,
}

impl WithdrawalCycleReport {
    pub fn worst_class(&self) -> Option<ErrorClass> {
        self.failures.iter().map(|f| f.class).max()
    }

    fn tally(&mut self, outcome: ExecutionOutcome) {
        match outcome {
            ExecutionOutcome::NotClaimed | ExecutionOutcome::AlreadyBroadcast => self.skipped += 1,
            ExecutionOutcome::Broadcasted { .. } => self.broadcasted += 1,
            ExecutionOutcome::Failed(f) => {
                self.failed += 1;
                self.failures.push(f);
            }
            ExecutionOutcome::Released { status, failure } => {
                if status == WithdrawalStatus::Failed {
                    self.failed += 1;
                } else {
                    self.released += 1;
                }
                self.failures.push(failure);
            }
            ExecutionOutcome::InDoubt(f) => {
                self.in_doubt += 1;
                self.failures.push(f);
            }
            ExecutionOutcome::Deferred(f) => self.failures.push(f),
        }
    }
}

/// Where a stale claim's signed transfer stands on chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignedTxState {
    /// Solidified
    Landed,
    /// Known to the full node, or not yet past expiration plus margin
    MayLand,
    /// Expired and never seen
    Dead,
    /// No expiration on record, so it cannot be ruled out
    Unknowable,
}

/// Executes pending withdrawals with the custodial key
pub struct WithdrawalExecutor {
    config: ExecutorConfig,
    broadcaster: Arc<dyn TransferBroadcaster>,
    oracle: Arc<dyn ConfirmationOracle>,
    signer: Arc<dyn TransferSigner>,
    ledger: Arc<dyn WithdrawalLedger>,
    retry: RetryPolicy,
    batch_size: u32,
}

impl WithdrawalExecutor {
    pub fn new(
        config: ExecutorConfig,
        broadcaster: Arc<dyn TransferBroadcaster>,
        oracle: Arc<dyn ConfirmationOracle>,
        signer: Arc<dyn TransferSigner>,
        ledger: Arc<dyn WithdrawalLedger>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            config,
            broadcaster,
            oracle,
            signer,
            ledger,
            retry,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Reconcile stale claims, then execute pending withdrawals
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<WithdrawalCycleReport> {
        let mut report = WithdrawalCycleReport::default();

        self.recover_stale(cancel, &mut report).await;
        if report.cancelled {
            return Ok(report);
        }

        let pending = self.ledger.pending_withdrawals(self.batch_size).await?;
        for record in &pending {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let outcome = self.execute(record).await;
            report.tally(outcome);
        }

        tracing::info!(
            pending = pending.len(),
            broadcasted = report.broadcasted,
            recovered = report.recovered,
            failed = report.failed,
            in_doubt = report.in_doubt,
            "withdrawal cycle complete"
        );
        Ok(report)
    }

    /// Claim and execute one withdrawal
    pub async fn execute(&self, record: &WithdrawalRecord) -> ExecutionOutcome {
        let id = record.id.as_str();
        let claim_token = Uuid::new_v4().to_string();

        match self.ledger.claim_withdrawal(id, &claim_token, now_secs()).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(withdrawal_id = id, "already claimed elsewhere");
                return ExecutionOutcome::NotClaimed;
            }
            Err(e) => return ExecutionOutcome::Deferred(ItemFailure::new(id, &e.into())),
        }
        tracing::debug!(withdrawal_id = id, claim = %claim_token, "claimed");

        let amount_units = match self.validate(record) {
            Ok(units) => units,
            Err(e) => return self.fail(record, &claim_token, e).await,
        };

        let request = TransferRequest {
            owner_address: self.config.owner_address.clone(),
            token_contract: self.config.token_contract.clone(),
            destination: record.destination_address.clone(),
            amount_units,
            fee_limit_sun: self.config.fee_limit_sun,
        };

        let broadcaster = &self.broadcaster;
        let request = &request;
        let built = self
            .retry
            .run("build_transfer", ChainError::is_transient, move || {
                broadcaster.build_transfer(request)
            })
            .await;
        let unsigned = match built {
            Ok(u) => u,
            Err(e) => {
                let err = GatewayError::from(e);
                return match err.class() {
                    ErrorClass::Permanent | ErrorClass::Fatal => {
                        self.fail(record, &claim_token, err).await
                    }
                    _ => self.release(record, &claim_token, err).await,
                };
            }
        };

        let signed = match self.signer.sign(request, &unsigned) {
            Ok(s) => s,
            Err(e) => return self.fail(record, &claim_token, e.into()).await,
        };

        match self
            .ledger
            .record_signed_tx(id, &claim_token, &signed.tx_id, signed.expires_at)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(withdrawal_id = id, "claim lost before broadcast");
                return ExecutionOutcome::NotClaimed;
            }
            Err(e) => return self.release(record, &claim_token, e.into()).await,
        }

        let signed_ref = &signed;
        let sent = self
            .retry
            .run("broadcast", ChainError::is_transient, move || {
                broadcaster.broadcast(signed_ref)
            })
            .await;

        match sent {
            Ok(receipt) => {
                if receipt.duplicate {
                    tracing::info!(withdrawal_id = id, tx_hash = %receipt.tx_id, "node already had transaction");
                }
                self.record_broadcast(record, &claim_token, &receipt.tx_id).await
            }
            Err(e @ ChainError::Rejected { .. }) => self.fail(record, &claim_token, e.into()).await,
            Err(e) => {
                let failure = ItemFailure::new(id, &GatewayError::from(e));
                tracing::warn!(
                    withdrawal_id = id,
                    tx_hash = %signed.tx_id,
                    error = %failure.message,
                    "broadcast outcome unknown, leaving claim for reconciliation"
                );
                ExecutionOutcome::InDoubt(failure)
            }
        }
    }

    /// Base units for the transfer, or why it can never be sent
    fn validate(&self, record: &WithdrawalRecord) -> Result<u128> {
        let units = to_base_units(record.amount, self.config.token_decimals)?;
        if units == 0 {
            return Err(GatewayError::invalid("zero amount"));
        }
        if !address::is_valid(&record.destination_address) {
            return Err(GatewayError::invalid(format!(
                "bad destination {}",
                record.destination_address
            )));
        }
        Ok(units)
    }

    async fn record_broadcast(
        &self,
        record: &WithdrawalRecord,
        claim_token: &str,
        tx_hash: &str,
    ) -> ExecutionOutcome {
        match self
            .ledger
            .mark_broadcasted(&record.id, claim_token, tx_hash, now_secs())
            .await
        {
            Ok(BroadcastOutcome::Recorded) => {
                log_withdrawal_event(
                    "withdrawal_broadcasted",
                    &record.id,
                    &record.amount.to_string(),
                    &record.destination_address,
                    Some(tx_hash),
                    None,
                );
                ExecutionOutcome::Broadcasted {
                    tx_hash: tx_hash.to_string(),
                }
            }
            Ok(BroadcastOutcome::AlreadyBroadcast) => ExecutionOutcome::AlreadyBroadcast,
            Err(e) => {
                // signed id is persisted, so reconciliation can still close it
                let failure = ItemFailure::new(&record.id, &e.into());
                tracing::error!(withdrawal_id = %record.id, tx_hash, error = %failure.message, "broadcast not recorded");
                ExecutionOutcome::InDoubt(failure)
            }
        }
    }

    async fn fail(
        &self,
        record: &WithdrawalRecord,
        claim_token: &str,
        err: GatewayError,
    ) -> ExecutionOutcome {
        let failure = ItemFailure::new(&record.id, &err);
        log_withdrawal_event(
            "withdrawal_failed",
            &record.id,
            &record.amount.to_string(),
            &record.destination_address,
            None,
            Some((failure.code, failure.message.as_str())),
        );

        match self
            .ledger
            .mark_failed(&record.id, claim_token, &failure.message, now_secs())
            .await
        {
            Ok(true) => ExecutionOutcome::Failed(failure),
            Ok(false) => ExecutionOutcome::NotClaimed,
            Err(e) => {
                tracing::error!(withdrawal_id = %record.id, error = %e, "could not mark withdrawal failed");
                ExecutionOutcome::Deferred(failure)
            }
        }
    }

    async fn release(
        &self,
        record: &WithdrawalRecord,
        claim_token: &str,
        err: GatewayError,
    ) -> ExecutionOutcome {
        let failure = ItemFailure::new(&record.id, &err);
        let released = self
            .ledger
            .release_claim(
                &record.id,
                claim_token,
                &failure.message,
                self.config.max_attempts,
                now_secs(),
            )
            .await;

        match released {
            Ok(Some(status)) => {
                if status == WithdrawalStatus::Failed {
                    log_withdrawal_event(
                        "withdrawal_failed",
                        &record.id,
                        &record.amount.to_string(),
                        &record.destination_address,
                        None,
                        Some(("ATTEMPTS_EXHAUSTED", failure.message.as_str())),
                    );
                } else {
                    tracing::warn!(withdrawal_id = %record.id, error = %failure.message, "transient failure, requeued");
                }
                ExecutionOutcome::Released { status, failure }
            }
            Ok(None) => ExecutionOutcome::NotClaimed,
            Err(e) => {
                tracing::error!(withdrawal_id = %record.id, error = %e, "could not release claim");
                ExecutionOutcome::Deferred(failure)
            }
        }
    }

    /// Resolve `processing` rows whose claim outlived the lease
    async fn recover_stale(&self, cancel: &CancellationToken, report: &mut WithdrawalCycleReport) {
        let cutoff = now_secs().saturating_sub(self.config.claim_lease.as_secs());
        let stale = match self.ledger.stale_processing(cutoff).await {
            Ok(rows) => rows,
            Err(e) => {
                report.failures.push(ItemFailure::new("stale_processing", &e.into()));
                return;
            }
        };

        for record in &stale {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return;
            }
            let Some(claim_token) = record.claim_token.as_deref() else {
                self.fail_orphan(record, report).await;
                continue;
            };

            let state = match record.signed_tx_id.as_deref() {
                // crashed before signing; nothing can be on chain
                None => SignedTxState::Dead,
                Some(tx_id) => match self.locate(record, tx_id).await {
                    Ok(state) => state,
                    Err(e) => {
                        // chain unknown; try again next pass
                        report.failures.push(ItemFailure::new(&record.id, &e));
                        continue;
                    }
                },
            };

            match (state, record.signed_tx_id.as_deref()) {
                (SignedTxState::Landed, Some(tx_id)) => {
                    match self.record_broadcast(record, claim_token, tx_id).await {
                        ExecutionOutcome::Broadcasted { .. } => {
                            tracing::info!(withdrawal_id = %record.id, tx_hash = tx_id, "recovered broadcast from chain");
                            report.recovered += 1;
                        }
                        other => report.tally(other),
                    }
                }
                (SignedTxState::MayLand, _) => {
                    tracing::info!(
                        withdrawal_id = %record.id,
                        expires_at = ?record.signed_expires_at,
                        "signed transfer may still land, keeping claim"
                    );
                    report.unresolved += 1;
                }
                (SignedTxState::Unknowable, _) => {
                    let err = GatewayError::OrphanedClaim(
                        "signed transfer has no recorded expiration".to_string(),
                    );
                    report.tally(self.fail(record, claim_token, err).await);
                }
                _ => {
                    let err = GatewayError::chain("signed transfer expired without landing");
                    match self.release(record, claim_token, err).await {
                        ExecutionOutcome::Released { status, .. } => {
                            report.requeued += 1;
                            if status == WithdrawalStatus::Failed {
                                report.failed += 1;
                            }
                        }
                        other => report.tally(other),
                    }
                }
            }
        }
    }

    /// Ask the solidity node, then the full node, then the clock
    async fn locate(&self, record: &WithdrawalRecord, tx_id: &str) -> Result<SignedTxState> {
        let oracle = &self.oracle;
        let solidified = self
            .retry
            .run("confirmations", ChainError::is_transient, move || {
                oracle.confirmations(tx_id)
            })
            .await?;
        if solidified.is_some() {
            return Ok(SignedTxState::Landed);
        }

        let broadcaster = &self.broadcaster;
        let known = self
            .retry
            .run("transaction_known", ChainError::is_transient, move || {
                broadcaster.transaction_known(tx_id)
            })
            .await?;
        if known {
            return Ok(SignedTxState::MayLand);
        }

        Ok(match record.signed_expires_at {
            None => SignedTxState::Unknowable,
            Some(expires_at) if now_secs() > expires_at + SOLIDIFICATION_MARGIN.as_secs() => {
                SignedTxState::Dead
            }
            Some(_) => SignedTxState::MayLand,
        })
    }

    /// A `processing` row with no claim token has no owner to finish it
    async fn fail_orphan(&self, record: &WithdrawalRecord, report: &mut WithdrawalCycleReport) {
        let err = GatewayError::OrphanedClaim("processing without a claim token".to_string());
        let failure = ItemFailure::new(&record.id, &err);
        match self
            .ledger
            .fail_orphaned(&record.id, &failure.message, now_secs())
            .await
        {
            Ok(true) => {
                log_withdrawal_event(
                    "withdrawal_failed",
                    &record.id,
                    &record.amount.to_string(),
                    &record.destination_address,
                    record.signed_tx_id.as_deref(),
                    Some((failure.code, failure.message.as_str())),
                );
                report.failed += 1;
                report.failures.push(failure);
            }
            Ok(false) => {}
            Err(e) => report.failures.push(ItemFailure::new(&record.id, &e.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::signer::{MockTransferSigner, SignerError};
    use crate::chain::{MockConfirmationOracle, SingleKeySigner};
    use crate::common::config::test_config;
    use crate::storage::SqliteLedger;
    use crate::testing::{BroadcastMode, FakeChain, TEST_KEY};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    const DEST: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";

    fn signer() -> Arc<dyn TransferSigner> {
        Arc::new(SingleKeySigner::from_hex(TEST_KEY).unwrap())
    }

    fn executor_with(
        config: ExecutorConfig,
        chain: &Arc<FakeChain>,
        ledger: &Arc<SqliteLedger>,
        signer: Arc<dyn TransferSigner>,
    ) -> WithdrawalExecutor {
        WithdrawalExecutor::new(
            config,
            chain.clone(),
            chain.clone(),
            signer,
            ledger.clone(),
            RetryPolicy::immediate(2),
        )
    }

    fn executor(chain: &Arc<FakeChain>, ledger: &Arc<SqliteLedger>) -> WithdrawalExecutor {
        executor_with(test_config().executor(), chain, ledger, signer())
    }

    /// Executor that treats every claim as stale
    fn impatient_executor(chain: &Arc<FakeChain>, ledger: &Arc<SqliteLedger>) -> WithdrawalExecutor {
        let mut config = test_config().executor();
        config.claim_lease = Duration::ZERO;
        executor_with(config, chain, ledger, signer())
    }

    async fn seed(ledger: &SqliteLedger, amount: Decimal, destination: &str) -> String {
        let record = WithdrawalRecord::new("alice".into(), amount, destination.into());
        ledger.insert_withdrawal(&record).await.unwrap();
        record.id
    }

    async fn stored(ledger: &SqliteLedger, id: &str) -> WithdrawalRecord {
        ledger.get_withdrawal(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_and_record() {
        let chain = FakeChain::new();
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let id = seed(&ledger, dec!(25), DEST).await;

        let report = executor(&chain, &ledger)
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.broadcasted, 1);

        let record = stored(&ledger, &id).await;
        assert_eq!(record.status, WithdrawalStatus::Broadcasted);
        assert_eq!(chain.broadcasts(), vec![record.tx_hash.clone().unwrap()]);
        assert_eq!(record.signed_tx_id, record.tx_hash);
        assert!(record.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_answer_counts_as_accepted() {
        let chain = FakeChain::new();
        chain.set_broadcast_mode(BroadcastMode::Duplicate);
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let id = seed(&ledger, dec!(25), DEST).await;

        executor(&chain, &ledger)
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stored(&ledger, &id).await.status, WithdrawalStatus::Broadcasted);
    }

    #[tokio::test]
    async fn test_node_rejection_fails_withdrawal() {
        let chain = FakeChain::new();
        chain.set_broadcast_mode(BroadcastMode::Reject);
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let id = seed(&ledger, dec!(25), DEST).await;

        let report = executor(&chain, &ledger)
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].code, "BROADCAST_REJECTED");

        let record = stored(&ledger, &id).await;
        assert_eq!(record.status, WithdrawalStatus::Failed);
        assert!(record.tx_hash.is_none());
        assert!(record.error.unwrap().contains("balance is not sufficient"));
    }

    #[tokio::test]
    async fn test_signing_failure_fails_without_broadcast() {
        let chain = FakeChain::new();
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let id = seed(&ledger, dec!(25), DEST).await;

        let mut bad_signer = MockTransferSigner::new();
        bad_signer
            .expect_sign()
            .times(1)
            .returning(|_, _| Err(SignerError::InvalidKey("hsm offline".into())));

        let report = executor_with(test_config().executor(), &chain, &ledger, Arc::new(bad_signer))
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.worst_class(), Some(ErrorClass::Fatal));
        assert!(chain.broadcasts().is_empty());
        assert_eq!(stored(&ledger, &id).await.status, WithdrawalStatus::Failed);
    }

    #[tokio::test]
    async fn test_invalid_requests_fail_permanently() {
        let chain = FakeChain::new();
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let fractional = seed(&ledger, dec!(0.0000001), DEST).await;
        let bad_address = seed(&ledger, dec!(25), "T-not-an-address").await;

        let report = executor(&chain, &ledger)
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.failed, 2);
        assert_eq!(chain.builds(), 0);
        for id in [fractional, bad_address] {
            assert_eq!(stored(&ledger, &id).await.status, WithdrawalStatus::Failed);
        }
    }

    #[tokio::test]
    async fn test_transient_build_failures_exhaust_attempts() {
        let chain = FakeChain::new();
        chain.fail_next_builds(100);
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let id = seed(&ledger, dec!(25), DEST).await;
        let executor = executor(&chain, &ledger);
        let cancel = CancellationToken::new();

        // max_withdrawal_attempts is 3 in the test config
        for attempt in 1..=2 {
            let report = executor.run_cycle(&cancel).await.unwrap();
            assert_eq!(report.released, 1);
            let record = stored(&ledger, &id).await;
            assert_eq!(record.status, WithdrawalStatus::Pending);
            assert_eq!(record.attempts, attempt);
        }

        let report = executor.run_cycle(&cancel).await.unwrap();
        assert_eq!(report.failed, 1);
        let record = stored(&ledger, &id).await;
        assert_eq!(record.status, WithdrawalStatus::Failed);
        assert_eq!(record.attempts, 3);
        assert!(chain.broadcasts().is_empty());
    }

    #[tokio::test]
    async fn test_ambiguous_broadcast_stays_processing_within_lease() {
        let chain = FakeChain::new();
        chain.set_broadcast_mode(BroadcastMode::Unreachable);
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let id = seed(&ledger, dec!(25), DEST).await;
        let executor = executor(&chain, &ledger);

        let report = executor.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.in_doubt, 1);

        chain.set_broadcast_mode(BroadcastMode::Accept);
        let report = executor.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report, WithdrawalCycleReport::default());

        let record = stored(&ledger, &id).await;
        assert_eq!(record.status, WithdrawalStatus::Processing);
        assert!(record.signed_tx_id.is_some());
        assert!(chain.broadcasts().is_empty());
    }

    #[tokio::test]
    async fn test_recovery_requeues_transfer_that_never_landed() {
        let chain = FakeChain::new();
        chain.set_broadcast_mode(BroadcastMode::Unreachable);
        chain.set_build_expiration(now_secs() - 600);
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let id = seed(&ledger, dec!(25), DEST).await;

        executor(&chain, &ledger)
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();

        chain.set_broadcast_mode(BroadcastMode::Accept);
        let report = impatient_executor(&chain, &ledger)
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(report.broadcasted, 1);

        let record = stored(&ledger, &id).await;
        assert_eq!(record.status, WithdrawalStatus::Broadcasted);
        assert_eq!(record.attempts, 1);
        assert_eq!(chain.broadcasts().len(), 1);
    }

    #[tokio::test]
    async fn test_unexpired_transfer_is_never_rebuilt() {
        let chain = FakeChain::new();
        chain.set_broadcast_mode(BroadcastMode::Unreachable);
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let id = seed(&ledger, dec!(25), DEST).await;
        executor(&chain, &ledger)
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();

        // neither node has it, but it could still be included
        chain.set_broadcast_mode(BroadcastMode::Accept);
        let report = impatient_executor(&chain, &ledger)
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.unresolved, 1);
        assert_eq!(report.requeued + report.broadcasted, 0);
        assert_eq!(chain.builds(), 1);

        let record = stored(&ledger, &id).await;
        assert_eq!(record.status, WithdrawalStatus::Processing);
        assert!(record.signed_expires_at.unwrap() > now_secs());
    }

    #[tokio::test]
    async fn test_lagging_solidity_node_does_not_double_spend() {
        let chain = FakeChain::new();
        chain.set_broadcast_mode(BroadcastMode::LostResponse);
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let id = seed(&ledger, dec!(25), DEST).await;
        executor(&chain, &ledger)
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(chain.broadcasts().len(), 1);

        // transfer landed, but the solidity node has not caught up
        let mut lagging = MockConfirmationOracle::new();
        lagging.expect_confirmations().returning(|_| Ok(None));
        let mut config = test_config().executor();
        config.claim_lease = Duration::ZERO;
        let recovering = WithdrawalExecutor::new(
            config,
            chain.clone(),
            Arc::new(lagging),
            signer(),
            ledger.clone(),
            RetryPolicy::immediate(2),
        );

        chain.set_broadcast_mode(BroadcastMode::Accept);
        for _ in 0..3 {
            let report = recovering.run_cycle(&CancellationToken::new()).await.unwrap();
            assert_eq!(report.requeued, 0);
            assert_eq!(report.broadcasted, 0);
            assert_eq!(report.unresolved, 1);
        }

        assert_eq!(chain.builds(), 1);
        assert_eq!(chain.broadcasts().len(), 1);
        assert_eq!(stored(&ledger, &id).await.status, WithdrawalStatus::Processing);
    }

    #[tokio::test]
    async fn test_orphaned_processing_row_is_failed() {
        let chain = FakeChain::new();
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let mut orphan = WithdrawalRecord::new("alice".into(), dec!(25), DEST.into());
        orphan.status = WithdrawalStatus::Processing;
        ledger.insert_withdrawal(&orphan).await.unwrap();

        let report = executor(&chain, &ledger)
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].code, "ORPHANED_CLAIM");

        let record = stored(&ledger, &orphan.id).await;
        assert_eq!(record.status, WithdrawalStatus::Failed);
        assert_eq!(chain.builds(), 0);

        // resolved once, not reported again
        let report = executor(&chain, &ledger)
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report, WithdrawalCycleReport::default());
    }

    #[tokio::test]
    async fn test_signed_row_without_expiration_goes_to_operator() {
        let chain = FakeChain::new();
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let mut record = WithdrawalRecord::new("alice".into(), dec!(25), DEST.into());
        record.status = WithdrawalStatus::Processing;
        record.claim_token = Some("tok_old".into());
        record.claimed_at = Some(0);
        record.signed_tx_id = Some("ff".repeat(32));
        ledger.insert_withdrawal(&record).await.unwrap();

        let report = executor(&chain, &ledger)
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.requeued, 0);
        assert_eq!(stored(&ledger, &record.id).await.status, WithdrawalStatus::Failed);
        assert_eq!(chain.builds(), 0);
    }

    #[tokio::test]
    async fn test_recovery_records_transfer_that_landed() {
        let chain = FakeChain::new();
        chain.set_broadcast_mode(BroadcastMode::LostResponse);
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let id = seed(&ledger, dec!(25), DEST).await;

        let report = executor(&chain, &ledger)
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.in_doubt, 1);

        chain.set_broadcast_mode(BroadcastMode::Accept);
        let report = impatient_executor(&chain, &ledger)
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.broadcasted, 0);

        let record = stored(&ledger, &id).await;
        assert_eq!(record.status, WithdrawalStatus::Broadcasted);
        assert_eq!(chain.broadcasts(), vec![record.tx_hash.unwrap()]);
    }

    #[tokio::test]
    async fn test_recovery_waits_out_oracle_outage() {
        let chain = FakeChain::new();
        chain.set_broadcast_mode(BroadcastMode::LostResponse);
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let id = seed(&ledger, dec!(25), DEST).await;
        executor(&chain, &ledger)
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();

        chain.set_oracle_down(true);
        let report = impatient_executor(&chain, &ledger)
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.recovered + report.requeued, 0);
        assert_eq!(report.worst_class(), Some(ErrorClass::Chain));
        assert_eq!(stored(&ledger, &id).await.status, WithdrawalStatus::Processing);
    }

    #[tokio::test]
    async fn test_concurrent_executors_broadcast_once() {
        let chain = FakeChain::new();
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let id = seed(&ledger, dec!(25), DEST).await;
        let record = stored(&ledger, &id).await;

        let first = executor(&chain, &ledger);
        let second = executor(&chain, &ledger);
        let (a, b) = tokio::join!(first.execute(&record), second.execute(&record));

        let broadcasts = [&a, &b]
            .iter()
            .filter(|o| matches!(o, ExecutionOutcome::Broadcasted { .. }))
            .count();
        assert_eq!(broadcasts, 1);
        assert!(matches!(a, ExecutionOutcome::NotClaimed) || matches!(b, ExecutionOutcome::NotClaimed));
        assert_eq!(chain.broadcasts().len(), 1);
    }

    #[tokio::test]
    async fn test_racing_cycles_never_double_spend() {
        let chain = FakeChain::new();
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let mut ids = Vec::new();
        for _ in 0..25 {
            ids.push(seed(&ledger, dec!(25), DEST).await);
        }

        let first = executor(&chain, &ledger);
        let second = executor(&chain, &ledger);
        let cancel = CancellationToken::new();
        let (a, b) = tokio::join!(first.run_cycle(&cancel), second.run_cycle(&cancel));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.broadcasted + b.broadcasted, 25);
        // one build per withdrawal: no row was claimed twice
        assert_eq!(chain.builds(), 25);
        assert_eq!(chain.broadcasts().len(), 25);

        for id in ids {
            assert_eq!(stored(&ledger, &id).await.status, WithdrawalStatus::Broadcasted);
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_next_item() {
        let chain = FakeChain::new();
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        seed(&ledger, dec!(25), DEST).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = executor(&chain, &ledger).run_cycle(&cancel).await.unwrap();
        assert!(report.cancelled);
        assert!(chain.broadcasts().is_empty());
        assert_eq!(ledger.pending_withdrawals(10).await.unwrap().len(), 1);
    }
}

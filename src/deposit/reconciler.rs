//! Deposit Reconciler
//!
//! One cycle:
//! 1. fetch recent transfers into the watched address (with retry)
//! 2. keep the watched token only, skip hashes the ledger already knows
//! 3. validate amount bounds, read confirmations, insert a pending row
//! 4. settle rows whose confirmations cleared (automatic policy)
//! 5. refresh confirmations of older pending rows and settle those too
//!
//! The reconciler keeps no state between cycles; the ledger's UNIQUE
//! `tx_hash` is what makes repeated observation safe.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::chain::{ChainError, ChainReader, ConfirmationOracle};
use crate::common::{
    log_deposit_event, CreditPolicy, ErrorClass, GatewayError, ItemFailure, ReconcilerConfig,
    Result,
};
use crate::retry::RetryPolicy;
use crate::storage::{DepositLedger, InsertOutcome, SettleOutcome};
use crate::types::{from_base_units, parse_raw_amount, DepositRecord, TransferEvent};

use super::credit::CreditApplier;
use super::gate::{DeduplicationGate, GateOutcome};

/// What one reconciliation cycle did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DepositCycleReport {
    /// Transfers returned by the indexer
    pub fetched: usize,
    /// Transfers of the watched token into the watched address
    pub relevant: usize,
    pub already_known: usize,
    /// Malformed or out of bounds; never inserted
    pub discarded: usize,
    /// Left for the next cycle (ledger or oracle unavailable)
    pub deferred: usize,
    pub recorded: usize,
    /// Lost the insert race to another cycle or instance
    pub duplicates: usize,
    pub settled: usize,
    /// Pending rows whose confirmations were re-read
    pub refreshed: usize,
    /// Stopped early on shutdown
    pub cancelled: bool,
    pub failures: Vec<ItemFailure>,
}

impl DepositCycleReport {
    pub fn worst_class(&self) -> Option<ErrorClass> {
        self.failures.iter().map(|f| f.class).max()
    }

    fn fail(&mut self, item: &str, err: &GatewayError) {
        self.failures.push(ItemFailure::new(item, err));
    }
}

/// Outcome for a single observed transfer
#[derive(Debug, Clone, PartialEq, Eq)]
enum TransferOutcome {
    AlreadyKnown,
    Discarded,
    Deferred,
    Duplicate,
    Recorded { deposit_id: String, settled: bool },
}

/// Drives the chain → ledger → credit pipeline
pub struct DepositReconciler {
    config: ReconcilerConfig,
    reader: Arc<dyn ChainReader>,
    oracle: Arc<dyn ConfirmationOracle>,
    ledger: Arc<dyn DepositLedger>,
    gate: DeduplicationGate,
    credit: CreditApplier,
    retry: RetryPolicy,
}

impl DepositReconciler {
    pub fn new(
        config: ReconcilerConfig,
        reader: Arc<dyn ChainReader>,
        oracle: Arc<dyn ConfirmationOracle>,
        ledger: Arc<dyn DepositLedger>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            gate: DeduplicationGate::new(ledger.clone()),
            credit: CreditApplier::new(ledger.clone()),
            config,
            reader,
            oracle,
            ledger,
            retry,
        }
    }

    pub fn credit(&self) -> &CreditApplier {
        &self.credit
    }

    /// Run one cycle
    ///
    /// Errors only when the transfer list cannot be fetched; per-item
    /// failures land in the report.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<DepositCycleReport> {
        let mut report = DepositCycleReport::default();

        let transfers = self.fetch_transfers().await?;
        report.fetched = transfers.len();

        let mut seen_this_cycle = HashSet::new();
        for event in transfers
            .iter()
            .filter(|e| e.is_incoming(&self.config.watched_address, &self.config.token_contract))
        {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(report);
            }
            report.relevant += 1;

            match self.process_transfer(event, &mut report).await {
                TransferOutcome::AlreadyKnown => report.already_known += 1,
                TransferOutcome::Discarded => report.discarded += 1,
                TransferOutcome::Deferred => report.deferred += 1,
                TransferOutcome::Duplicate => report.duplicates += 1,
                TransferOutcome::Recorded { deposit_id, settled } => {
                    report.recorded += 1;
                    if settled {
                        report.settled += 1;
                    }
                    seen_this_cycle.insert(deposit_id);
                }
            }
        }

        self.refresh_pending(&seen_this_cycle, cancel, &mut report)
            .await;

        tracing::info!(
            fetched = report.fetched,
            relevant = report.relevant,
            recorded = report.recorded,
            settled = report.settled,
            refreshed = report.refreshed,
            failures = report.failures.len(),
            "deposit cycle complete"
        );
        Ok(report)
    }

    async fn fetch_transfers(&self) -> Result<Vec<TransferEvent>> {
        let reader = &self.reader;
        let address = self.config.watched_address.as_str();
        let contract = self.config.token_contract.as_str();
        let limit = self.config.fetch_limit;

        self.retry
            .run("fetch_transfers", ChainError::is_transient, move || {
                reader.fetch_recent_transfers(address, contract, limit)
            })
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "could not fetch transfers, skipping cycle");
                GatewayError::from(e)
            })
    }

    async fn confirmations(&self, tx_id: &str) -> std::result::Result<u32, ChainError> {
        let oracle = &self.oracle;
        let observed = self
            .retry
            .run("confirmations", ChainError::is_transient, move || {
                oracle.confirmations(tx_id)
            })
            .await?;
        // unknown to the solidity node yet
        Ok(observed.unwrap_or(0))
    }

    async fn process_transfer(
        &self,
        event: &TransferEvent,
        report: &mut DepositCycleReport,
    ) -> TransferOutcome {
        let tx_hash = event.tx_id.as_str();

        match self.gate.check(tx_hash).await {
            GateOutcome::AlreadyKnown => return TransferOutcome::AlreadyKnown,
            GateOutcome::LedgerUnavailable(msg) => {
                tracing::warn!(tx_hash, error = %msg, "dedup check failed, skipping transfer");
                report.fail(tx_hash, &GatewayError::ledger(msg));
                return TransferOutcome::Deferred;
            }
            GateOutcome::Unknown => {}
        }

        let (amount, amount_units) = match self.validate_amount(event) {
            Ok(v) => v,
            Err(e) => {
                log_deposit_event(
                    "deposit_discarded",
                    "-",
                    tx_hash,
                    &event.raw_amount,
                    Some((e.error_code(), e.to_string().as_str())),
                );
                return TransferOutcome::Discarded;
            }
        };

        let confirmations = match self.confirmations(tx_hash).await {
            Ok(c) => c,
            Err(e) => {
                let err = GatewayError::from(e);
                tracing::warn!(tx_hash, error = %err, "confirmation lookup failed, deferring");
                report.fail(tx_hash, &err);
                return TransferOutcome::Deferred;
            }
        };

        let record = DepositRecord::new(
            event,
            amount,
            amount_units,
            confirmations,
            self.config.required_confirmations,
        );

        match self.ledger.insert_deposit(&record).await {
            Ok(InsertOutcome::Duplicate) => {
                tracing::debug!(tx_hash, "deposit inserted concurrently, already handled");
                return TransferOutcome::Duplicate;
            }
            Ok(InsertOutcome::Inserted) => {
                log_deposit_event(
                    "deposit_recorded",
                    &record.id,
                    tx_hash,
                    &amount.to_string(),
                    None,
                );
            }
            Err(e) => {
                let err = GatewayError::from(e);
                tracing::warn!(tx_hash, error = %err, "deposit insert failed");
                report.fail(tx_hash, &err);
                return TransferOutcome::Deferred;
            }
        }

        let settled = record.is_confirmed() && self.try_settle(&record.id, report).await;
        TransferOutcome::Recorded {
            deposit_id: record.id,
            settled,
        }
    }

    /// Human and base-unit amount, within configured bounds
    fn validate_amount(&self, event: &TransferEvent) -> Result<(rust_decimal::Decimal, u128)> {
        let units = parse_raw_amount(&event.raw_amount)?;
        let amount = from_base_units(units, self.config.token_decimals)?;

        if units == 0 {
            return Err(GatewayError::invalid("zero amount"));
        }
        if amount < self.config.min_deposit {
            return Err(GatewayError::invalid(format!(
                "{} below minimum {}",
                amount, self.config.min_deposit
            )));
        }
        if amount > self.config.max_deposit {
            return Err(GatewayError::invalid(format!(
                "{} above maximum {}",
                amount, self.config.max_deposit
            )));
        }
        Ok((amount, units))
    }

    /// Settle under the automatic policy; true when this call credited
    async fn try_settle(&self, deposit_id: &str, report: &mut DepositCycleReport) -> bool {
        if self.config.credit_policy == CreditPolicy::Manual {
            tracing::info!(deposit_id, "deposit confirmed, awaiting operator approval");
            return false;
        }

        match self.credit.settle(deposit_id).await {
            Ok(SettleOutcome::Settled) => true,
            Ok(SettleOutcome::AlreadySettled) => false,
            Err(e) if e.is_benign() || matches!(e, GatewayError::InsufficientConfirmations(_)) => {
                tracing::debug!(deposit_id, error = %e, "settlement skipped");
                false
            }
            Err(e) => {
                tracing::warn!(deposit_id, error = %e, "settlement failed");
                report.fail(deposit_id, &e);
                false
            }
        }
    }

    /// Re-read confirmations of pending rows not inserted this cycle
    async fn refresh_pending(
        &self,
        skip: &HashSet<String>,
        cancel: &CancellationToken,
        report: &mut DepositCycleReport,
    ) {
        let pending = match self.ledger.pending_deposits().await {
            Ok(p) => p,
            Err(e) => {
                report.fail("pending_deposits", &GatewayError::from(e));
                return;
            }
        };

        for record in pending.iter().filter(|r| !skip.contains(&r.id)) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return;
            }

            let observed = match self.confirmations(&record.tx_hash).await {
                Ok(c) => c,
                Err(e) => {
                    report.fail(&record.id, &GatewayError::from(e));
                    continue;
                }
            };

            let stored = match self.ledger.update_confirmations(&record.id, observed).await {
                Ok(c) => c,
                Err(e) => {
                    report.fail(&record.id, &GatewayError::from(e));
                    continue;
                }
            };
            report.refreshed += 1;

            if stored > record.confirmation_count {
                tracing::debug!(
                    deposit_id = %record.id,
                    confirmations = stored,
                    required = record.required_confirmations,
                    "confirmations advanced"
                );
            }

            if stored >= record.required_confirmations && self.try_settle(&record.id, report).await {
                report.settled += 1;
            }
        }
    }
}

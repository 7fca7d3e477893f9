//! Cycle Scheduler
//!
//! One loop drives both pipelines on a fixed interval. Deposits and
//! withdrawals run independently inside a cycle; a failing side is reported
//! and the other still runs. On-demand triggers share a mutex with the loop
//! so two cycles never overlap in this process.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::chain::{SingleKeySigner, TronGridClient};
use crate::common::{ErrorClass, GatewayConfig, ItemFailure, Result};
use crate::deposit::{DepositCycleReport, DepositReconciler};
use crate::storage::SqliteLedger;
use crate::types::now_secs;
use crate::withdrawal::{WithdrawalCycleReport, WithdrawalExecutor};

/// Upper bound on the failure multiplier for backoff
const MAX_BACKOFF_STEPS: u32 = 4;

/// Everything one cycle did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub started_at: u64,
    pub finished_at: u64,
    pub deposits: Option<DepositCycleReport>,
    /// Set when the deposit pass could not run at all
    pub deposit_error: Option<ItemFailure>,
    /// `None` when withdrawals are disabled or the pass could not run
    pub withdrawals: Option<WithdrawalCycleReport>,
    pub withdrawal_error: Option<ItemFailure>,
    pub worst_class: Option<ErrorClass>,
}

impl CycleReport {
    /// Worst failure, item level or pass level
    fn worst_failure(&self) -> Option<&ItemFailure> {
        let deposit_items = self.deposits.iter().flat_map(|r| r.failures.iter());
        let withdrawal_items = self.withdrawals.iter().flat_map(|r| r.failures.iter());
        self.deposit_error
            .iter()
            .chain(self.withdrawal_error.iter())
            .chain(deposit_items)
            .chain(withdrawal_items)
            .max_by_key(|f| f.class)
    }

    /// Whether the service itself is degraded, not just an item
    pub fn is_failure(&self) -> bool {
        matches!(
            self.worst_class,
            Some(ErrorClass::Chain | ErrorClass::Ledger | ErrorClass::Fatal)
        )
    }
}

/// Observational health snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceHealth {
    pub last_cycle_time: Option<u64>,
    pub last_error: Option<String>,
    pub cycles_completed: u64,
    pub consecutive_failures: u32,
    pub withdrawals_enabled: bool,
}

/// Extra wait added to the interval after a cycle
pub fn extra_backoff(class: Option<ErrorClass>, consecutive_failures: u32) -> Duration {
    let base = match class {
        None | Some(ErrorClass::Benign) | Some(ErrorClass::Permanent) => return Duration::ZERO,
        Some(ErrorClass::Chain) => Duration::from_secs(15),
        Some(ErrorClass::Ledger) => Duration::from_secs(30),
        Some(ErrorClass::Fatal) => Duration::from_secs(120),
    };
    base * consecutive_failures.clamp(1, MAX_BACKOFF_STEPS)
}

/// Drives the deposit reconciler and withdrawal executor
pub struct Scheduler {
    reconciler: DepositReconciler,
    executor: Option<WithdrawalExecutor>,
    interval: Duration,
    cycle_lock: Mutex<()>,
    health: Arc<RwLock<ServiceHealth>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        reconciler: DepositReconciler,
        executor: Option<WithdrawalExecutor>,
        interval: Duration,
    ) -> Self {
        let health = ServiceHealth {
            withdrawals_enabled: executor.is_some(),
            ..ServiceHealth::default()
        };
        Self {
            reconciler,
            executor,
            interval,
            cycle_lock: Mutex::new(()),
            health: Arc::new(RwLock::new(health)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Wire both pipelines to TronGrid and the given ledger
    ///
    /// Withdrawals stay disabled when no custodial key is configured.
    pub fn from_config(config: &GatewayConfig, ledger: Arc<SqliteLedger>) -> Result<Self> {
        let chain = Arc::new(TronGridClient::from_config(config)?);

        let reconciler = DepositReconciler::new(
            config.reconciler(),
            chain.clone(),
            chain.clone(),
            ledger.clone(),
            config.retry,
        );

        let executor = match &config.signing_key {
            Some(key) => {
                let signer = SingleKeySigner::from_hex(key)?;
                Some(WithdrawalExecutor::new(
                    config.executor(),
                    chain.clone(),
                    chain,
                    Arc::new(signer),
                    ledger,
                    config.retry,
                ))
            }
            None => {
                tracing::warn!("no custodial key configured, withdrawals disabled");
                None
            }
        };

        Ok(Self::new(reconciler, executor, config.poll_interval))
    }

    pub fn reconciler(&self) -> &DepositReconciler {
        &self.reconciler
    }

    /// Token that stops [`run`](Self::run) and any cycle in flight
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run one cycle now
    ///
    /// Waits for a cycle already in flight instead of overlapping it.
    pub async fn trigger_reconciliation_cycle(&self) -> CycleReport {
        let _guard = self.cycle_lock.lock().await;
        let cancel = &self.shutdown;

        let mut report = CycleReport {
            started_at: now_secs(),
            ..CycleReport::default()
        };

        match self.reconciler.run_cycle(cancel).await {
            Ok(deposits) => report.deposits = Some(deposits),
            Err(e) => {
                tracing::error!(error = %e, code = e.error_code(), "deposit pass failed");
                report.deposit_error = Some(ItemFailure::new("deposits", &e));
            }
        }

        if let Some(executor) = &self.executor {
            match executor.run_cycle(cancel).await {
                Ok(withdrawals) => report.withdrawals = Some(withdrawals),
                Err(e) => {
                    tracing::error!(error = %e, code = e.error_code(), "withdrawal pass failed");
                    report.withdrawal_error = Some(ItemFailure::new("withdrawals", &e));
                }
            }
        }

        report.finished_at = now_secs();
        report.worst_class = report.worst_failure().map(|f| f.class);
        self.record(&report).await;
        report
    }

    async fn record(&self, report: &CycleReport) {
        let mut health = self.health.write().await;
        health.last_cycle_time = Some(report.finished_at);
        health.cycles_completed += 1;

        if report.is_failure() {
            health.consecutive_failures += 1;
            health.last_error = report
                .worst_failure()
                .map(|f| format!("{}: {}", f.code, f.message));
        } else {
            health.consecutive_failures = 0;
        }
    }

    pub async fn get_service_health(&self) -> ServiceHealth {
        self.health.read().await.clone()
    }

    /// Loop until the shutdown token fires
    pub async fn run(&self) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            withdrawals = self.executor.is_some(),
            "scheduler started"
        );

        while !self.shutdown.is_cancelled() {
            let report = self.trigger_reconciliation_cycle().await;

            let failures = self.health.read().await.consecutive_failures;
            let backoff = extra_backoff(report.worst_class, failures);
            if !backoff.is_zero() {
                tracing::warn!(
                    class = ?report.worst_class,
                    consecutive_failures = failures,
                    backoff_secs = backoff.as_secs(),
                    "backing off after failed cycle"
                );
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval + backoff) => {}
            }
        }

        tracing::info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DepositLedger, WithdrawalLedger};
    use crate::testing::{relevant_transfer, scheduler, FakeChain};
    use crate::types::{WithdrawalRecord, WithdrawalStatus, UNASSIGNED_USER};
    use rust_decimal_macros::dec;

    async fn seed_withdrawal(ledger: &SqliteLedger) -> String {
        let record = WithdrawalRecord::new(
            "alice".into(),
            dec!(25),
            "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t".into(),
        );
        ledger.insert_withdrawal(&record).await.unwrap();
        record.id
    }

    #[test]
    fn test_backoff_by_class() {
        assert_eq!(extra_backoff(None, 0), Duration::ZERO);
        assert_eq!(extra_backoff(Some(ErrorClass::Permanent), 3), Duration::ZERO);
        assert_eq!(extra_backoff(Some(ErrorClass::Chain), 1), Duration::from_secs(15));
        assert_eq!(extra_backoff(Some(ErrorClass::Chain), 2), Duration::from_secs(30));
        assert_eq!(extra_backoff(Some(ErrorClass::Ledger), 1), Duration::from_secs(30));
        assert_eq!(extra_backoff(Some(ErrorClass::Fatal), 10), Duration::from_secs(480));
    }

    #[tokio::test]
    async fn test_cycle_runs_both_pipelines() {
        let chain = FakeChain::new();
        chain.push_transfer(relevant_transfer("abc", "50000000"));
        chain.set_confirmations("abc", 1);
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let withdrawal_id = seed_withdrawal(&ledger).await;

        let scheduler = scheduler(&chain, &ledger);
        let report = scheduler.trigger_reconciliation_cycle().await;

        assert_eq!(report.deposits.as_ref().unwrap().settled, 1);
        assert_eq!(report.withdrawals.as_ref().unwrap().broadcasted, 1);
        assert_eq!(report.worst_class, None);
        assert_eq!(ledger.balance_units(UNASSIGNED_USER).await.unwrap(), 50_000_000);
        let withdrawal = ledger.get_withdrawal(&withdrawal_id).await.unwrap().unwrap();
        assert_eq!(withdrawal.status, WithdrawalStatus::Broadcasted);

        let health = scheduler.get_service_health().await;
        assert_eq!(health.cycles_completed, 1);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_cycle_time.is_some());
        assert!(health.withdrawals_enabled);
    }

    #[tokio::test]
    async fn test_repeated_cycles_credit_once() {
        let chain = FakeChain::new();
        chain.push_transfer(relevant_transfer("abc", "50000000"));
        chain.set_confirmations("abc", 1);
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let scheduler = scheduler(&chain, &ledger);

        for _ in 0..4 {
            scheduler.trigger_reconciliation_cycle().await;
        }
        assert_eq!(ledger.balance_units(UNASSIGNED_USER).await.unwrap(), 50_000_000);
        assert_eq!(scheduler.get_service_health().await.cycles_completed, 4);
    }

    #[tokio::test]
    async fn test_deposit_outage_does_not_block_withdrawals() {
        let chain = FakeChain::new();
        chain.fail_next_fetches(3);
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        seed_withdrawal(&ledger).await;

        let scheduler = scheduler(&chain, &ledger);
        let report = scheduler.trigger_reconciliation_cycle().await;

        assert!(report.deposits.is_none());
        assert_eq!(report.deposit_error.as_ref().unwrap().code, "CHAIN_UNAVAILABLE");
        assert_eq!(report.withdrawals.as_ref().unwrap().broadcasted, 1);
        assert_eq!(report.worst_class, Some(ErrorClass::Chain));

        let health = scheduler.get_service_health().await;
        assert_eq!(health.consecutive_failures, 1);
        assert!(health.last_error.unwrap().starts_with("CHAIN_UNAVAILABLE"));

        // recovers on the next cycle
        scheduler.trigger_reconciliation_cycle().await;
        assert_eq!(scheduler.get_service_health().await.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_concurrent_triggers_do_not_overlap() {
        let chain = FakeChain::new();
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        seed_withdrawal(&ledger).await;
        let scheduler = scheduler(&chain, &ledger);

        let (a, b) = tokio::join!(
            scheduler.trigger_reconciliation_cycle(),
            scheduler.trigger_reconciliation_cycle()
        );
        let sent = a.withdrawals.unwrap().broadcasted + b.withdrawals.unwrap().broadcasted;
        assert_eq!(sent, 1);
        assert_eq!(chain.broadcasts().len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let chain = FakeChain::new();
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let scheduler = Arc::new(scheduler(&chain, &ledger));
        let token = scheduler.shutdown_token();

        let handle = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run().await }
        });

        while scheduler.get_service_health().await.cycles_completed == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        token.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scheduler.get_service_health().await.cycles_completed, 1);
    }
}

//! Ledger Trait Definitions
//!
//! The ledger is the single source of truth for idempotency. Every
//! cross-cycle (and cross-instance) transition is a conditional write:
//! a UNIQUE-guarded insert or a status-guarded update. Nothing here relies
//! on in-process locks.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{DepositRecord, WithdrawalRecord, WithdrawalStatus};

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("deposit {id} has {have} of {need} confirmations")]
    InsufficientConfirmations { id: String, have: u32, need: u32 },
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        LedgerError::Database(err.to_string())
    }
}

impl From<r2d2::Error> for LedgerError {
    fn from(err: r2d2::Error) -> Self {
        LedgerError::Connection(err.to_string())
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Result of a UNIQUE-guarded deposit insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with this `tx_hash` already exists
    Duplicate,
}

/// Result of settling a deposit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// Status moved to `completed` and the balance was credited
    Settled,
    /// Someone else completed it first; nothing changed
    AlreadySettled,
}

/// Result of recording a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    Recorded,
    /// The row already left `processing` under this claim
    AlreadyBroadcast,
}

/// Deposit side of the ledger
///
/// Implementations:
/// - `SqliteLedger` - SQLite with an r2d2 pool
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DepositLedger: Send + Sync {
    /// Side-effect free existence check on the unique `tx_hash` column
    async fn exists_tx_hash(&self, tx_hash: &str) -> LedgerResult<bool>;

    /// Insert a pending deposit; a UNIQUE violation yields `Duplicate`
    async fn insert_deposit(&self, record: &DepositRecord) -> LedgerResult<InsertOutcome>;

    async fn get_deposit(&self, id: &str) -> LedgerResult<Option<DepositRecord>>;

    async fn get_deposit_by_tx_hash(&self, tx_hash: &str) -> LedgerResult<Option<DepositRecord>>;

    /// All deposits still waiting for credit
    async fn pending_deposits(&self) -> LedgerResult<Vec<DepositRecord>>;

    /// Store `max(current, observed)` and return the stored count
    async fn update_confirmations(&self, id: &str, observed: u32) -> LedgerResult<u32>;

    /// Mark completed and credit the balance in one transaction
    ///
    /// Fails with `InsufficientConfirmations` below the threshold and
    /// `NotFound` for an unknown id.
    async fn settle_deposit(&self, id: &str, settled_at: u64) -> LedgerResult<SettleOutcome>;

    /// Balance in token base units (zero for unknown users)
    async fn balance_units(&self, user_identity: &str) -> LedgerResult<u128>;
}

/// Withdrawal side of the ledger
///
/// Rows are created by the intake collaborator; the executor only
/// transitions them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WithdrawalLedger: Send + Sync {
    async fn insert_withdrawal(&self, record: &WithdrawalRecord) -> LedgerResult<()>;

    async fn get_withdrawal(&self, id: &str) -> LedgerResult<Option<WithdrawalRecord>>;

    /// Oldest pending withdrawals first
    async fn pending_withdrawals(&self, limit: u32) -> LedgerResult<Vec<WithdrawalRecord>>;

    /// `pending → processing`; false when another executor got there first
    async fn claim_withdrawal(&self, id: &str, claim_token: &str, now: u64) -> LedgerResult<bool>;

    /// Persist the signed transaction id and its expiration (unix secs)
    /// under the caller's claim
    async fn record_signed_tx(
        &self,
        id: &str,
        claim_token: &str,
        signed_tx_id: &str,
        expires_at: u64,
    ) -> LedgerResult<bool>;

    /// `processing → broadcasted`, setting `tx_hash` and `processed_at`
    async fn mark_broadcasted(
        &self,
        id: &str,
        claim_token: &str,
        tx_hash: &str,
        now: u64,
    ) -> LedgerResult<BroadcastOutcome>;

    /// Give a claim back after a transient failure
    ///
    /// Increments `attempts`; the row returns to `pending`, or becomes
    /// `failed` once `max_attempts` is reached. `None` when the caller no
    /// longer owns the claim.
    async fn release_claim(
        &self,
        id: &str,
        claim_token: &str,
        error: &str,
        max_attempts: u32,
        now: u64,
    ) -> LedgerResult<Option<WithdrawalStatus>>;

    /// `processing → failed`
    async fn mark_failed(
        &self,
        id: &str,
        claim_token: &str,
        error: &str,
        now: u64,
    ) -> LedgerResult<bool>;

    /// `processing → failed` for a row no executor holds a claim on
    async fn fail_orphaned(&self, id: &str, error: &str, now: u64) -> LedgerResult<bool>;

    /// `processing` rows claimed at or before `claimed_before`
    async fn stale_processing(&self, claimed_before: u64) -> LedgerResult<Vec<WithdrawalRecord>>;
}

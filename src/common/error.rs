//! Common Error Types for the TRC20 Gateway
//!
//! Every failure the control loop can observe is classified into the
//! taxonomy below. Component errors (`ChainError`, `LedgerError`,
//! `SignerError`, ...) convert into [`GatewayError`] with `?`.

use thiserror::Error;

use crate::chain::{ChainError, SignerError};
use crate::storage::LedgerError;
use crate::types::units::UnitsError;

/// Root error type for the gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] super::config::ConfigError),

    /// Logging errors
    #[error("logging error: {0}")]
    Logging(#[from] super::logging::LoggingError),

    /// Indexer / node unreachable, non-2xx, or unparsable response
    #[error("chain unavailable: {0}")]
    ChainUnavailable(String),

    /// Ledger store failure
    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// Transfer or withdrawal that can never be processed
    #[error("invalid transfer: {0}")]
    InvalidTransfer(String),

    /// Deposit was already completed by someone else
    #[error("deposit already settled: {0}")]
    AlreadySettled(String),

    /// Withdrawal was already broadcast by someone else
    #[error("withdrawal already broadcast: {0}")]
    AlreadyBroadcast(String),

    /// Custodial key or transaction build defect
    #[error("signing failure: {0}")]
    SigningFailure(String),

    /// Node refused the signed transaction
    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),

    /// Deposit below its confirmation threshold
    #[error("insufficient confirmations: {0}")]
    InsufficientConfirmations(String),

    /// Record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// `processing` row whose broadcast cannot be reconciled automatically
    #[error("orphaned claim: {0}")]
    OrphanedClaim(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure classes used by the scheduler to pick a backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Race detected, treated as success
    Benign,
    /// Permanent, per-item; never retried
    Permanent,
    /// Chain side transient
    Chain,
    /// Ledger side transient
    Ledger,
    /// Needs an operator
    Fatal,
}

impl GatewayError {
    /// Create a chain error
    pub fn chain(msg: impl Into<String>) -> Self {
        Self::ChainUnavailable(msg.into())
    }

    /// Create a ledger error
    pub fn ledger(msg: impl Into<String>) -> Self {
        Self::LedgerUnavailable(msg.into())
    }

    /// Create an invalid-transfer error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidTransfer(msg.into())
    }

    /// Create a signing error
    pub fn signing(msg: impl Into<String>) -> Self {
        Self::SigningFailure(msg.into())
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::ChainUnavailable(_)
                | GatewayError::LedgerUnavailable(_)
                | GatewayError::Io(_)
        )
    }

    /// Races that are reported but count as success
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            GatewayError::AlreadySettled(_) | GatewayError::AlreadyBroadcast(_)
        )
    }

    /// Classify for backoff selection
    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::AlreadySettled(_)
            | GatewayError::AlreadyBroadcast(_)
            | GatewayError::InsufficientConfirmations(_) => ErrorClass::Benign,
            GatewayError::InvalidTransfer(_)
            | GatewayError::BroadcastRejected(_)
            | GatewayError::NotFound(_)
            | GatewayError::OrphanedClaim(_) => ErrorClass::Permanent,
            GatewayError::ChainUnavailable(_) => ErrorClass::Chain,
            GatewayError::LedgerUnavailable(_) | GatewayError::Io(_) => ErrorClass::Ledger,
            GatewayError::SigningFailure(_)
            | GatewayError::Config(_)
            | GatewayError::Logging(_) => ErrorClass::Fatal,
        }
    }

    /// Get error code for logs and API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::Logging(_) => "LOGGING_ERROR",
            GatewayError::ChainUnavailable(_) => "CHAIN_UNAVAILABLE",
            GatewayError::LedgerUnavailable(_) => "LEDGER_UNAVAILABLE",
            GatewayError::InvalidTransfer(_) => "INVALID_TRANSFER",
            GatewayError::AlreadySettled(_) => "ALREADY_SETTLED",
            GatewayError::AlreadyBroadcast(_) => "ALREADY_BROADCAST",
            GatewayError::SigningFailure(_) => "SIGNING_FAILURE",
            GatewayError::BroadcastRejected(_) => "BROADCAST_REJECTED",
            GatewayError::InsufficientConfirmations(_) => "INSUFFICIENT_CONFIRMATIONS",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::OrphanedClaim(_) => "ORPHANED_CLAIM",
            GatewayError::Io(_) => "IO_ERROR",
        }
    }
}

impl From<ChainError> for GatewayError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Rejected { code, message } => {
                GatewayError::BroadcastRejected(format!("{}: {}", code, message))
            }
            ChainError::InvalidAddress(msg) => GatewayError::InvalidTransfer(msg),
            ChainError::BuildIntegrity(msg) => GatewayError::SigningFailure(msg),
            other => GatewayError::ChainUnavailable(other.to_string()),
        }
    }
}

impl From<LedgerError> for GatewayError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(id) => GatewayError::NotFound(id),
            LedgerError::InsufficientConfirmations { id, have, need } => {
                GatewayError::InsufficientConfirmations(format!("{} has {}/{}", id, have, need))
            }
            other => GatewayError::LedgerUnavailable(other.to_string()),
        }
    }
}

impl From<SignerError> for GatewayError {
    fn from(err: SignerError) -> Self {
        GatewayError::SigningFailure(err.to_string())
    }
}

impl From<UnitsError> for GatewayError {
    fn from(err: UnitsError) -> Self {
        GatewayError::InvalidTransfer(err.to_string())
    }
}

/// Result type alias using GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;

/// One item that failed inside a cycle, as reported to operators
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ItemFailure {
    /// Deposit tx hash, deposit id or withdrawal id
    pub item: String,
    pub class: ErrorClass,
    pub code: &'static str,
    pub message: String,
}

impl ItemFailure {
    pub fn new(item: impl Into<String>, err: &GatewayError) -> Self {
        Self {
            item: item.into(),
            class: err.class(),
            code: err.error_code(),
            message: err.to_string(),
        }
    }
}

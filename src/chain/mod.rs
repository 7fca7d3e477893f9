//! Chain Access Module
//!
//! Seams between the gateway and the TRON network:
//! - [`ChainReader`] lists recent TRC20 transfers into an address
//! - [`ConfirmationOracle`] reports how deep a transaction is buried
//! - [`TransferBroadcaster`] builds unsigned transfers and broadcasts signed ones
//! - [`TransferSigner`] signs with the custodial key
//!
//! [`TronGridClient`] implements the three network traits over HTTP.

pub mod address;
pub mod signer;
pub mod transaction;
pub mod trongrid;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::types::TransferEvent;

pub use signer::{SignerError, SingleKeySigner, TransferSigner};
pub use transaction::{DecodedTransfer, TransactionError};
pub use trongrid::TronGridClient;

/// How long after its expiration an unseen transaction is given to show up
/// on the solidity node. Inclusion stops at expiration; solidification
/// follows about a minute later.
pub const SOLIDIFICATION_MARGIN: Duration = Duration::from_secs(120);

/// Chain access errors
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("transaction build failed: {0}")]
    Build(String),

    #[error("built transaction failed integrity check: {0}")]
    BuildIntegrity(String),

    #[error("node rejected transaction ({code}): {message}")]
    Rejected { code: String, message: String },

    /// The node could not take the transaction right now
    #[error("node busy ({code}): {message}")]
    NodeBusy { code: String, message: String },
}

impl ChainError {
    /// Worth retrying within the same cycle
    pub fn is_transient(&self) -> bool {
        match self {
            ChainError::Http(_) | ChainError::Parse(_) | ChainError::NodeBusy { .. } => true,
            ChainError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ChainError::Parse(err.to_string())
        } else {
            ChainError::Http(err.to_string())
        }
    }
}

/// A TRC20 transfer the executor wants built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub owner_address: String,
    pub token_contract: String,
    pub destination: String,
    pub amount_units: u128,
    /// Fee ceiling in sun
    pub fee_limit_sun: u64,
}

/// A node-built transaction awaiting a signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsignedTransfer {
    /// `txID` as returned by the node
    pub tx_id: String,
    pub raw_data_hex: String,
    /// Full transaction object, sent back on broadcast
    pub payload: serde_json::Value,
}

/// A transaction carrying the custodial signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedTransfer {
    pub tx_id: String,
    /// Unix seconds after which no block can include it
    pub expires_at: u64,
    pub payload: serde_json::Value,
}

/// Node acknowledgement of a broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastReceipt {
    pub tx_id: String,
    /// The node already had this transaction
    pub duplicate: bool,
}

/// Recent token transfers into an address
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Newest first, best effort; each call is a fresh snapshot
    async fn fetch_recent_transfers(
        &self,
        watched_address: &str,
        token_contract: &str,
        limit: u32,
    ) -> Result<Vec<TransferEvent>, ChainError>;
}

/// Depth of a transaction below the chain head
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfirmationOracle: Send + Sync {
    /// `None` when the chain does not know the transaction
    async fn confirmations(&self, tx_id: &str) -> Result<Option<u32>, ChainError>;
}

/// Outbound transfer construction and broadcast
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransferBroadcaster: Send + Sync {
    async fn build_transfer(&self, request: &TransferRequest)
        -> Result<UnsignedTransfer, ChainError>;

    async fn broadcast(&self, signed: &SignedTransfer) -> Result<BroadcastReceipt, ChainError>;

    /// Whether the full node has the transaction, solidified or not
    async fn transaction_known(&self, tx_id: &str) -> Result<bool, ChainError>;
}

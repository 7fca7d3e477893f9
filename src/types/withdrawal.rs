//! Withdrawal Types
//!
//! pending → processing → broadcasted | failed
//!
//! `processing` marks a claimed row. It goes back to `pending` only through
//! startup reconciliation, once the chain shows the signed transfer never
//! landed.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::deposit::now_secs;

/// Status of a withdrawal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    /// Waiting for an executor
    #[default]
    Pending,
    /// Claimed by an executor, broadcast outcome not yet recorded
    Processing,
    /// Accepted by the network
    Broadcasted,
    /// Needs an operator
    Failed,
}

impl WithdrawalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Broadcasted | Self::Failed)
    }
}

impl std::fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Broadcasted => "broadcasted",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for WithdrawalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "broadcasted" => Ok(Self::Broadcasted),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown withdrawal status: {}", s)),
        }
    }
}

/// A withdrawal row in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalRecord {
    pub id: String,
    pub user_identity: String,
    /// Human amount; balance was reserved at request time
    pub amount: Decimal,
    pub destination_address: String,
    pub status: WithdrawalStatus,
    /// Set once, together with `broadcasted`
    pub tx_hash: Option<String>,
    pub requested_at: u64,
    pub processed_at: Option<u64>,

    // Executor bookkeeping
    /// Token of the executor pass that owns the claim
    pub claim_token: Option<String>,
    pub claimed_at: Option<u64>,
    /// Id of the signed transaction, persisted before broadcast
    pub signed_tx_id: Option<String>,
    /// Unix seconds after which the signed transaction can no longer land
    pub signed_expires_at: Option<u64>,
    /// Transient failures so far
    pub attempts: u32,
    pub error: Option<String>,
}

impl WithdrawalRecord {
    /// Create a new pending withdrawal
    pub fn new(user_identity: String, amount: Decimal, destination_address: String) -> Self {
        let now = now_secs();
        let id = format!("wd_{}_{:08x}", now, rand::random::<u32>());

        Self {
            id,
            user_identity,
            amount,
            destination_address,
            status: WithdrawalStatus::Pending,
            tx_hash: None,
            requested_at: now,
            processed_at: None,
            claim_token: None,
            claimed_at: None,
            signed_tx_id: None,
            signed_expires_at: None,
            attempts: 0,
            error: None,
        }
    }

    /// Whether a `processing` claim has outlived its lease
    pub fn claim_expired(&self, now: u64, lease_secs: u64) -> bool {
        self.status == WithdrawalStatus::Processing
            && self
                .claimed_at
                .map_or(true, |at| now.saturating_sub(at) >= lease_secs)
    }
}

//! Deposit Types
//!
//! Transfers observed on chain and the ledger rows they produce:
//! pending → completed

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Identity credited when a deposit cannot be attributed to a user
pub const UNASSIGNED_USER: &str = "unassigned";

/// Current unix time in seconds
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// A TRC20 transfer as reported by the indexer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub tx_id: String,
    pub from_address: String,
    pub to_address: String,
    pub token_contract: String,
    /// Base-unit amount as the decimal string the indexer returns
    pub raw_amount: String,
    /// Milliseconds since epoch
    pub block_timestamp: u64,
}

impl TransferEvent {
    /// Whether this transfer pays `contract` tokens into `watched`
    pub fn is_incoming(&self, watched: &str, contract: &str) -> bool {
        self.to_address.eq_ignore_ascii_case(watched)
            && self.token_contract.eq_ignore_ascii_case(contract)
    }
}

/// Status of a deposit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    /// Recorded, waiting for confirmations or approval
    #[default]
    Pending,
    /// Credited to the user's balance
    Completed,
}

impl std::fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for DepositStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("unknown deposit status: {}", s)),
        }
    }
}

/// A deposit row in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositRecord {
    /// Unique deposit ID
    pub id: String,
    /// On-chain transaction id, unique across deposits
    pub tx_hash: String,
    /// Credited identity, [`UNASSIGNED_USER`] when unknown
    pub user_identity: String,
    /// Human amount, frozen at insertion
    pub amount: Decimal,
    /// Same amount in token base units
    pub amount_units: u128,
    pub from_address: String,
    pub status: DepositStatus,
    pub confirmation_count: u32,
    pub required_confirmations: u32,
    /// Chain timestamp of the transfer (ms)
    pub block_timestamp: u64,
    pub created_at: u64,
    pub settled_at: Option<u64>,
}

impl DepositRecord {
    /// Create a new pending deposit for an unassigned transfer
    pub fn new(
        event: &TransferEvent,
        amount: Decimal,
        amount_units: u128,
        confirmation_count: u32,
        required_confirmations: u32,
    ) -> Self {
        let now = now_secs();
        let id = format!("dep_{}_{:08x}", now, rand::random::<u32>());

        Self {
            id,
            tx_hash: event.tx_id.clone(),
            user_identity: UNASSIGNED_USER.to_string(),
            amount,
            amount_units,
            from_address: event.from_address.clone(),
            status: DepositStatus::Pending,
            confirmation_count,
            required_confirmations,
            block_timestamp: event.block_timestamp,
            created_at: now,
            settled_at: None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmation_count >= self.required_confirmations
    }

    pub fn is_completed(&self) -> bool {
        self.status == DepositStatus::Completed
    }
}

//! In-crate fake chain shared by scenario tests

use async_trait::async_trait;
use prost::Message;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::chain::transaction::{
    AnyParameter, Contract, RawTransaction, TriggerSmartContract, TRANSFER_METHOD_ID,
    TRIGGER_SMART_CONTRACT, TRIGGER_TYPE_URL,
};
use crate::chain::{
    address, BroadcastReceipt, ChainError, ChainReader, ConfirmationOracle, SignedTransfer,
    SingleKeySigner, TransferBroadcaster, TransferRequest, TransferSigner, UnsignedTransfer,
};
use crate::common::config::test_config;
use crate::deposit::DepositReconciler;
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::storage::SqliteLedger;
use crate::types::{now_secs, TransferEvent};
use crate::withdrawal::WithdrawalExecutor;

/// Custodial key used across tests
pub const TEST_KEY: &str = "0x0707070707070707070707070707070707070707070707070707070707070707";

/// How the fake node answers broadcasts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BroadcastMode {
    #[default]
    Accept,
    /// Node already has the transaction
    Duplicate,
    /// Node refuses the transaction
    Reject,
    /// Connection drops; nothing lands
    Unreachable,
    /// Connection drops after the node accepted it
    LostResponse,
}

#[derive(Default)]
struct FakeState {
    transfers: Vec<TransferEvent>,
    confirmations: HashMap<String, u32>,
    fetch_failures: u32,
    oracle_down: bool,
    build_failures: u32,
    builds: u32,
    /// Unix ms stamped on built transactions; `None` means a minute from now
    build_expiration_ms: Option<i64>,
    broadcast_mode: BroadcastMode,
    broadcasts: Vec<String>,
}

/// Scriptable stand-in for the indexer and node
#[derive(Default)]
pub struct FakeChain {
    state: Mutex<FakeState>,
}

impl FakeChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Newest transfers go first, like the indexer
    pub fn push_transfer(&self, event: TransferEvent) {
        self.state().transfers.insert(0, event);
    }

    pub fn set_confirmations(&self, tx_id: &str, confirmations: u32) {
        self.state()
            .confirmations
            .insert(tx_id.to_string(), confirmations);
    }

    pub fn fail_next_fetches(&self, n: u32) {
        self.state().fetch_failures = n;
    }

    pub fn set_oracle_down(&self, down: bool) {
        self.state().oracle_down = down;
    }

    pub fn fail_next_builds(&self, n: u32) {
        self.state().build_failures = n;
    }

    /// Stamp every later build with this expiration
    pub fn set_build_expiration(&self, unix_secs: u64) {
        self.state().build_expiration_ms = Some(unix_secs as i64 * 1000);
    }

    pub fn set_broadcast_mode(&self, mode: BroadcastMode) {
        self.state().broadcast_mode = mode;
    }

    /// Distinct transaction ids the node accepted, in order
    pub fn broadcasts(&self) -> Vec<String> {
        self.state().broadcasts.clone()
    }

    pub fn builds(&self) -> u32 {
        self.state().builds
    }
}

#[async_trait]
impl ChainReader for FakeChain {
    async fn fetch_recent_transfers(
        &self,
        _watched_address: &str,
        _token_contract: &str,
        limit: u32,
    ) -> Result<Vec<TransferEvent>, ChainError> {
        let mut state = self.state();
        if state.fetch_failures > 0 {
            state.fetch_failures -= 1;
            return Err(ChainError::Http("connection reset by peer".into()));
        }
        Ok(state.transfers.iter().take(limit as usize).cloned().collect())
    }
}

#[async_trait]
impl ConfirmationOracle for FakeChain {
    async fn confirmations(&self, tx_id: &str) -> Result<Option<u32>, ChainError> {
        let state = self.state();
        if state.oracle_down {
            return Err(ChainError::Status {
                status: 503,
                body: "service unavailable".into(),
            });
        }
        Ok(state.confirmations.get(tx_id).copied())
    }
}

#[async_trait]
impl TransferBroadcaster for FakeChain {
    async fn build_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<UnsignedTransfer, ChainError> {
        let (builds, expiration_ms) = {
            let mut state = self.state();
            if state.build_failures > 0 {
                state.build_failures -= 1;
                return Err(ChainError::Http("timed out".into()));
            }
            state.builds += 1;
            let expiration_ms = state
                .build_expiration_ms
                .unwrap_or((now_secs() as i64 + 60) * 1000);
            (state.builds, expiration_ms)
        };

        let raw = raw_transfer(request, expiration_ms, builds as i64);
        Ok(unsigned_transfer(&hex::encode(raw)))
    }

    async fn broadcast(&self, signed: &SignedTransfer) -> Result<BroadcastReceipt, ChainError> {
        // let concurrent executors interleave
        tokio::task::yield_now().await;

        let mut state = self.state();
        let mode = state.broadcast_mode;
        let landed = matches!(mode, BroadcastMode::Accept | BroadcastMode::LostResponse);
        if landed && !state.broadcasts.contains(&signed.tx_id) {
            state.broadcasts.push(signed.tx_id.clone());
            state.confirmations.entry(signed.tx_id.clone()).or_insert(0);
        }

        match mode {
            BroadcastMode::Accept => Ok(BroadcastReceipt {
                tx_id: signed.tx_id.clone(),
                duplicate: false,
            }),
            BroadcastMode::Duplicate => Ok(BroadcastReceipt {
                tx_id: signed.tx_id.clone(),
                duplicate: true,
            }),
            BroadcastMode::Reject => Err(ChainError::Rejected {
                code: "CONTRACT_VALIDATE_ERROR".into(),
                message: "balance is not sufficient".into(),
            }),
            BroadcastMode::Unreachable | BroadcastMode::LostResponse => {
                Err(ChainError::Http("connection reset by peer".into()))
            }
        }
    }

    async fn transaction_known(&self, tx_id: &str) -> Result<bool, ChainError> {
        Ok(self.state().broadcasts.iter().any(|id| id == tx_id))
    }
}

/// Address controlled by [`TEST_KEY`]
pub fn test_address() -> String {
    SingleKeySigner::from_hex(TEST_KEY).unwrap().address()
}

/// A USDT transfer of `amount_units` from the test address
pub fn transfer_request(amount_units: u128) -> TransferRequest {
    let config = test_config();
    TransferRequest {
        owner_address: config.watched_address,
        token_contract: config.token_contract,
        destination: "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t".to_string(),
        amount_units,
        fee_limit_sun: config.fee_limit_sun,
    }
}

/// Protobuf `Transaction.raw` for `request`, as a node would build it
pub fn raw_transfer(request: &TransferRequest, expiration_ms: i64, timestamp: i64) -> Vec<u8> {
    let destination = address::decode_base58(&request.destination).unwrap();
    let mut data = TRANSFER_METHOD_ID.to_vec();
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(&destination[1..]);
    data.extend_from_slice(&[0u8; 16]);
    data.extend_from_slice(&request.amount_units.to_be_bytes());

    let trigger = TriggerSmartContract {
        owner_address: address::decode_base58(&request.owner_address).unwrap().to_vec(),
        contract_address: address::decode_base58(&request.token_contract).unwrap().to_vec(),
        data,
        ..Default::default()
    };
    RawTransaction {
        ref_block_bytes: vec![0x12, 0x34],
        ref_block_hash: vec![0xab; 8],
        expiration: expiration_ms,
        contract: vec![Contract {
            kind: TRIGGER_SMART_CONTRACT,
            parameter: Some(AnyParameter {
                type_url: TRIGGER_TYPE_URL.to_string(),
                value: trigger.encode_to_vec(),
            }),
            permission_id: 0,
        }],
        timestamp,
        fee_limit: request.fee_limit_sun as i64,
        ..Default::default()
    }
    .encode_to_vec()
}

/// A node-built transfer whose `txID` matches its raw data
pub fn unsigned_transfer(raw_data_hex: &str) -> UnsignedTransfer {
    let raw = hex::decode(raw_data_hex).unwrap();
    let tx_id = hex::encode(Sha256::digest(&raw));
    UnsignedTransfer {
        tx_id: tx_id.clone(),
        raw_data_hex: raw_data_hex.to_string(),
        payload: serde_json::json!({
            "txID": tx_id,
            "raw_data": {"contract": []},
            "raw_data_hex": raw_data_hex,
            "visible": true,
        }),
    }
}

/// A transfer with placeholder addresses
pub fn transfer(tx_id: &str, raw_amount: &str) -> TransferEvent {
    TransferEvent {
        tx_id: tx_id.to_string(),
        from_address: "TSender".to_string(),
        to_address: "TWatched".to_string(),
        token_contract: "TContract".to_string(),
        raw_amount: raw_amount.to_string(),
        block_timestamp: 1_700_000_000_000,
    }
}

/// A transfer of the configured token into the configured address
pub fn relevant_transfer(tx_id: &str, raw_amount: &str) -> TransferEvent {
    let config = test_config();
    TransferEvent {
        to_address: config.watched_address,
        token_contract: config.token_contract,
        ..transfer(tx_id, raw_amount)
    }
}

/// Both pipelines over the fake chain, withdrawals enabled
pub fn scheduler(chain: &Arc<FakeChain>, ledger: &Arc<SqliteLedger>) -> Scheduler {
    let config = test_config();
    let reconciler = DepositReconciler::new(
        config.reconciler(),
        chain.clone(),
        chain.clone(),
        ledger.clone(),
        RetryPolicy::immediate(2),
    );
    let executor = WithdrawalExecutor::new(
        config.executor(),
        chain.clone(),
        chain.clone(),
        Arc::new(SingleKeySigner::from_hex(TEST_KEY).unwrap()),
        ledger.clone(),
        RetryPolicy::immediate(2),
    );
    Scheduler::new(reconciler, Some(executor), std::time::Duration::from_secs(3600))
}

//! TRON Transaction Raw Data
//!
//! What the custodial key signs is sha256 of the protobuf `Transaction.raw`,
//! so the node-built bytes are decoded here and compared with the transfer
//! the executor asked for. Only the fields a TRC20 transfer touches are
//! declared; prost skips the rest.

use prost::Message;
use thiserror::Error;

use super::address::{self, ADDRESS_LEN, ADDRESS_PREFIX};
use super::TransferRequest;

/// `ContractType.TriggerSmartContract`
pub const TRIGGER_SMART_CONTRACT: i32 = 31;

pub const TRIGGER_TYPE_URL: &str = "type.googleapis.com/protocol.TriggerSmartContract";

/// First four bytes of keccak256("transfer(address,uint256)")
pub const TRANSFER_METHOD_ID: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

/// Raw data decoding and comparison errors
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("undecodable raw data: {0}")]
    Decode(String),

    #[error("not a TRC20 transfer: {0}")]
    Unexpected(String),

    #[error("built {field} is {built}, requested {requested}")]
    Mismatch {
        field: &'static str,
        built: String,
        requested: String,
    },
}

/// `protocol.Transaction.raw`
#[derive(Clone, PartialEq, Message)]
pub struct RawTransaction {
    #[prost(bytes = "vec", tag = "1")]
    pub ref_block_bytes: Vec<u8>,
    #[prost(int64, tag = "3")]
    pub ref_block_num: i64,
    #[prost(bytes = "vec", tag = "4")]
    pub ref_block_hash: Vec<u8>,
    /// Unix milliseconds after which no block may include the transaction
    #[prost(int64, tag = "8")]
    pub expiration: i64,
    #[prost(message, repeated, tag = "11")]
    pub contract: Vec<Contract>,
    #[prost(int64, tag = "14")]
    pub timestamp: i64,
    #[prost(int64, tag = "18")]
    pub fee_limit: i64,
}

/// `protocol.Transaction.Contract`
#[derive(Clone, PartialEq, Message)]
pub struct Contract {
    #[prost(int32, tag = "1")]
    pub kind: i32,
    #[prost(message, optional, tag = "2")]
    pub parameter: Option<AnyParameter>,
    #[prost(int32, tag = "5")]
    pub permission_id: i32,
}

/// `google.protobuf.Any`
#[derive(Clone, PartialEq, Message)]
pub struct AnyParameter {
    #[prost(string, tag = "1")]
    pub type_url: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// `protocol.TriggerSmartContract`
#[derive(Clone, PartialEq, Message)]
pub struct TriggerSmartContract {
    #[prost(bytes = "vec", tag = "1")]
    pub owner_address: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub contract_address: Vec<u8>,
    #[prost(int64, tag = "3")]
    pub call_value: i64,
    #[prost(bytes = "vec", tag = "4")]
    pub data: Vec<u8>,
    #[prost(int64, tag = "5")]
    pub call_token_value: i64,
    #[prost(int64, tag = "6")]
    pub token_id: i64,
}

/// The transfer a node-built transaction would actually perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTransfer {
    pub owner_address: String,
    pub token_contract: String,
    pub destination: String,
    pub amount_units: u128,
    pub fee_limit_sun: u64,
    /// Unix seconds
    pub expires_at: u64,
}

impl DecodedTransfer {
    /// Decode `raw_data_hex` as a single TRC20 `transfer` call
    pub fn from_raw_hex(raw_data_hex: &str) -> Result<Self, TransactionError> {
        let bytes = hex::decode(raw_data_hex)
            .map_err(|e| TransactionError::Decode(format!("raw_data_hex: {}", e)))?;
        let raw = RawTransaction::decode(bytes.as_slice())
            .map_err(|e| TransactionError::Decode(e.to_string()))?;

        let [contract] = raw.contract.as_slice() else {
            return Err(TransactionError::Unexpected(format!(
                "{} contracts",
                raw.contract.len()
            )));
        };
        if contract.kind != TRIGGER_SMART_CONTRACT || contract.permission_id != 0 {
            return Err(TransactionError::Unexpected(format!(
                "contract type {} permission {}",
                contract.kind, contract.permission_id
            )));
        }
        let parameter = contract
            .parameter
            .as_ref()
            .filter(|p| p.type_url == TRIGGER_TYPE_URL)
            .ok_or_else(|| TransactionError::Unexpected("missing trigger parameter".into()))?;
        let trigger = TriggerSmartContract::decode(parameter.value.as_slice())
            .map_err(|e| TransactionError::Decode(e.to_string()))?;

        if trigger.call_value != 0 || trigger.call_token_value != 0 {
            return Err(TransactionError::Unexpected("transfer carries TRX value".into()));
        }
        let (destination, amount_units) = decode_transfer_call(&trigger.data)?;

        Ok(Self {
            owner_address: account(&trigger.owner_address)?,
            token_contract: account(&trigger.contract_address)?,
            destination,
            amount_units,
            fee_limit_sun: non_negative("fee_limit", raw.fee_limit)?,
            expires_at: non_negative("expiration", raw.expiration)? / 1000,
        })
    }

    /// Refuse anything that differs from what was requested
    pub fn ensure_matches(&self, request: &TransferRequest) -> Result<(), TransactionError> {
        let checks = [
            ("owner", self.owner_address.clone(), request.owner_address.clone()),
            ("token contract", self.token_contract.clone(), request.token_contract.clone()),
            ("destination", self.destination.clone(), request.destination.clone()),
            ("amount", self.amount_units.to_string(), request.amount_units.to_string()),
            ("fee limit", self.fee_limit_sun.to_string(), request.fee_limit_sun.to_string()),
        ];
        for (field, built, requested) in checks {
            if built != requested.trim() {
                return Err(TransactionError::Mismatch {
                    field,
                    built,
                    requested,
                });
            }
        }
        Ok(())
    }
}

/// `a9059cbb || address (32) || uint256 (32)`
fn decode_transfer_call(data: &[u8]) -> Result<(String, u128), TransactionError> {
    if data.len() != 4 + 64 || data[..4] != TRANSFER_METHOD_ID {
        return Err(TransactionError::Unexpected(format!(
            "call data {}",
            hex::encode(data)
        )));
    }
    let (address_word, amount_word) = data[4..].split_at(32);
    if address_word[..12].iter().any(|b| *b != 0) || amount_word[..16].iter().any(|b| *b != 0) {
        return Err(TransactionError::Unexpected("oversized ABI word".into()));
    }

    let mut raw = [0u8; ADDRESS_LEN];
    raw[0] = ADDRESS_PREFIX;
    raw[1..].copy_from_slice(&address_word[12..]);

    let mut amount = [0u8; 16];
    amount.copy_from_slice(&amount_word[16..]);
    Ok((address::encode_base58(&raw), u128::from_be_bytes(amount)))
}

fn account(bytes: &[u8]) -> Result<String, TransactionError> {
    let raw: [u8; ADDRESS_LEN] = bytes
        .try_into()
        .ok()
        .filter(|raw: &[u8; ADDRESS_LEN]| raw[0] == ADDRESS_PREFIX)
        .ok_or_else(|| TransactionError::Unexpected(format!("address {}", hex::encode(bytes))))?;
    Ok(address::encode_base58(&raw))
}

fn non_negative(field: &str, value: i64) -> Result<u64, TransactionError> {
    u64::try_from(value)
        .map_err(|_| TransactionError::Unexpected(format!("negative {}", field)))
}

//! TronGrid HTTP Client
//!
//! Implements [`ChainReader`], [`ConfirmationOracle`] and
//! [`TransferBroadcaster`] against the TronGrid REST API. Confirmations are
//! read from the solidity (irreversible) node.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::address;
use super::{
    BroadcastReceipt, ChainError, ChainReader, ConfirmationOracle, SignedTransfer,
    TransferBroadcaster, TransferRequest, UnsignedTransfer,
};
use crate::common::GatewayConfig;
use crate::types::TransferEvent;

/// Node answer for a transaction it has already seen
const DUPLICATE_TX: &str = "DUP_TRANSACTION_ERROR";

/// Broadcast codes that say nothing about the transaction itself
const BUSY_CODES: [&str; 3] = ["SERVER_BUSY", "NO_CONNECTION", "NOT_ENOUGH_EFFECTIVE_CONNECTION"];

const TRANSFER_SELECTOR: &str = "transfer(address,uint256)";

/// TronGrid HTTP client
#[derive(Debug, Clone)]
pub struct TronGridClient {
    client: Client,
    base_url: String,
}

impl TronGridClient {
    /// Create a client with an optional API key and a per-request timeout
    pub fn new(base_url: &str, api_key: Option<&str>, timeout: Duration) -> Result<Self, ChainError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key {
            let value = HeaderValue::from_str(key)
                .map_err(|e| ChainError::Http(format!("invalid API key header: {}", e)))?;
            headers.insert("tron-pro-api-key", value);
        }

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, ChainError> {
        Self::new(
            &config.api_url,
            config.api_key.as_deref(),
            config.request_timeout,
        )
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, ChainError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).query(query).send().await?;
        Self::read_json(resp).await
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, ChainError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.post(&url).json(body).send().await?;
        Self::read_json(resp).await
    }

    async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ChainError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChainError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| ChainError::Parse(e.to_string()))
    }

    /// Latest solidified block number
    pub async fn current_block(&self) -> Result<u64, ChainError> {
        let block: NowBlock = self.post_json("/walletsolidity/getnowblock", &json!({})).await?;
        Ok(block.block_header.raw_data.number)
    }

    /// Block a transaction was included in, if the chain knows it
    pub async fn transaction_block(&self, tx_id: &str) -> Result<Option<u64>, ChainError> {
        let info: TxInfo = self
            .post_json(
                "/walletsolidity/gettransactioninfobyid",
                &json!({ "value": tx_id }),
            )
            .await?;
        Ok(info.block_number)
    }
}

#[async_trait]
impl ChainReader for TronGridClient {
    async fn fetch_recent_transfers(
        &self,
        watched_address: &str,
        token_contract: &str,
        limit: u32,
    ) -> Result<Vec<TransferEvent>, ChainError> {
        let path = format!("/v1/accounts/{}/transactions/trc20", watched_address);
        let query = [
            ("limit", limit.to_string()),
            ("order_by", "block_timestamp,desc".to_string()),
            ("contract_address", token_contract.to_string()),
        ];
        let page: Trc20Page = self.get_json(&path, &query).await?;
        transfers_from_page(page)
    }
}

#[async_trait]
impl ConfirmationOracle for TronGridClient {
    async fn confirmations(&self, tx_id: &str) -> Result<Option<u32>, ChainError> {
        let Some(block) = self.transaction_block(tx_id).await? else {
            return Ok(None);
        };
        let head = self.current_block().await?;
        Ok(Some(confirmations_between(head, block)))
    }
}

#[async_trait]
impl TransferBroadcaster for TronGridClient {
    async fn build_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<UnsignedTransfer, ChainError> {
        let parameter = address::encode_transfer_params(&request.destination, request.amount_units)?;
        let body = json!({
            "owner_address": request.owner_address,
            "contract_address": request.token_contract,
            "function_selector": TRANSFER_SELECTOR,
            "parameter": parameter,
            "fee_limit": request.fee_limit_sun,
            "call_value": 0,
            "visible": true,
        });

        let resp: TriggerResponse = self.post_json("/wallet/triggersmartcontract", &body).await?;
        unsigned_from_trigger(resp)
    }

    async fn broadcast(&self, signed: &SignedTransfer) -> Result<BroadcastReceipt, ChainError> {
        let resp: BroadcastResponse = self
            .post_json("/wallet/broadcasttransaction", &signed.payload)
            .await?;
        receipt_from_broadcast(&signed.tx_id, resp)
    }

    async fn transaction_known(&self, tx_id: &str) -> Result<bool, ChainError> {
        let tx: Value = self
            .post_json("/wallet/gettransactionbyid", &json!({ "value": tx_id }))
            .await?;
        Ok(tx.get("txID").and_then(Value::as_str).is_some())
    }
}

/// Solidified depth of `block` below `head`
fn confirmations_between(head: u64, block: u64) -> u32 {
    u32::try_from(head.saturating_sub(block)).unwrap_or(u32::MAX)
}

fn transfers_from_page(page: Trc20Page) -> Result<Vec<TransferEvent>, ChainError> {
    if !page.success {
        return Err(ChainError::Parse("indexer reported success=false".to_string()));
    }
    Ok(page
        .data
        .into_iter()
        .map(|t| TransferEvent {
            tx_id: t.transaction_id,
            from_address: t.from,
            to_address: t.to,
            token_contract: t.token_info.address,
            raw_amount: t.value,
            block_timestamp: t.block_timestamp,
        })
        .collect())
}

fn unsigned_from_trigger(resp: TriggerResponse) -> Result<UnsignedTransfer, ChainError> {
    if !resp.result.result {
        return Err(ChainError::Build(format!(
            "{}: {}",
            resp.result.code.unwrap_or_default(),
            decode_node_message(resp.result.message.as_deref())
        )));
    }

    let payload = resp
        .transaction
        .ok_or_else(|| ChainError::BuildIntegrity("node returned no transaction".to_string()))?;

    let field = |name: &str| {
        payload
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ChainError::BuildIntegrity(format!("transaction has no {}", name)))
    };
    let tx_id = field("txID")?;
    let raw_data_hex = field("raw_data_hex")?;

    Ok(UnsignedTransfer {
        tx_id,
        raw_data_hex,
        payload,
    })
}

fn receipt_from_broadcast(
    tx_id: &str,
    resp: BroadcastResponse,
) -> Result<BroadcastReceipt, ChainError> {
    if resp.result {
        return Ok(BroadcastReceipt {
            tx_id: resp.txid.unwrap_or_else(|| tx_id.to_string()),
            duplicate: false,
        });
    }

    let code = resp.code.unwrap_or_else(|| "UNKNOWN".to_string());
    if code == DUPLICATE_TX {
        return Ok(BroadcastReceipt {
            tx_id: tx_id.to_string(),
            duplicate: true,
        });
    }

    let message = decode_node_message(resp.message.as_deref());
    if BUSY_CODES.contains(&code.as_str()) {
        return Err(ChainError::NodeBusy { code, message });
    }
    Err(ChainError::Rejected { code, message })
}

/// Node error messages come back hex encoded
fn decode_node_message(message: Option<&str>) -> String {
    match message {
        None => String::new(),
        Some(m) => hex::decode(m)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_else(|| m.to_string()),
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct Trc20Page {
    #[serde(default)]
    data: Vec<Trc20Transfer>,
    #[serde(default = "default_true")]
    success: bool,
}

#[derive(Debug, Deserialize)]
struct Trc20Transfer {
    transaction_id: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    token_info: TokenInfo,
    #[serde(default)]
    value: String,
    #[serde(default)]
    block_timestamp: u64,
}

#[derive(Debug, Default, Deserialize)]
struct TokenInfo {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
struct TxInfo {
    #[serde(rename = "blockNumber")]
    block_number: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct NowBlock {
    block_header: BlockHeader,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    raw_data: BlockRaw,
}

#[derive(Debug, Deserialize)]
struct BlockRaw {
    #[serde(default)]
    number: u64,
}

#[derive(Debug, Deserialize)]
struct TriggerResponse {
    #[serde(default)]
    result: TriggerResult,
    transaction: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct TriggerResult {
    #[serde(default)]
    result: bool,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BroadcastResponse {
    #[serde(default)]
    result: bool,
    txid: Option<String>,
    code: Option<String>,
    message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_trims_base_url() {
        let client =
            TronGridClient::new("https://api.trongrid.io/", Some("key"), Duration::from_secs(10))
                .unwrap();
        assert_eq!(client.base_url(), "https://api.trongrid.io");
    }

    #[test]
    fn test_parse_transfer_page() {
        let page: Trc20Page = serde_json::from_value(json!({
            "data": [{
                "transaction_id": "abc",
                "token_info": {"symbol": "USDT", "address": "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t", "decimals": 6},
                "block_timestamp": 1700000000000u64,
                "from": "TSender",
                "to": "TWatched",
                "type": "Transfer",
                "value": "50000000"
            }],
            "success": true,
            "meta": {"at": 1700000000500u64, "page_size": 1}
        }))
        .unwrap();

        let transfers = transfers_from_page(page).unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].tx_id, "abc");
        assert_eq!(transfers[0].raw_amount, "50000000");
        assert_eq!(transfers[0].token_contract, "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t");
    }

    #[test]
    fn test_unsuccessful_page_is_an_error() {
        let page: Trc20Page = serde_json::from_value(json!({"success": false})).unwrap();
        assert!(transfers_from_page(page).unwrap_err().is_transient());
    }

    #[test]
    fn test_unknown_transaction_info() {
        let info: TxInfo = serde_json::from_value(json!({})).unwrap();
        assert!(info.block_number.is_none());

        let info: TxInfo = serde_json::from_value(json!({"id": "abc", "blockNumber": 100})).unwrap();
        assert_eq!(info.block_number, Some(100));
    }

    #[test]
    fn test_confirmation_depth() {
        assert_eq!(confirmations_between(110, 100), 10);
        assert_eq!(confirmations_between(100, 100), 0);
        assert_eq!(confirmations_between(90, 100), 0);
    }

    #[test]
    fn test_trigger_response_parsing() {
        let resp: TriggerResponse = serde_json::from_value(json!({
            "result": {"result": true},
            "transaction": {"txID": "ff00", "raw_data": {}, "raw_data_hex": "0a02"}
        }))
        .unwrap();
        let unsigned = unsigned_from_trigger(resp).unwrap();
        assert_eq!(unsigned.tx_id, "ff00");
        assert_eq!(unsigned.raw_data_hex, "0a02");

        let resp: TriggerResponse = serde_json::from_value(json!({
            "result": {"code": "CONTRACT_VALIDATE_ERROR", "message": hex::encode("balance is not sufficient")}
        }))
        .unwrap();
        let err = unsigned_from_trigger(resp).unwrap_err();
        assert!(err.to_string().contains("balance is not sufficient"));

        let resp: TriggerResponse = serde_json::from_value(json!({
            "result": {"result": true},
            "transaction": {"raw_data": {}}
        }))
        .unwrap();
        assert!(matches!(
            unsigned_from_trigger(resp),
            Err(ChainError::BuildIntegrity(_))
        ));
    }

    #[test]
    fn test_broadcast_outcomes() {
        let ok: BroadcastResponse =
            serde_json::from_value(json!({"result": true, "txid": "abc"})).unwrap();
        assert_eq!(
            receipt_from_broadcast("abc", ok).unwrap(),
            BroadcastReceipt { tx_id: "abc".into(), duplicate: false }
        );

        let dup: BroadcastResponse =
            serde_json::from_value(json!({"code": "DUP_TRANSACTION_ERROR"})).unwrap();
        assert!(receipt_from_broadcast("abc", dup).unwrap().duplicate);

        let rejected: BroadcastResponse = serde_json::from_value(json!({
            "code": "SIGERROR",
            "message": hex::encode("validate signature error")
        }))
        .unwrap();
        match receipt_from_broadcast("abc", rejected) {
            Err(ChainError::Rejected { code, message }) => {
                assert_eq!(code, "SIGERROR");
                assert_eq!(message, "validate signature error");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_busy_node_is_not_a_rejection() {
        for code in BUSY_CODES {
            let busy: BroadcastResponse = serde_json::from_value(json!({
                "result": false,
                "code": code,
                "message": hex::encode("Server busy, please try again later")
            }))
            .unwrap();
            let err = receipt_from_broadcast("abc", busy).unwrap_err();
            assert!(matches!(err, ChainError::NodeBusy { .. }), "{}", code);
            assert!(err.is_transient());
        }
    }
}

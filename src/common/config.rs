//! Environment-based Configuration for the TRC20 Gateway
//!
//! Values come from the process environment, optionally seeded from a
//! `.env` file. Secrets (API key, custodial key) are never given defaults.
//!
//! # Environment Variables
//!
//! ## Network
//! - `TRON_NETWORK` - "mainnet", "shasta" or "nile" (default: "mainnet")
//! - `TRON_API_URL` - indexing API base URL (default per network)
//! - `TRONGRID_API_KEY` - sent as `TRON-PRO-API-KEY`
//! - `REQUEST_TIMEOUT_SECS` - per-request timeout (default: 10)
//! - `MAX_RETRIES`, `RETRY_BASE_DELAY_MS` - retry policy (default: 3, 500)
//!
//! ## Deposits
//! - `TRON_MAIN_WALLET_ADDRESS` - watched address (required)
//! - `TRC20_CONTRACT_ADDRESS` - token contract (default: USDT)
//! - `TRC20_DECIMALS` - token decimals (default: 6)
//! - `MIN_DEPOSIT_AMOUNT`, `MAX_DEPOSIT_AMOUNT` - bounds (default: 10, 200000)
//! - `MIN_CONFIRMATIONS` - required confirmations (default: 1)
//! - `TRANSFER_FETCH_LIMIT` - transfers per poll (default: 50)
//! - `CREDIT_POLICY` - "automatic" or "manual" (default: "automatic")
//!
//! ## Withdrawals
//! - `TRON_MAIN_WALLET_PRIVATE_KEY` - hex custodial key (withdrawals disabled without it)
//! - `WITHDRAWAL_FEE_LIMIT_SUN` - fee ceiling (default: 50 TRX)
//! - `WITHDRAWAL_CLAIM_LEASE_SECS` - stale claim lease (default: 300, minimum: 120)
//! - `MAX_WITHDRAWAL_ATTEMPTS` - transient attempts before failing (default: 5)
//!
//! ## Service
//! - `MONITORING_INTERVAL` - seconds between cycles (default: 30)
//! - `LEDGER_DB_PATH` - SQLite file (default: "data/ledger.db")
//! - `API_PORT` - enables the HTTP health surface
//! - `LOG_LEVEL`, `LOG_JSON` - logging (default: "info", false)

use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::chain::{SingleKeySigner, TransferSigner, SOLIDIFICATION_MARGIN};
use crate::retry::RetryPolicy;
use crate::types::to_base_units;

/// Tether USD on TRON mainnet
pub const USDT_MAINNET_CONTRACT: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";

/// 50 TRX, in sun
pub const DEFAULT_FEE_LIMIT_SUN: u64 = 50_000_000;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("custodial key controls {derived}, but the watched address is {configured}")]
    KeyAddressMismatch { derived: String, configured: String },
}

/// TRON network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Shasta,
    Nile,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "shasta" | "testnet" => Ok(Network::Shasta),
            "nile" => Ok(Network::Nile),
            _ => Err(ConfigError::InvalidValue(
                "TRON_NETWORK".to_string(),
                format!("unknown network: {}", s),
            )),
        }
    }
}

impl Network {
    /// Default TronGrid endpoint for this network
    pub fn default_api_url(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://api.trongrid.io",
            Network::Shasta => "https://api.shasta.trongrid.io",
            Network::Nile => "https://nile.trongrid.io",
        }
    }
}

/// When a confirmed deposit gets credited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreditPolicy {
    /// Settle as soon as the confirmation threshold is met
    #[default]
    Automatic,
    /// Record and refresh, settle only on operator approval
    Manual,
}

impl FromStr for CreditPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "automatic" | "auto" => Ok(CreditPolicy::Automatic),
            "manual" => Ok(CreditPolicy::Manual),
            _ => Err(ConfigError::InvalidValue(
                "CREDIT_POLICY".to_string(),
                format!("unknown policy: {} (use 'automatic' or 'manual')", s),
            )),
        }
    }
}

/// Deposit reconciler settings
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub watched_address: String,
    pub token_contract: String,
    pub token_decimals: u32,
    pub min_deposit: Decimal,
    pub max_deposit: Decimal,
    pub required_confirmations: u32,
    pub fetch_limit: u32,
    pub credit_policy: CreditPolicy,
}

/// Withdrawal executor settings
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Custodial address that sends withdrawals
    pub owner_address: String,
    pub token_contract: String,
    pub token_decimals: u32,
    /// Fee ceiling in sun
    pub fee_limit_sun: u64,
    /// Age after which a `processing` claim is reconciled
    pub claim_lease: Duration,
    pub max_attempts: u32,
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub network: Network,
    pub api_url: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,

    pub watched_address: String,
    pub token_contract: String,
    pub token_decimals: u32,
    pub min_deposit: Decimal,
    pub max_deposit: Decimal,
    pub required_confirmations: u32,
    pub fetch_limit: u32,
    pub credit_policy: CreditPolicy,

    /// Hex-encoded custodial key
    pub signing_key: Option<String>,
    pub fee_limit_sun: u64,
    pub claim_lease: Duration,
    pub max_withdrawal_attempts: u32,

    pub poll_interval: Duration,
    pub database_path: String,
    pub api_port: Option<u16>,
    pub log_level: String,
    pub log_json: bool,
}

impl GatewayConfig {
    /// Load configuration from environment variables (and `.env` if present)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let network: Network = env::var("TRON_NETWORK")
            .unwrap_or_else(|_| "mainnet".to_string())
            .parse()?;

        let api_url =
            env::var("TRON_API_URL").unwrap_or_else(|_| network.default_api_url().to_string());
        let api_key = env::var("TRONGRID_API_KEY").ok().filter(|k| !k.is_empty());

        let retry = RetryPolicy {
            max_retries: parse_or("MAX_RETRIES", 3)?,
            base_delay: Duration::from_millis(parse_or("RETRY_BASE_DELAY_MS", 500)?),
            max_delay: Duration::from_secs(30),
        };

        let config = Self {
            network,
            api_url,
            api_key,
            request_timeout: Duration::from_secs(parse_or("REQUEST_TIMEOUT_SECS", 10)?),
            retry,
            watched_address: required("TRON_MAIN_WALLET_ADDRESS")?,
            token_contract: env::var("TRC20_CONTRACT_ADDRESS")
                .unwrap_or_else(|_| USDT_MAINNET_CONTRACT.to_string()),
            token_decimals: parse_or("TRC20_DECIMALS", 6)?,
            min_deposit: parse_or("MIN_DEPOSIT_AMOUNT", Decimal::from(10))?,
            max_deposit: parse_or("MAX_DEPOSIT_AMOUNT", Decimal::from(200_000))?,
            required_confirmations: parse_or("MIN_CONFIRMATIONS", 1)?,
            fetch_limit: parse_or("TRANSFER_FETCH_LIMIT", 50)?,
            credit_policy: parse_or("CREDIT_POLICY", CreditPolicy::Automatic)?,
            signing_key: env::var("TRON_MAIN_WALLET_PRIVATE_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            fee_limit_sun: parse_or("WITHDRAWAL_FEE_LIMIT_SUN", DEFAULT_FEE_LIMIT_SUN)?,
            claim_lease: Duration::from_secs(parse_or("WITHDRAWAL_CLAIM_LEASE_SECS", 300)?),
            max_withdrawal_attempts: parse_or("MAX_WITHDRAWAL_ATTEMPTS", 5)?,
            poll_interval: Duration::from_secs(parse_or("MONITORING_INTERVAL", 30)?),
            database_path: env::var("LEDGER_DB_PATH")
                .unwrap_or_else(|_| "data/ledger.db".to_string()),
            api_port: env::var("API_PORT").ok().and_then(|p| p.parse().ok()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_json: env::var("LOG_JSON").map(|v| v == "1" || v == "true").unwrap_or(false),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would make the pipelines misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_deposit <= Decimal::ZERO {
            return Err(ConfigError::InvalidValue(
                "MIN_DEPOSIT_AMOUNT".to_string(),
                "must be positive".to_string(),
            ));
        }
        if self.min_deposit > self.max_deposit {
            return Err(ConfigError::InvalidValue(
                "MAX_DEPOSIT_AMOUNT".to_string(),
                format!("{} is below the minimum {}", self.max_deposit, self.min_deposit),
            ));
        }
        if self.token_decimals > 18 {
            return Err(ConfigError::InvalidValue(
                "TRC20_DECIMALS".to_string(),
                "at most 18 decimals are supported".to_string(),
            ));
        }
        if let Err(e) = to_base_units(self.max_deposit.ceil(), self.token_decimals) {
            return Err(ConfigError::InvalidValue(
                "MAX_DEPOSIT_AMOUNT".to_string(),
                format!("not representable in base units: {}", e),
            ));
        }
        if self.claim_lease < SOLIDIFICATION_MARGIN {
            return Err(ConfigError::InvalidValue(
                "WITHDRAWAL_CLAIM_LEASE_SECS".to_string(),
                format!("must be at least {} seconds", SOLIDIFICATION_MARGIN.as_secs()),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "MONITORING_INTERVAL".to_string(),
                "must be at least one second".to_string(),
            ));
        }
        if self.max_withdrawal_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_WITHDRAWAL_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        if let Some(key) = &self.signing_key {
            let signer = SingleKeySigner::from_hex(key).map_err(|e| {
                ConfigError::InvalidValue("TRON_MAIN_WALLET_PRIVATE_KEY".to_string(), e.to_string())
            })?;
            let derived = signer.address();
            if derived != self.watched_address {
                return Err(ConfigError::KeyAddressMismatch {
                    derived,
                    configured: self.watched_address.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            watched_address: self.watched_address.clone(),
            token_contract: self.token_contract.clone(),
            token_decimals: self.token_decimals,
            min_deposit: self.min_deposit,
            max_deposit: self.max_deposit,
            required_confirmations: self.required_confirmations,
            fetch_limit: self.fetch_limit,
            credit_policy: self.credit_policy,
        }
    }

    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            owner_address: self.watched_address.clone(),
            token_contract: self.token_contract.clone(),
            token_decimals: self.token_decimals,
            fee_limit_sun: self.fee_limit_sun,
            claim_lease: self.claim_lease,
            max_attempts: self.max_withdrawal_attempts,
        }
    }

    /// Log configuration summary (hiding secrets)
    pub fn log_summary(&self) {
        tracing::info!(
            network = ?self.network,
            api_url = %self.api_url,
            api_key = self.api_key.is_some(),
            watched_address = %self.watched_address,
            token_contract = %self.token_contract,
            "gateway configuration"
        );
        tracing::info!(
            min_deposit = %self.min_deposit,
            max_deposit = %self.max_deposit,
            required_confirmations = self.required_confirmations,
            credit_policy = ?self.credit_policy,
            interval_secs = self.poll_interval.as_secs(),
            withdrawals_enabled = self.signing_key.is_some(),
            "deposit limits"
        );
    }
}

fn required(var_name: &str) -> Result<String, ConfigError> {
    env::var(var_name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(var_name.to_string()))
}

fn parse_or<T>(var_name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(var_name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(var_name.to_string(), e.to_string())),
        _ => Ok(default),
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> GatewayConfig {
    GatewayConfig {
        network: Network::Mainnet,
        api_url: "http://localhost:0".to_string(),
        api_key: None,
        request_timeout: Duration::from_secs(1),
        retry: RetryPolicy::immediate(2),
        watched_address: crate::testing::test_address(),
        token_contract: USDT_MAINNET_CONTRACT.to_string(),
        token_decimals: 6,
        min_deposit: Decimal::from(10),
        max_deposit: Decimal::from(200_000),
        required_confirmations: 1,
        fetch_limit: 50,
        credit_policy: CreditPolicy::Automatic,
        signing_key: None,
        fee_limit_sun: DEFAULT_FEE_LIMIT_SUN,
        claim_lease: Duration::from_secs(300),
        max_withdrawal_attempts: 3,
        poll_interval: Duration::from_secs(30),
        database_path: ":memory:".to_string(),
        api_port: None,
        log_level: "debug".to_string(),
        log_json: false,
    }
}

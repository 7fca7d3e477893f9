//! Structured Logging for the TRC20 Gateway
//!
//! Provides:
//! - JSON output for log aggregation, pretty output for development
//! - Correlation to the affected deposit / withdrawal record
//! - Deposit and withdrawal lifecycle events
//!
//! # Usage
//!
//! ```rust,ignore
//! use trc20_gateway::common::logging::{init_logging, LogLevel};
//!
//! init_logging(LogLevel::Info, true)?;
//! tracing::info!(target: "trc20_gateway::deposit", deposit_id = %id, "recorded");
//! ```

use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ============================================================================
// Log Levels
// ============================================================================

/// Application log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

// ============================================================================
// Structured Event Types
// ============================================================================

/// Event categories for structured logging
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Deposit detection and crediting
    Deposit,
    /// Withdrawal execution
    Withdrawal,
    /// Operator-facing notifications
    Notification,
    /// System events (startup, shutdown, cycles)
    System,
}

/// Structured log event
#[derive(Debug, Serialize)]
pub struct LogEvent {
    /// Event timestamp (RFC 3339)
    pub timestamp: String,
    pub level: String,
    pub category: EventCategory,
    pub message: String,
    /// Id of the affected record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

/// Error details for error events
#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

impl LogEvent {
    pub fn new(level: LogLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: format!("{:?}", level).to_uppercase(),
            category,
            message: message.into(),
            correlation_id: None,
            data: None,
            error: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(ErrorDetails {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"failed to serialize log\", \"message\": \"{}\"}}",
                self.message
            )
        })
    }
}

// ============================================================================
// Lifecycle Events
// ============================================================================

/// Log a deposit lifecycle event
pub fn log_deposit_event(
    event_type: &str,
    deposit_id: &str,
    tx_hash: &str,
    amount: &str,
    error: Option<(&str, &str)>,
) {
    let level = if error.is_some() { LogLevel::Warn } else { LogLevel::Info };
    let mut event = LogEvent::new(level, EventCategory::Deposit, event_type)
        .with_correlation_id(deposit_id)
        .with_data(serde_json::json!({
            "deposit_id": deposit_id,
            "tx_hash": tx_hash,
            "amount": amount,
        }));

    if let Some((code, message)) = error {
        event = event.with_error(code, message);
        tracing::warn!(target: "trc20_gateway::deposit", "{}", event.to_json());
    } else {
        tracing::info!(target: "trc20_gateway::deposit", "{}", event.to_json());
    }
}

/// Log a withdrawal lifecycle event
pub fn log_withdrawal_event(
    event_type: &str,
    withdrawal_id: &str,
    amount: &str,
    destination: &str,
    tx_hash: Option<&str>,
    error: Option<(&str, &str)>,
) {
    let level = if error.is_some() { LogLevel::Error } else { LogLevel::Info };
    let mut event = LogEvent::new(level, EventCategory::Withdrawal, event_type)
        .with_correlation_id(withdrawal_id)
        .with_data(serde_json::json!({
            "withdrawal_id": withdrawal_id,
            "amount": amount,
            "destination": destination,
            "tx_hash": tx_hash,
        }));

    if let Some((code, message)) = error {
        event = event.with_error(code, message);
        tracing::error!(target: "trc20_gateway::withdrawal", "{}", event.to_json());
    } else {
        tracing::info!(target: "trc20_gateway::withdrawal", "{}", event.to_json());
    }
}

/// Notify operators that a deposit was credited
pub fn notify_operator_credit(deposit_id: &str, tx_hash: &str, amount: &str, user: &str) {
    let event = LogEvent::new(LogLevel::Info, EventCategory::Notification, "deposit_credited")
        .with_correlation_id(deposit_id)
        .with_data(serde_json::json!({
            "deposit_id": deposit_id,
            "tx_hash": tx_hash,
            "amount": amount,
            "user_identity": user,
        }));

    tracing::info!(target: "trc20_gateway::notify", "{}", event.to_json());
}

// ============================================================================
// Initialization
// ============================================================================

/// Initialize the logging system
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init_logging(level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let level_name = format!("{:?}", level).to_lowercase();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "trc20_gateway={},axum={},reqwest=warn",
            level_name, level_name
        ))
    });

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    }

    Ok(())
}

/// Initialize logging from GatewayConfig
pub fn init_from_config(config: &super::config::GatewayConfig) -> Result<(), LoggingError> {
    init_logging(LogLevel::from(config.log_level.as_str()), config.log_json)
}

/// Logging errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

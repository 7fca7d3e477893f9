//! Common Infrastructure Module
//!
//! - Configuration loading from environment variables
//! - Structured logging setup
//! - The gateway error taxonomy

pub mod config;
pub mod error;
pub mod logging;

// Re-exports for convenience
pub use config::{
    ConfigError, CreditPolicy, ExecutorConfig, GatewayConfig, Network, ReconcilerConfig,
};
pub use error::{ErrorClass, GatewayError, ItemFailure, Result};
pub use logging::{
    init_from_config, init_logging, log_deposit_event, log_withdrawal_event,
    notify_operator_credit, EventCategory, LogEvent, LogLevel, LoggingError,
};

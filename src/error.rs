//! Error types for the paper-trading engine

use crate::order::OrderStatus;
use crate::types::OrderId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Rule that rejected an order request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationRule {
    UnknownInstrument,
    MissingSize,
    AmbiguousSize,
    NonPositiveQuantity,
    NonPositiveAmount,
    FractionalNotAllowed,
    AmountBelowOneUnit,
    InvalidLimitPrice,
    NonPositivePrice,
    ExpirationInPast,
    InsufficientShares,
    InsufficientCash,
    /// Order value does not fit the money representation
    OrderTooLarge,
    SessionClosed,
}

/// Structured validation failure, returned instead of raised
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub rule: ValidationRule,
    pub message: String,
}

impl ValidationFailure {
    pub fn new(rule: ValidationRule, message: impl Into<String>) -> Self {
        Self {
            rule,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.rule, self.message)
    }
}

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum PaperError {
    #[error("Validation failed: {0}")]
    ValidationFailed(ValidationFailure),

    #[error("Price unavailable for {symbol}: {reason}")]
    PriceUnavailable { symbol: String, reason: String },

    #[error("Order {order_id} is no longer pending (status: {status:?})")]
    StateConflict { order_id: OrderId, status: OrderStatus },

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No active game session")]
    NoActiveSession,

    #[error("Calendar error: {0}")]
    CalendarError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

impl PaperError {
    /// Human-readable reason suitable for showing to the trader.
    ///
    /// Internal details (SQL errors, provider diagnostics) stay in `Display`.
    pub fn user_message(&self) -> String {
        match self {
            PaperError::ValidationFailed(failure) => failure.message.clone(),
            PaperError::PriceUnavailable { symbol, .. } => {
                format!("No current price is available for {}", symbol)
            }
            PaperError::StateConflict { .. } => "Order is no longer pending".to_string(),
            PaperError::PersistenceFailure(_) => {
                "The trade could not be recorded, please try again".to_string()
            }
            PaperError::NotFound(what) => format!("{} was not found", what),
            PaperError::NoActiveSession => "There is no active game session".to_string(),
            PaperError::CalendarError(_) | PaperError::ConfigError(_) => {
                "The trading service is misconfigured".to_string()
            }
            PaperError::IoError(_) | PaperError::SerdeError(_) => {
                "An internal error occurred".to_string()
            }
        }
    }

    /// Whether the next sweep cycle may succeed where this attempt failed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PaperError::PriceUnavailable { .. } | PaperError::PersistenceFailure(_)
        )
    }
}

impl From<ValidationFailure> for PaperError {
    fn from(failure: ValidationFailure) -> Self {
        PaperError::ValidationFailed(failure)
    }
}

impl From<rusqlite::Error> for PaperError {
    fn from(err: rusqlite::Error) -> Self {
        PaperError::PersistenceFailure(err.to_string())
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, PaperError>;

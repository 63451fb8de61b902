//! Core types and constants

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Timestamp type used throughout the library
pub type Timestamp = DateTime<Utc>;

/// Ticker symbol
pub type Symbol = String;

/// Price per unit
pub type Price = Decimal;

/// Units of an instrument (fractional for eligible instruments)
pub type Quantity = Decimal;

/// Money/cash type
pub type Cash = Decimal;

/// Unique identifier for orders (queued market and limit)
pub type OrderId = uuid::Uuid;

/// Unique identifier for executed transactions
pub type TransactionId = uuid::Uuid;

/// Unique identifier for instruments
pub type InstrumentId = u64;

/// Unique identifier for portfolios
pub type PortfolioId = uuid::Uuid;

/// Unique identifier for game sessions
pub type SessionId = uuid::Uuid;

//! Trading constants and defaults
//!
//! Contains default values and constants used throughout the engine

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Decimal places kept on cash balances
pub const MONEY_DP: u32 = 2;

/// Decimal places kept on quoted prices
pub const PRICE_DP: u32 = 4;

/// Decimal places kept on average cost basis
pub const COST_BASIS_DP: u32 = 8;

/// Decimal places kept on fractional share quantities
pub const QUANTITY_DP: u32 = 6;

/// Holdings below this many units are deleted as dust
pub const HOLDING_EPSILON: Decimal = dec!(0.000001);

/// Default starting cash for a new game session
pub const DEFAULT_STARTING_CASH: Decimal = dec!(100000);

/// Trading calendar constants
pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Trading days in a 52-week range window
pub const FIFTY_TWO_WEEK_WINDOW: usize = 252;

/// Queued market orders still pending after this many days are cancelled
pub const QUEUED_ORDER_MAX_AGE_DAYS: i64 = 7;

/// Limit orders without an expiration are cancelled after this many days
pub const LIMIT_ORDER_MAX_AGE_DAYS: i64 = 90;

/// Default reconciliation cadence
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 180;

/// Default quote cache time-to-live
pub const DEFAULT_QUOTE_TTL_SECS: u64 = 15;

/// Tolerance used when comparing float prices for equality
pub const ZERO_TOLERANCE: f64 = 1e-10;

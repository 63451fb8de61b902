//! # rusty_paper
//!
//! Order execution and portfolio accounting for an educational paper-trading
//! simulator.
//!
//! Traders hold simulated cash and positions inside a time-boxed game session
//! and submit market or limit orders against external quotes. Market orders
//! settle immediately while the exchange is open and are queued otherwise.
//! Limit orders and queued orders are drained by a periodic reconciliation
//! sweep through the same validator and ledger.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rusty_paper::prelude::*;
//! use rust_decimal_macros::dec;
//! use std::sync::Arc;
//!
//! # async fn run() -> rusty_paper::error::Result<()> {
//! let store = Arc::new(Store::open_in_memory()?);
//! let quotes = Arc::new(InMemoryQuoteSource::new());
//! quotes.set_price("AAPL", dec!(190.25));
//!
//! let engine = ExecutionEngine::new(store, quotes, MarketOracle::nyse());
//! let outcome = engine
//!     .submit_market_order("alice", &OrderRequest::buy_quantity(1, dec!(10)))
//!     .await?;
//! println!("{}", outcome.label());
//! # Ok(())
//! # }
//! ```

pub mod asset;
pub mod cache;
pub mod calendar;
pub mod config;
pub mod engine;
pub mod error;
pub mod finance;
pub mod hooks;
pub mod order;
pub mod quotes;
pub mod reconcile;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod types;

pub mod prelude {
    //! Commonly used types and traits
    pub use crate::asset::{Asset, AssetDetails, AssetType};
    pub use crate::calendar::{Clock, MarketOracle, MarketState, MarketStatus, NyseCalendar, TradingCalendar};
    pub use crate::config::EngineConfig;
    pub use crate::engine::{ExecutionEngine, OrderOutcome};
    pub use crate::error::{PaperError, Result, ValidationFailure, ValidationRule};
    pub use crate::finance::{Holding, Ledger, Portfolio, PortfolioSnapshot, Transaction};
    pub use crate::hooks::{HookRunner, SettlementHook};
    pub use crate::order::{LimitOrderRequest, OrderRequest, OrderSide, OrderStatus, PendingOrder};
    pub use crate::quotes::{CachedQuoteSource, InMemoryQuoteSource, Quote, QuoteSource};
    pub use crate::reconcile::{Reconciler, SweepSettings, SweepSummary};
    pub use crate::scheduler::SweepScheduler;
    pub use crate::session::GameSession;
    pub use crate::store::Store;
    pub use crate::types::*;
}

//! Finance module - money math, ledger, validation, fees, risk metrics

pub mod account;
pub mod commission;
pub mod constants;
pub mod ledger;
pub mod math;
pub mod metrics;
pub mod transaction;
pub mod validator;

pub use account::{Holding, HoldingValuation, Portfolio, PortfolioSnapshot};
pub use commission::{FeeModel, FeeSchedule, ZeroFee};
pub use ledger::{HoldingChange, Ledger, Settlement, Trade};
pub use metrics::{MetricsCache, RiskCalculator, RiskReport};
pub use transaction::{TradeOrigin, Transaction};
pub use validator::{LimitTerms, OrderContext, OrderValidator, ValidatedOrder};

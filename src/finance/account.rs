//! Portfolio and holding records, plus their valuation at current quotes

use crate::finance::math;
use crate::types::{Cash, InstrumentId, PortfolioId, Price, Quantity, SessionId, Symbol, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A user's cash account inside one game session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub id: PortfolioId,
    pub user_id: String,
    pub session_id: SessionId,
    pub cash: Cash,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Position in one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub portfolio_id: PortfolioId,
    pub instrument_id: InstrumentId,
    pub symbol: Symbol,
    /// Units held, never negative
    pub quantity: Quantity,
    /// Average price paid per unit for the units still held
    pub average_cost: Price,
    pub updated_at: Timestamp,
}

impl Holding {
    /// Total amount paid for the units still held
    pub fn cost_basis(&self) -> Option<Cash> {
        math::notional(self.quantity, self.average_cost)
    }

    pub fn market_value(&self, price: Price) -> Option<Cash> {
        math::notional(self.quantity, price)
    }

    pub fn unrealized_pnl(&self, price: Price) -> Option<Cash> {
        math::sub(self.market_value(price)?, self.cost_basis()?)
    }
}

/// One holding valued at its current quote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldingValuation {
    pub holding: Holding,
    /// `None` when no quote could be fetched
    pub price: Option<Price>,
    pub market_value: Option<Cash>,
    pub unrealized_pnl: Option<Cash>,
    /// Unrealized P&L as a fraction of cost basis
    pub unrealized_pnl_pct: Option<Decimal>,
}

impl HoldingValuation {
    pub fn new(holding: Holding, price: Option<Price>) -> Self {
        let market_value = price.and_then(|p| holding.market_value(p)).map(math::round_money);
        let unrealized_pnl = price.and_then(|p| holding.unrealized_pnl(p)).map(math::round_money);
        let unrealized_pnl_pct = unrealized_pnl
            .zip(holding.cost_basis())
            .and_then(|(pnl, cost)| math::div(pnl, cost))
            .map(|pct| pct.round_dp(6));
        Self {
            holding,
            price,
            market_value,
            unrealized_pnl,
            unrealized_pnl_pct,
        }
    }
}

/// Point-in-time view of a portfolio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub portfolio: Portfolio,
    pub holdings: Vec<HoldingValuation>,
    /// Sum of valued holdings (unpriced holdings are left out)
    pub positions_value: Cash,
    pub total_value: Cash,
    pub starting_cash: Cash,
    /// Total value relative to starting cash
    pub total_return: Option<Decimal>,
    pub as_of: Timestamp,
}

impl PortfolioSnapshot {
    pub fn new(
        portfolio: Portfolio,
        holdings: Vec<HoldingValuation>,
        starting_cash: Cash,
        as_of: Timestamp,
    ) -> Self {
        let positions_value: Cash = holdings.iter().filter_map(|h| h.market_value).sum();
        let total_value = portfolio.cash + positions_value;
        let total_return = math::div(total_value - starting_cash, starting_cash).map(|r| r.round_dp(6));
        Self {
            portfolio,
            holdings,
            positions_value,
            total_value,
            starting_cash,
            total_return,
            as_of,
        }
    }

    /// Number of open positions
    pub fn num_positions(&self) -> usize {
        self.holdings.len()
    }
}

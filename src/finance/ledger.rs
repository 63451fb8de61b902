//! Ledger - settlement arithmetic for a single trade
//!
//! `Ledger::settle` is pure: given the portfolio's cash and current holding it
//! computes the complete effect of a fill (new cash, holding upsert or
//! delete, fees, realized P&L). The store applies that effect atomically.

use crate::error::{ValidationFailure, ValidationRule};
use crate::finance::account::Holding;
use crate::finance::commission::{FeeModel, ZeroFee};
use crate::finance::constants::HOLDING_EPSILON;
use crate::finance::math;
use crate::finance::transaction::{TradeOrigin, Transaction};
use crate::order::OrderSide;
use crate::types::{Cash, InstrumentId, OrderId, PortfolioId, Price, Quantity, Symbol, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A fill to settle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub portfolio_id: PortfolioId,
    pub instrument_id: InstrumentId,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub quantity: Quantity,
    pub price: Price,
}

/// What happens to the holding row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HoldingChange {
    Upsert(Holding),
    /// Remaining quantity fell below the holding epsilon
    Delete {
        portfolio_id: PortfolioId,
        instrument_id: InstrumentId,
    },
}

/// Complete effect of one settled trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub trade: Trade,
    /// Quantity actually moved (a sell may be clamped to the held amount)
    pub quantity: Quantity,
    pub fees: Cash,
    /// Cash debited (buy) or credited (sell)
    pub total: Cash,
    pub previous_cash: Cash,
    pub new_cash: Cash,
    pub holding: HoldingChange,
    /// Sells only, measured against the average cost
    pub realized_pnl: Option<Cash>,
}

impl Settlement {
    /// Build the append-only transaction record for this settlement
    pub fn to_transaction(
        &self,
        origin: TradeOrigin,
        order_id: Option<OrderId>,
        notes: Option<String>,
        executed_at: Timestamp,
    ) -> Transaction {
        Transaction {
            id: Transaction::new_id(),
            portfolio_id: self.trade.portfolio_id,
            instrument_id: self.trade.instrument_id,
            symbol: self.trade.symbol.clone(),
            side: self.trade.side,
            quantity: self.quantity,
            price: self.trade.price,
            fees: self.fees,
            total: self.total,
            origin,
            order_id,
            notes,
            executed_at,
        }
    }
}

/// Settlement calculator
#[derive(Clone)]
pub struct Ledger {
    fees: Arc<dyn FeeModel>,
    epsilon: Quantity,
}

impl Ledger {
    pub fn new(fees: Arc<dyn FeeModel>) -> Self {
        Self {
            fees,
            epsilon: HOLDING_EPSILON,
        }
    }

    pub fn with_epsilon(mut self, epsilon: Quantity) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn epsilon(&self) -> Quantity {
        self.epsilon
    }

    pub fn fee_model(&self) -> &dyn FeeModel {
        self.fees.as_ref()
    }

    pub fn estimate_fees(&self, side: OrderSide, price: Price, quantity: Quantity) -> Cash {
        math::round_money(self.fees.calculate(side, price, quantity))
    }

    /// Cash a buy of `quantity` at `price` will debit, `None` on overflow
    pub fn buy_cost(&self, price: Price, quantity: Quantity) -> Option<Cash> {
        let fees = self.estimate_fees(OrderSide::Buy, price, quantity);
        math::add(math::notional(quantity, price)?, fees).map(math::round_money)
    }

    /// Cash a sell of `quantity` at `price` will credit, `None` on overflow
    pub fn sell_proceeds(&self, price: Price, quantity: Quantity) -> Option<Cash> {
        let fees = self.estimate_fees(OrderSide::Sell, price, quantity);
        math::sub(math::notional(quantity, price)?, fees)
            .map(|net| math::round_money(net).max(Decimal::ZERO))
    }

    /// Quantity a sell may move given what is held.
    ///
    /// Requests within epsilon above the held amount are clamped to it.
    pub fn sellable_quantity(&self, requested: Quantity, held: Quantity) -> Option<Quantity> {
        if requested <= held {
            Some(requested)
        } else if requested - held <= self.epsilon {
            Some(held)
        } else {
            None
        }
    }

    /// Compute the effect of `trade` on a portfolio holding `cash` and `holding`
    pub fn settle(
        &self,
        cash: Cash,
        holding: Option<&Holding>,
        trade: &Trade,
        now: Timestamp,
    ) -> Result<Settlement, ValidationFailure> {
        if trade.quantity <= Decimal::ZERO {
            return Err(ValidationFailure::new(
                ValidationRule::NonPositiveQuantity,
                format!("Quantity must be positive, got {}", trade.quantity),
            ));
        }
        if trade.price <= Decimal::ZERO {
            return Err(ValidationFailure::new(
                ValidationRule::NonPositivePrice,
                format!("Price must be positive, got {}", trade.price),
            ));
        }

        match trade.side {
            OrderSide::Buy => self.settle_buy(cash, holding, trade, now),
            OrderSide::Sell => self.settle_sell(cash, holding, trade, now),
        }
    }

    fn settle_buy(
        &self,
        cash: Cash,
        holding: Option<&Holding>,
        trade: &Trade,
        now: Timestamp,
    ) -> Result<Settlement, ValidationFailure> {
        let fees = self.estimate_fees(OrderSide::Buy, trade.price, trade.quantity);
        let total = self
            .buy_cost(trade.price, trade.quantity)
            .ok_or_else(|| too_large(trade))?;
        if total > cash {
            return Err(ValidationFailure::new(
                ValidationRule::InsufficientCash,
                format!(
                    "Insufficient cash: {} {} costs {}, available {}",
                    trade.quantity, trade.symbol, total, cash
                ),
            ));
        }

        let (held_quantity, held_cost) = holding
            .map(|h| (h.quantity, h.average_cost))
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));
        let quantity = math::add(held_quantity, trade.quantity).ok_or_else(|| too_large(trade))?;
        let average_cost =
            math::weighted_average_cost(held_quantity, held_cost, trade.quantity, trade.price)
                .ok_or_else(|| too_large(trade))?;

        Ok(Settlement {
            trade: trade.clone(),
            quantity: trade.quantity,
            fees,
            total,
            previous_cash: cash,
            new_cash: cash - total,
            holding: HoldingChange::Upsert(Holding {
                portfolio_id: trade.portfolio_id,
                instrument_id: trade.instrument_id,
                symbol: trade.symbol.clone(),
                quantity,
                average_cost,
                updated_at: now,
            }),
            realized_pnl: None,
        })
    }

    fn settle_sell(
        &self,
        cash: Cash,
        holding: Option<&Holding>,
        trade: &Trade,
        now: Timestamp,
    ) -> Result<Settlement, ValidationFailure> {
        let held = holding.map(|h| h.quantity).unwrap_or(Decimal::ZERO);
        let quantity = self.sellable_quantity(trade.quantity, held).ok_or_else(|| {
            ValidationFailure::new(
                ValidationRule::InsufficientShares,
                format!(
                    "Insufficient shares: selling {} {}, holding {}",
                    trade.quantity, trade.symbol, held
                ),
            )
        })?;
        let holding = match holding {
            Some(h) => h,
            None => {
                return Err(ValidationFailure::new(
                    ValidationRule::InsufficientShares,
                    format!("No position in {}", trade.symbol),
                ))
            }
        };

        let fees = self.estimate_fees(OrderSide::Sell, trade.price, quantity);
        let total = self
            .sell_proceeds(trade.price, quantity)
            .ok_or_else(|| too_large(trade))?;
        let new_cash = math::add(cash, total).ok_or_else(|| too_large(trade))?;
        let remaining = held - quantity;

        let change = if math::approx_zero(remaining, self.epsilon) {
            HoldingChange::Delete {
                portfolio_id: trade.portfolio_id,
                instrument_id: trade.instrument_id,
            }
        } else {
            HoldingChange::Upsert(Holding {
                quantity: remaining,
                updated_at: now,
                ..holding.clone()
            })
        };

        let realized = math::sub(trade.price, holding.average_cost)
            .and_then(|gain| math::notional(quantity, gain))
            .and_then(|gross| math::sub(gross, fees))
            .map(math::round_money);

        Ok(Settlement {
            trade: Trade {
                quantity,
                ..trade.clone()
            },
            quantity,
            fees,
            total,
            previous_cash: cash,
            new_cash,
            holding: change,
            realized_pnl: realized,
        })
    }
}

fn too_large(trade: &Trade) -> ValidationFailure {
    ValidationFailure::new(
        ValidationRule::OrderTooLarge,
        format!("Order of {} {} at {} is too large to settle", trade.quantity, trade.symbol, trade.price),
    )
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(Arc::new(ZeroFee))
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("fees", &self.fees.name())
            .field("epsilon", &self.epsilon)
            .finish()
    }
}

//! Transaction - represents an executed trade
//!
//! A Transaction is written once, by the settlement that produced it, and is
//! never updated afterwards.

use crate::order::OrderSide;
use crate::types::{Cash, InstrumentId, OrderId, PortfolioId, Price, Quantity, Symbol, Timestamp, TransactionId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which path produced a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeOrigin {
    /// Market order executed on submission
    Immediate,
    /// Queued market order drained by the sweep
    QueuedMarket,
    /// Limit order triggered by the sweep
    Limit,
}

impl TradeOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeOrigin::Immediate => "IMMEDIATE",
            TradeOrigin::QueuedMarket => "QUEUED_MARKET",
            TradeOrigin::Limit => "LIMIT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "IMMEDIATE" => Some(TradeOrigin::Immediate),
            "QUEUED_MARKET" => Some(TradeOrigin::QueuedMarket),
            "LIMIT" => Some(TradeOrigin::Limit),
            _ => None,
        }
    }
}

/// Transaction represents an executed trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction ID
    pub id: TransactionId,
    pub portfolio_id: PortfolioId,
    pub instrument_id: InstrumentId,
    pub symbol: Symbol,
    pub side: OrderSide,
    /// Units traded (always positive)
    pub quantity: Quantity,
    /// Execution price per unit
    pub price: Price,
    /// Fees charged
    pub fees: Cash,
    /// Cash moved: notional plus fees for buys, notional minus fees for sells
    pub total: Cash,
    pub origin: TradeOrigin,
    /// Deferred order that produced this transaction, if any
    pub order_id: Option<OrderId>,
    pub notes: Option<String>,
    pub executed_at: Timestamp,
}

impl Transaction {
    /// Notional value (price * quantity)
    pub fn value(&self) -> Cash {
        self.price * self.quantity
    }

    /// Signed cash movement from the portfolio's point of view
    pub fn cash_delta(&self) -> Cash {
        match self.side {
            OrderSide::Buy => -self.total,
            OrderSide::Sell => self.total,
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self.side, OrderSide::Buy)
    }

    pub fn is_sell(&self) -> bool {
        matches!(self.side, OrderSide::Sell)
    }

    pub(crate) fn new_id() -> TransactionId {
        Uuid::new_v4()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn txn(side: OrderSide) -> Transaction {
        Transaction {
            id: Transaction::new_id(),
            portfolio_id: Uuid::new_v4(),
            instrument_id: 1,
            symbol: "AAPL".to_string(),
            side,
            quantity: dec!(10),
            price: dec!(150),
            fees: dec!(1),
            total: match side {
                OrderSide::Buy => dec!(1501),
                OrderSide::Sell => dec!(1499),
            },
            origin: TradeOrigin::Immediate,
            order_id: None,
            notes: None,
            executed_at: Utc::now(),
        }
    }

    #[test]
    fn test_transaction_values() {
        let buy = txn(OrderSide::Buy);
        assert_eq!(buy.value(), dec!(1500));
        assert_eq!(buy.cash_delta(), dec!(-1501));
        assert!(buy.is_buy());

        let sell = txn(OrderSide::Sell);
        assert_eq!(sell.cash_delta(), dec!(1499));
        assert!(sell.is_sell());
    }

    #[test]
    fn test_origin_names() {
        for origin in [TradeOrigin::Immediate, TradeOrigin::QueuedMarket, TradeOrigin::Limit] {
            assert_eq!(TradeOrigin::parse(origin.as_str()), Some(origin));
        }
    }
}

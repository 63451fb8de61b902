//! Order types and lifecycle

use crate::types::{Cash, InstrumentId, OrderId, PortfolioId, Price, Quantity, Symbol, Timestamp, TransactionId};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "BUY" => Some(OrderSide::Buy),
            "SELL" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Execute at the current quote, or queue until the market opens
    Market,
    /// Execute once the quote crosses the limit price
    Limit,
}

/// Order status
///
/// `Pending` is the only state an order can leave. The rest are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Executed,
    Cancelled,
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Executed => "EXECUTED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(OrderStatus::Pending),
            "EXECUTED" => Some(OrderStatus::Executed),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            "EXPIRED" => Some(OrderStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

/// What was asked for: units, or a dollar amount converted at the fill price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub instrument_id: InstrumentId,
    pub side: OrderSide,
    pub quantity: Option<Quantity>,
    pub dollar_amount: Option<Cash>,
    pub notes: Option<String>,
}

impl OrderRequest {
    pub fn buy_quantity(instrument_id: InstrumentId, quantity: Quantity) -> Self {
        Self::new(instrument_id, OrderSide::Buy).with_quantity(quantity)
    }

    pub fn sell_quantity(instrument_id: InstrumentId, quantity: Quantity) -> Self {
        Self::new(instrument_id, OrderSide::Sell).with_quantity(quantity)
    }

    pub fn buy_amount(instrument_id: InstrumentId, dollar_amount: Cash) -> Self {
        Self::new(instrument_id, OrderSide::Buy).with_amount(dollar_amount)
    }

    pub fn new(instrument_id: InstrumentId, side: OrderSide) -> Self {
        Self {
            instrument_id,
            side,
            quantity: None,
            dollar_amount: None,
            notes: None,
        }
    }

    pub fn with_quantity(mut self, quantity: Quantity) -> Self {
        self.quantity = Some(quantity);
        self
    }

    pub fn with_amount(mut self, dollar_amount: Cash) -> Self {
        self.dollar_amount = Some(dollar_amount);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Limit order submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitOrderRequest {
    pub order: OrderRequest,
    pub limit_price: Price,
    pub expire_at: Option<Timestamp>,
}

impl LimitOrderRequest {
    pub fn new(order: OrderRequest, limit_price: Price) -> Self {
        Self {
            order,
            limit_price,
            expire_at: None,
        }
    }

    pub fn expiring_at(mut self, expire_at: Timestamp) -> Self {
        self.expire_at = Some(expire_at);
        self
    }
}

/// A market order deferred because trading was not allowed at submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMarketOrder {
    pub id: OrderId,
    pub portfolio_id: PortfolioId,
    pub instrument_id: InstrumentId,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub quantity: Option<Quantity>,
    pub dollar_amount: Option<Cash>,
    /// Quote at submission time. Never used as the execution price.
    pub reference_price: Price,
    pub status: OrderStatus,
    pub notes: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub executed_price: Option<Price>,
    pub executed_at: Option<Timestamp>,
    pub transaction_id: Option<TransactionId>,
    pub cancel_reason: Option<String>,
}

impl QueuedMarketOrder {
    pub fn is_pending(&self) -> bool {
        self.status == OrderStatus::Pending
    }

    /// Pending for longer than `max_age`
    pub fn is_stale(&self, now: Timestamp, max_age: Duration) -> bool {
        self.is_pending() && now - self.created_at > max_age
    }
}

impl fmt::Display for QueuedMarketOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueuedMarketOrder({}, {} {}, {:?})",
            self.id,
            self.side,
            self.symbol,
            self.status
        )
    }
}

/// A limit order, only ever executed by the reconciliation sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitOrder {
    pub id: OrderId,
    pub portfolio_id: PortfolioId,
    pub instrument_id: InstrumentId,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub quantity: Quantity,
    pub limit_price: Price,
    pub expire_at: Option<Timestamp>,
    pub status: OrderStatus,
    pub notes: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub executed_price: Option<Price>,
    pub executed_at: Option<Timestamp>,
    pub transaction_id: Option<TransactionId>,
    pub cancel_reason: Option<String>,
}

impl LimitOrder {
    pub fn is_pending(&self) -> bool {
        self.status == OrderStatus::Pending
    }

    /// First-touch trigger rule
    pub fn triggers_at(&self, price: Price) -> bool {
        match self.side {
            OrderSide::Buy => price <= self.limit_price,
            OrderSide::Sell => price >= self.limit_price,
        }
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        matches!(self.expire_at, Some(expire_at) if expire_at <= now)
    }

    /// Pending without an expiration for longer than `max_age`
    pub fn is_stale(&self, now: Timestamp, max_age: Duration) -> bool {
        self.is_pending() && self.expire_at.is_none() && now - self.created_at > max_age
    }
}

impl fmt::Display for LimitOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LimitOrder({}, {} {} {} @ {}, {:?})",
            self.id, self.side, self.quantity, self.symbol, self.limit_price, self.status
        )
    }
}

/// Either kind of deferred order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PendingOrder {
    Market(QueuedMarketOrder),
    Limit(LimitOrder),
}

impl PendingOrder {
    pub fn id(&self) -> OrderId {
        match self {
            PendingOrder::Market(order) => order.id,
            PendingOrder::Limit(order) => order.id,
        }
    }

    pub fn status(&self) -> OrderStatus {
        match self {
            PendingOrder::Market(order) => order.status,
            PendingOrder::Limit(order) => order.status,
        }
    }

    pub fn portfolio_id(&self) -> PortfolioId {
        match self {
            PendingOrder::Market(order) => order.portfolio_id,
            PendingOrder::Limit(order) => order.portfolio_id,
        }
    }

    pub fn order_type(&self) -> OrderType {
        match self {
            PendingOrder::Market(_) => OrderType::Market,
            PendingOrder::Limit(_) => OrderType::Limit,
        }
    }
}

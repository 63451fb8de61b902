//! Fee models for calculating simulated trading costs

use crate::finance::math;
use crate::order::OrderSide;
use crate::types::{Cash, Price, Quantity};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Fee model trait
pub trait FeeModel: Send + Sync {
    /// Calculate the fee for a fill
    fn calculate(&self, side: OrderSide, price: Price, quantity: Quantity) -> Cash;

    /// Get model name
    fn name(&self) -> &str;
}

/// Zero fee model (the default for the simulator)
#[derive(Debug, Clone, Default)]
pub struct ZeroFee;

impl FeeModel for ZeroFee {
    fn calculate(&self, _side: OrderSide, _price: Price, _quantity: Quantity) -> Cash {
        Decimal::ZERO
    }

    fn name(&self) -> &str {
        "ZeroFee"
    }
}

/// Flat fee per trade plus a percentage of notional, with a floor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Charged on every fill
    #[serde(default)]
    pub per_trade: Cash,
    /// Fraction of notional, e.g. 0.001 for 10 bps
    #[serde(default)]
    pub pct_of_notional: Decimal,
    /// Minimum fee when any fee applies
    #[serde(default)]
    pub min_fee: Cash,
}

impl FeeSchedule {
    pub fn new(per_trade: Cash, pct_of_notional: Decimal) -> Self {
        Self {
            per_trade,
            pct_of_notional,
            min_fee: Decimal::ZERO,
        }
    }

    pub fn with_min(mut self, min_fee: Cash) -> Self {
        self.min_fee = min_fee;
        self
    }

    pub fn is_free(&self) -> bool {
        self.per_trade.is_zero() && self.pct_of_notional.is_zero()
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self::new(Decimal::ZERO, Decimal::ZERO)
    }
}

impl FeeModel for FeeSchedule {
    fn calculate(&self, _side: OrderSide, price: Price, quantity: Quantity) -> Cash {
        if self.is_free() {
            return Decimal::ZERO;
        }
        // Saturates on overflow
        let fee = math::notional(quantity.abs(), price)
            .and_then(|notional| math::mul(notional, self.pct_of_notional))
            .and_then(|variable| math::add(self.per_trade, variable))
            .map(math::round_money)
            .unwrap_or(Decimal::MAX);
        fee.max(self.min_fee)
    }

    fn name(&self) -> &str {
        "FeeSchedule"
    }
}

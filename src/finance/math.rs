//! Fixed-precision money arithmetic
//!
//! Every cash and share calculation in the engine goes through these helpers so
//! that repeated trades never accumulate binary floating-point drift. Only the
//! statistics layer converts to `f64`, and only at its boundary.

use crate::finance::constants::{COST_BASIS_DP, MONEY_DP, PRICE_DP, QUANTITY_DP};
use crate::types::{Cash, Price, Quantity};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

/// Addition, `None` on overflow
pub fn add(a: Decimal, b: Decimal) -> Option<Decimal> {
    a.checked_add(b)
}

/// Subtraction, `None` on overflow
pub fn sub(a: Decimal, b: Decimal) -> Option<Decimal> {
    a.checked_sub(b)
}

/// Multiplication, `None` on overflow
pub fn mul(a: Decimal, b: Decimal) -> Option<Decimal> {
    a.checked_mul(b)
}

/// Division, `None` for a zero divisor or overflow
pub fn div(a: Decimal, b: Decimal) -> Option<Decimal> {
    if b.is_zero() {
        return None;
    }
    a.checked_div(b)
}

/// Round a cash amount to cents
pub fn round_money(value: Cash) -> Cash {
    value.round_dp_with_strategy(MONEY_DP, RoundingStrategy::MidpointAwayFromZero)
}

/// Round a quoted price
pub fn round_price(value: Price) -> Price {
    value.round_dp_with_strategy(PRICE_DP, RoundingStrategy::MidpointAwayFromZero)
}

/// Round an average cost basis
pub fn round_cost_basis(value: Price) -> Price {
    value.round_dp_with_strategy(COST_BASIS_DP, RoundingStrategy::MidpointAwayFromZero)
}

/// Truncate a quantity to what the instrument can hold.
///
/// Always rounds toward zero so a converted order never costs more than the
/// dollar amount it came from.
pub fn round_quantity(quantity: Quantity, fractional: bool) -> Quantity {
    if fractional {
        quantity.round_dp_with_strategy(QUANTITY_DP, RoundingStrategy::ToZero)
    } else {
        quantity.trunc()
    }
}

/// Convert a dollar amount into units at `price`
pub fn shares_for_amount(amount: Cash, price: Price, fractional: bool) -> Option<Quantity> {
    if price <= Decimal::ZERO {
        return None;
    }
    div(amount, price).map(|q| round_quantity(q, fractional))
}

/// Gross value of `quantity` units at `price`, `None` when it does not fit
pub fn notional(quantity: Quantity, price: Price) -> Option<Cash> {
    mul(quantity, price)
}

/// Quantity-weighted average of an existing position and a new fill.
///
/// `None` when the combined position overflows.
pub fn weighted_average_cost(
    held_quantity: Quantity,
    held_cost: Price,
    fill_quantity: Quantity,
    fill_price: Price,
) -> Option<Price> {
    let total_quantity = add(held_quantity, fill_quantity)?;
    if total_quantity <= Decimal::ZERO {
        return Some(fill_price);
    }
    let total_cost = add(notional(held_quantity, held_cost)?, notional(fill_quantity, fill_price)?)?;
    div(total_cost, total_quantity).map(round_cost_basis)
}

/// Whether `quantity` is dust under the holding tolerance
pub fn approx_zero(quantity: Quantity, epsilon: Quantity) -> bool {
    quantity.abs() < epsilon
}

/// Whether a quantity has a fractional part
pub fn is_fractional(quantity: Quantity) -> bool {
    !quantity.fract().is_zero()
}

/// Lossy conversion for the statistics layer
pub fn to_f64(value: Decimal) -> Option<f64> {
    value.to_f64().filter(|v| v.is_finite())
}

/// Conversion from a float supplied by an external source
pub fn from_f64(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    Decimal::from_f64(value)
}

//! Order validation
//!
//! Checks run in a fixed order and the first violated rule is reported. The
//! validator never touches storage; callers pass in the cash, holding and
//! price it should check against.

use crate::asset::Asset;
use crate::error::{ValidationFailure, ValidationRule};
use crate::finance::ledger::Ledger;
use crate::finance::math;
use crate::order::{OrderRequest, OrderSide};
use crate::types::{Cash, InstrumentId, Price, Quantity, Symbol, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// State the request is checked against
#[derive(Debug, Clone, Copy)]
pub struct OrderContext<'a> {
    /// `None` when the instrument id did not resolve
    pub instrument: Option<&'a Asset>,
    /// Current quote (or trigger price during the sweep)
    pub price: Price,
    pub cash: Cash,
    /// Units currently held of this instrument
    pub held: Quantity,
    pub now: Timestamp,
}

/// Extra terms carried by a limit order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitTerms {
    pub limit_price: Price,
    pub expire_at: Option<Timestamp>,
}

/// A request that passed every check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedOrder {
    pub instrument_id: InstrumentId,
    pub symbol: Symbol,
    pub side: OrderSide,
    /// Units to trade, after dollar conversion and sell clamping
    pub quantity: Quantity,
    /// Price the checks were run at
    pub price: Price,
    /// Buys: cash debited. Sells: cash credited.
    pub estimated_total: Cash,
    pub estimated_fees: Cash,
    /// Original dollar amount, kept for re-sizing queued orders
    pub dollar_amount: Option<Cash>,
}

fn fail(rule: ValidationRule, message: impl Into<String>) -> ValidationFailure {
    ValidationFailure::new(rule, message)
}

fn too_large(quantity: Quantity, symbol: &str, price: Price) -> ValidationFailure {
    fail(
        ValidationRule::OrderTooLarge,
        format!("Order of {} {} at {} is too large to price", quantity, symbol, price),
    )
}

/// Order Validator
#[derive(Debug, Clone, Default)]
pub struct OrderValidator {
    ledger: Ledger,
}

impl OrderValidator {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Validate a market order (or a deferred order being re-checked)
    pub fn validate(
        &self,
        request: &OrderRequest,
        ctx: &OrderContext<'_>,
    ) -> Result<ValidatedOrder, ValidationFailure> {
        self.check(request, ctx, None)
    }

    /// Validate a limit order submission.
    ///
    /// Buys are checked at the limit price, the most the order can cost.
    pub fn validate_limit(
        &self,
        request: &OrderRequest,
        terms: &LimitTerms,
        ctx: &OrderContext<'_>,
    ) -> Result<ValidatedOrder, ValidationFailure> {
        self.check(request, ctx, Some(terms))
    }

    fn check(
        &self,
        request: &OrderRequest,
        ctx: &OrderContext<'_>,
        limit: Option<&LimitTerms>,
    ) -> Result<ValidatedOrder, ValidationFailure> {
        let instrument = ctx.instrument.ok_or_else(|| {
            fail(
                ValidationRule::UnknownInstrument,
                format!("Unknown instrument {}", request.instrument_id),
            )
        })?;

        let price = match limit {
            Some(terms) if terms.limit_price > Decimal::ZERO => terms.limit_price,
            _ => ctx.price,
        };
        if price <= Decimal::ZERO {
            return Err(fail(
                ValidationRule::NonPositivePrice,
                format!("No usable price for {}", instrument.symbol),
            ));
        }

        let quantity = match (request.quantity, request.dollar_amount) {
            (None, None) => {
                return Err(fail(
                    ValidationRule::MissingSize,
                    "Specify either a quantity or a dollar amount",
                ))
            }
            (Some(_), Some(_)) => {
                return Err(fail(
                    ValidationRule::AmbiguousSize,
                    "Specify a quantity or a dollar amount, not both",
                ))
            }
            (Some(quantity), None) => {
                if quantity <= Decimal::ZERO {
                    return Err(fail(
                        ValidationRule::NonPositiveQuantity,
                        format!("Quantity must be positive, got {}", quantity),
                    ));
                }
                if !instrument.fractional_shares && math::is_fractional(quantity) {
                    return Err(fail(
                        ValidationRule::FractionalNotAllowed,
                        format!("{} only trades in whole shares", instrument.symbol),
                    ));
                }
                quantity
            }
            (None, Some(amount)) => {
                if amount <= Decimal::ZERO {
                    return Err(fail(
                        ValidationRule::NonPositiveAmount,
                        format!("Dollar amount must be positive, got {}", amount),
                    ));
                }
                let quantity =
                    math::shares_for_amount(amount, price, instrument.fractional_shares)
                        .unwrap_or(Decimal::ZERO);
                if quantity <= Decimal::ZERO {
                    return Err(fail(
                        ValidationRule::AmountBelowOneUnit,
                        format!(
                            "${} is not enough to buy one unit of {} at {}",
                            amount, instrument.symbol, price
                        ),
                    ));
                }
                quantity
            }
        };

        if let Some(terms) = limit {
            if terms.limit_price <= Decimal::ZERO {
                return Err(fail(
                    ValidationRule::InvalidLimitPrice,
                    format!("Limit price must be positive, got {}", terms.limit_price),
                ));
            }
            if let Some(expire_at) = terms.expire_at {
                if expire_at <= ctx.now {
                    return Err(fail(
                        ValidationRule::ExpirationInPast,
                        "Expiration must be in the future",
                    ));
                }
            }
        }

        let (quantity, estimated_total) = match request.side {
            OrderSide::Sell => {
                let quantity = self.ledger.sellable_quantity(quantity, ctx.held).ok_or_else(|| {
                    fail(
                        ValidationRule::InsufficientShares,
                        format!(
                            "Insufficient shares: selling {} {}, holding {}",
                            quantity, instrument.symbol, ctx.held
                        ),
                    )
                })?;
                let proceeds = self
                    .ledger
                    .sell_proceeds(price, quantity)
                    .ok_or_else(|| too_large(quantity, &instrument.symbol, price))?;
                (quantity, proceeds)
            }
            OrderSide::Buy => {
                let cost = self
                    .ledger
                    .buy_cost(price, quantity)
                    .ok_or_else(|| too_large(quantity, &instrument.symbol, price))?;
                if cost > ctx.cash {
                    return Err(fail(
                        ValidationRule::InsufficientCash,
                        format!(
                            "Insufficient cash: order costs {}, available {}",
                            cost, ctx.cash
                        ),
                    ));
                }
                (quantity, cost)
            }
        };

        Ok(ValidatedOrder {
            instrument_id: instrument.id,
            symbol: instrument.symbol.clone(),
            side: request.side,
            quantity,
            price,
            estimated_total,
            estimated_fees: self.ledger.estimate_fees(request.side, price, quantity),
            dollar_amount: request.dollar_amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finance::commission::FeeSchedule;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn ctx<'a>(asset: Option<&'a Asset>, price: Price, cash: Cash, held: Quantity) -> OrderContext<'a> {
        OrderContext {
            instrument: asset,
            price,
            cash,
            held,
            now: Utc::now(),
        }
    }

    fn rule(result: Result<ValidatedOrder, ValidationFailure>) -> ValidationRule {
        result.unwrap_err().rule
    }

    #[test]
    fn test_unknown_instrument_first() {
        let v = OrderValidator::default();
        // Also missing a size, but the instrument check wins
        let req = OrderRequest::new(99, OrderSide::Buy);
        assert_eq!(rule(v.validate(&req, &ctx(None, dec!(10), dec!(100), dec!(0)))), ValidationRule::UnknownInstrument);
    }

    #[test]
    fn test_size_rules() {
        let v = OrderValidator::default();
        let asset = Asset::stock(1, "AAPL", "NASDAQ");
        let c = ctx(Some(&asset), dec!(10), dec!(1000), dec!(0));

        assert_eq!(rule(v.validate(&OrderRequest::new(1, OrderSide::Buy), &c)), ValidationRule::MissingSize);
        let both = OrderRequest::buy_quantity(1, dec!(1)).with_amount(dec!(10));
        assert_eq!(rule(v.validate(&both, &c)), ValidationRule::AmbiguousSize);
        assert_eq!(
            rule(v.validate(&OrderRequest::buy_quantity(1, dec!(0)), &c)),
            ValidationRule::NonPositiveQuantity
        );
        assert_eq!(
            rule(v.validate(&OrderRequest::buy_amount(1, dec!(-5)), &c)),
            ValidationRule::NonPositiveAmount
        );
        assert_eq!(
            rule(v.validate(&OrderRequest::buy_quantity(1, dec!(1.5)), &c)),
            ValidationRule::FractionalNotAllowed
        );
        assert_eq!(
            rule(v.validate(&OrderRequest::buy_amount(1, dec!(9.99)), &c)),
            ValidationRule::AmountBelowOneUnit
        );
    }

    #[test]
    fn test_dollar_amount_conversion() {
        let v = OrderValidator::default();
        let asset = Asset::fund(2, "VTI").fractional();
        let order = v
            .validate(
                &OrderRequest::buy_amount(2, dec!(1000)),
                &ctx(Some(&asset), dec!(22), dec!(5000), dec!(0)),
            )
            .unwrap();
        assert_eq!(order.quantity, dec!(45.454545));
        assert_eq!(order.estimated_total, dec!(1000.00));
        assert_eq!(order.dollar_amount, Some(dec!(1000)));

        let whole = Asset::stock(3, "KO", "NYSE");
        let order = v
            .validate(
                &OrderRequest::buy_amount(3, dec!(1000)),
                &ctx(Some(&whole), dec!(22), dec!(5000), dec!(0)),
            )
            .unwrap();
        assert_eq!(order.quantity, dec!(45));
    }

    #[test]
    fn test_limit_rules() {
        let v = OrderValidator::default();
        let asset = Asset::stock(1, "AAPL", "NASDAQ");
        let c = ctx(Some(&asset), dec!(55), dec!(10000), dec!(0));
        let req = OrderRequest::buy_quantity(1, dec!(10));

        let bad_price = LimitTerms {
            limit_price: dec!(0),
            expire_at: None,
        };
        assert_eq!(rule(v.validate_limit(&req, &bad_price, &c)), ValidationRule::InvalidLimitPrice);

        let past = LimitTerms {
            limit_price: dec!(50),
            expire_at: Some(c.now - Duration::minutes(1)),
        };
        assert_eq!(rule(v.validate_limit(&req, &past, &c)), ValidationRule::ExpirationInPast);

        let ok = LimitTerms {
            limit_price: dec!(50),
            expire_at: Some(c.now + Duration::days(1)),
        };
        let order = v.validate_limit(&req, &ok, &c).unwrap();
        // Priced at the limit, not the quote
        assert_eq!(order.price, dec!(50));
        assert_eq!(order.estimated_total, dec!(500));
    }

    #[test]
    fn test_sell_requires_shares() {
        let v = OrderValidator::default();
        let asset = Asset::stock(1, "AAPL", "NASDAQ");
        let req = OrderRequest::sell_quantity(1, dec!(11));
        assert_eq!(
            rule(v.validate(&req, &ctx(Some(&asset), dec!(50), dec!(0), dec!(10)))),
            ValidationRule::InsufficientShares
        );
        let ok = v
            .validate(&OrderRequest::sell_quantity(1, dec!(10)), &ctx(Some(&asset), dec!(50), dec!(0), dec!(10)))
            .unwrap();
        assert_eq!(ok.estimated_total, dec!(500));
    }

    #[test]
    fn test_buy_requires_cash_including_fees() {
        let ledger = Ledger::new(Arc::new(FeeSchedule::new(dec!(1), Decimal::ZERO)));
        let v = OrderValidator::new(ledger);
        let asset = Asset::stock(1, "AAPL", "NASDAQ");
        let req = OrderRequest::buy_quantity(1, dec!(10));

        assert_eq!(
            rule(v.validate(&req, &ctx(Some(&asset), dec!(10), dec!(100), dec!(0)))),
            ValidationRule::InsufficientCash
        );
        let ok = v.validate(&req, &ctx(Some(&asset), dec!(10), dec!(101), dec!(0))).unwrap();
        assert_eq!(ok.estimated_total, dec!(101));
        assert_eq!(ok.estimated_fees, dec!(1));
    }

    #[test]
    fn test_oversized_order_is_rejected() {
        let asset = Asset::stock(1, "AAPL", "NASDAQ");
        let c = ctx(Some(&asset), dec!(55), dec!(10000), dec!(0));
        let huge = OrderRequest::buy_quantity(1, Decimal::MAX);

        assert_eq!(rule(OrderValidator::default().validate(&huge, &c)), ValidationRule::OrderTooLarge);

        let with_fees = OrderValidator::new(Ledger::new(Arc::new(FeeSchedule::new(dec!(1), dec!(0.001)))));
        assert_eq!(rule(with_fees.validate(&huge, &c)), ValidationRule::OrderTooLarge);

        let terms = LimitTerms {
            limit_price: dec!(50),
            expire_at: None,
        };
        assert_eq!(
            rule(OrderValidator::default().validate_limit(&huge, &terms, &c)),
            ValidationRule::OrderTooLarge
        );
    }
}

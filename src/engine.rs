//! Execution engine
//!
//! Entry point for trader requests. A market order either settles right away
//! (market open) or is parked as a queued market order for the sweep. Limit
//! orders are always parked. Every path runs the same validator first.

use crate::asset::Asset;
use crate::calendar::{Clock, MarketOracle, MarketStatus, NyseCalendar, SystemClock};
use crate::config::EngineConfig;
use crate::error::{PaperError, Result, ValidationFailure, ValidationRule};
use crate::finance::account::{HoldingValuation, Portfolio, PortfolioSnapshot};
use crate::finance::ledger::{Ledger, Trade};
use crate::finance::transaction::Transaction;
use crate::finance::validator::{LimitTerms, OrderContext, OrderValidator, ValidatedOrder};
use crate::hooks::{Activity, ActivityKind, HookRunner};
use crate::order::{LimitOrder, LimitOrderRequest, OrderRequest, OrderStatus, PendingOrder, QueuedMarketOrder};
use crate::quotes::QuoteSource;
use crate::session::GameSession;
use crate::store::{OrderClaim, Store};
use crate::types::{Cash, OrderId, Price, Quantity, Timestamp};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// What happened to a submitted order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderOutcome {
    /// Settled on submission
    Executed { transaction: Transaction, new_cash: Cash },
    /// Market closed, parked until the next session
    Queued {
        order: QueuedMarketOrder,
        next_session: Option<Timestamp>,
    },
    LimitPlaced { order: LimitOrder },
}

impl OrderOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            OrderOutcome::Executed { .. } => "EXECUTED",
            OrderOutcome::Queued { .. } => "QUEUED",
            OrderOutcome::LimitPlaced { .. } => "PENDING",
        }
    }

    pub fn order_id(&self) -> Option<OrderId> {
        match self {
            OrderOutcome::Executed { .. } => None,
            OrderOutcome::Queued { order, .. } => Some(order.id),
            OrderOutcome::LimitPlaced { order } => Some(order.id),
        }
    }
}

/// Cash and position the validator sees for a user
struct Position {
    portfolio: Option<Portfolio>,
    cash: Cash,
    held: Quantity,
}

pub struct ExecutionEngine {
    store: Arc<Store>,
    quotes: Arc<dyn QuoteSource>,
    oracle: MarketOracle,
    clock: Arc<dyn Clock>,
    ledger: Ledger,
    validator: OrderValidator,
    hooks: HookRunner,
}

impl ExecutionEngine {
    pub fn new(store: Arc<Store>, quotes: Arc<dyn QuoteSource>, oracle: MarketOracle) -> Self {
        let ledger = Ledger::default();
        Self {
            store,
            quotes,
            oracle,
            clock: Arc::new(SystemClock),
            validator: OrderValidator::new(ledger.clone()),
            ledger,
            hooks: HookRunner::new(),
        }
    }

    /// Engine with the calendar range and fee schedule from `config`
    pub fn from_config(config: &EngineConfig, store: Arc<Store>, quotes: Arc<dyn QuoteSource>) -> Self {
        let calendar = NyseCalendar::new(config.calendar.first_year, config.calendar.last_year);
        let oracle = MarketOracle::new(Arc::new(calendar));
        Self::new(store, quotes, oracle).with_ledger(Ledger::new(Arc::new(config.fees.clone())))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ledger(mut self, ledger: Ledger) -> Self {
        self.validator = OrderValidator::new(ledger.clone());
        self.ledger = ledger;
        self
    }

    pub fn with_hooks(mut self, hooks: HookRunner) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn quotes(&self) -> &Arc<dyn QuoteSource> {
        &self.quotes
    }

    pub fn oracle(&self) -> &MarketOracle {
        &self.oracle
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn validator(&self) -> &OrderValidator {
        &self.validator
    }

    pub fn hooks(&self) -> &HookRunner {
        &self.hooks
    }

    pub fn market_status(&self) -> MarketStatus {
        self.oracle.status(self.clock.now())
    }

    /// Submit a market order for `user_id`
    pub async fn submit_market_order(&self, user_id: &str, request: &OrderRequest) -> Result<OrderOutcome> {
        let now = self.clock.now();
        let session = self.open_session(now)?;
        let instrument = self.instrument(request.instrument_id)?;
        let position = self.position(user_id, &session, &instrument)?;

        let quote = self.quotes.fresh_quote(&instrument.symbol).await?;
        let ctx = OrderContext {
            instrument: Some(&instrument),
            price: quote.price,
            cash: position.cash,
            held: position.held,
            now,
        };
        let validated = self.validator.validate(request, &ctx)?;

        let status = self.oracle.status(now);
        let portfolio = match position.portfolio {
            Some(portfolio) => portfolio,
            None => self.store.get_or_create_portfolio(user_id, &session, now)?,
        };

        if status.can_execute_orders {
            let trade = trade_for(&portfolio, &validated);
            let outcome = self.store.settle_trade(
                &self.ledger,
                &trade,
                OrderClaim::Immediate,
                request.notes.clone(),
                now,
            )?;
            self.hooks.dispatch(&outcome);
            return Ok(OrderOutcome::Executed {
                new_cash: outcome.new_cash,
                transaction: outcome.transaction,
            });
        }

        // Dollar-amount orders keep the amount and are re-sized at execution
        let quantity = match request.dollar_amount {
            Some(_) => None,
            None => Some(validated.quantity),
        };
        let order = QueuedMarketOrder {
            id: Uuid::new_v4(),
            portfolio_id: portfolio.id,
            instrument_id: instrument.id,
            symbol: instrument.symbol.clone(),
            side: request.side,
            quantity,
            dollar_amount: request.dollar_amount,
            reference_price: quote.price,
            status: OrderStatus::Pending,
            notes: request.notes.clone(),
            created_at: now,
            updated_at: now,
            executed_price: None,
            executed_at: None,
            transaction_id: None,
            cancel_reason: None,
        };
        self.store.insert_queued_order(&order)?;
        log::info!(
            "Queued {} ({}) until {:?}",
            order,
            status.market_state,
            status.next_trading_session
        );
        let message = format!("Queued {} {} until the market opens", order.side, order.symbol);
        self.record(user_id, ActivityKind::OrderQueued, message);

        Ok(OrderOutcome::Queued {
            order,
            next_session: status.next_trading_session,
        })
    }

    /// Place a limit order. It is only ever executed by the sweep.
    pub async fn submit_limit_order(&self, user_id: &str, request: &LimitOrderRequest) -> Result<OrderOutcome> {
        let now = self.clock.now();
        let session = self.open_session(now)?;
        let instrument = self.instrument(request.order.instrument_id)?;
        let position = self.position(user_id, &session, &instrument)?;

        // The limit price is what gets validated. A current quote only stands
        // in when the limit price itself is unusable.
        let reference = match self.quotes.quote(&instrument.symbol).await {
            Ok(quote) => quote.price,
            Err(e) => {
                log::debug!("No reference quote for limit order on {}: {}", instrument.symbol, e);
                request.limit_price
            }
        };
        let ctx = OrderContext {
            instrument: Some(&instrument),
            price: reference,
            cash: position.cash,
            held: position.held,
            now,
        };
        let terms = LimitTerms {
            limit_price: request.limit_price,
            expire_at: request.expire_at,
        };
        let validated = self.validator.validate_limit(&request.order, &terms, &ctx)?;

        let portfolio = match position.portfolio {
            Some(portfolio) => portfolio,
            None => self.store.get_or_create_portfolio(user_id, &session, now)?,
        };
        let order = LimitOrder {
            id: Uuid::new_v4(),
            portfolio_id: portfolio.id,
            instrument_id: instrument.id,
            symbol: instrument.symbol.clone(),
            side: request.order.side,
            quantity: validated.quantity,
            limit_price: request.limit_price,
            expire_at: request.expire_at,
            status: OrderStatus::Pending,
            notes: request.order.notes.clone(),
            created_at: now,
            updated_at: now,
            executed_price: None,
            executed_at: None,
            transaction_id: None,
            cancel_reason: None,
        };
        self.store.insert_limit_order(&order)?;
        log::info!("Placed {}", order);
        let message = format!(
            "Placed limit {} {} {} at {}",
            order.side,
            order.quantity.normalize(),
            order.symbol,
            order.limit_price
        );
        self.record(user_id, ActivityKind::LimitPlaced, message);

        Ok(OrderOutcome::LimitPlaced { order })
    }

    /// Cancel one of the user's pending orders, of either kind
    pub fn cancel_order(&self, user_id: &str, order_id: OrderId) -> Result<PendingOrder> {
        let now = self.clock.now();
        let reason = "Cancelled by user";

        if let Some(order) = self.store.get_queued_order(order_id)? {
            self.ensure_owner(user_id, order.portfolio_id, order_id)?;
            self.store.cancel_queued_order(order_id, reason, now)?;
            let message = format!("Cancelled queued {} {}", order.side, order.symbol);
            self.record(user_id, ActivityKind::OrderCancelled, message);
            let order = self.store.get_queued_order(order_id)?.unwrap_or(order);
            return Ok(PendingOrder::Market(order));
        }

        if let Some(order) = self.store.get_limit_order(order_id)? {
            self.ensure_owner(user_id, order.portfolio_id, order_id)?;
            self.store.cancel_limit_order(order_id, reason, now)?;
            let message = format!(
                "Cancelled limit {} {} at {}",
                order.side, order.symbol, order.limit_price
            );
            self.record(user_id, ActivityKind::OrderCancelled, message);
            let order = self.store.get_limit_order(order_id)?.unwrap_or(order);
            return Ok(PendingOrder::Limit(order));
        }

        Err(PaperError::NotFound(format!("Order {}", order_id)))
    }

    /// Cash, holdings at current quotes and total equity.
    ///
    /// Holdings without a quote keep their cost data but carry no market
    /// value.
    pub async fn portfolio_snapshot(&self, user_id: &str) -> Result<PortfolioSnapshot> {
        let now = self.clock.now();
        let session = self.store.active_session()?.ok_or(PaperError::NoActiveSession)?;
        let portfolio = self.portfolio_for(user_id, &session)?;
        let holdings = self.store.holdings(portfolio.id)?;

        let prices = join_all(holdings.iter().map(|h| self.quotes.quote(&h.symbol))).await;
        let valuations = holdings
            .into_iter()
            .zip(prices)
            .map(|(holding, quote)| {
                let price = match quote {
                    Ok(quote) => Some(quote.price),
                    Err(e) => {
                        log::warn!("Valuing {} without a price: {}", holding.symbol, e);
                        None
                    }
                };
                HoldingValuation::new(holding, price)
            })
            .collect();

        Ok(PortfolioSnapshot::new(portfolio, valuations, session.starting_cash, now))
    }

    /// Executed trades, newest first
    pub fn transactions(&self, user_id: &str) -> Result<Vec<Transaction>> {
        let session = self.store.active_session()?.ok_or(PaperError::NoActiveSession)?;
        match self.store.find_portfolio(user_id, session.id)? {
            Some(portfolio) => self.store.transactions(portfolio.id),
            None => Ok(Vec::new()),
        }
    }

    /// Still-pending queued market and limit orders
    pub fn pending_orders(&self, user_id: &str) -> Result<Vec<PendingOrder>> {
        let session = self.store.active_session()?.ok_or(PaperError::NoActiveSession)?;
        let portfolio = match self.store.find_portfolio(user_id, session.id)? {
            Some(portfolio) => portfolio,
            None => return Ok(Vec::new()),
        };

        let mut orders: Vec<PendingOrder> = self
            .store
            .queued_orders_for(portfolio.id)?
            .into_iter()
            .filter(|o| o.is_pending())
            .map(PendingOrder::Market)
            .collect();
        orders.extend(
            self.store
                .limit_orders_for(portfolio.id)?
                .into_iter()
                .filter(|o| o.is_pending())
                .map(PendingOrder::Limit),
        );
        Ok(orders)
    }

    fn open_session(&self, now: Timestamp) -> Result<GameSession> {
        let session = self.store.active_session()?.ok_or(PaperError::NoActiveSession)?;
        if !session.is_open_at(now) {
            return Err(ValidationFailure::new(
                ValidationRule::SessionClosed,
                format!("Session {} is not accepting orders", session.name),
            )
            .into());
        }
        Ok(session)
    }

    fn instrument(&self, instrument_id: u64) -> Result<Asset> {
        self.store.get_instrument(instrument_id)?.ok_or_else(|| {
            ValidationFailure::new(
                ValidationRule::UnknownInstrument,
                format!("Unknown instrument {}", instrument_id),
            )
            .into()
        })
    }

    fn position(&self, user_id: &str, session: &GameSession, instrument: &Asset) -> Result<Position> {
        let portfolio = self.store.find_portfolio(user_id, session.id)?;
        let (cash, held) = match &portfolio {
            Some(portfolio) => {
                let held = self
                    .store
                    .holding(portfolio.id, instrument.id)?
                    .map(|h| h.quantity)
                    .unwrap_or(Decimal::ZERO);
                (portfolio.cash, held)
            }
            // First trade: the portfolio does not exist yet
            None => (session.starting_cash, Decimal::ZERO),
        };
        Ok(Position { portfolio, cash, held })
    }

    fn portfolio_for(&self, user_id: &str, session: &GameSession) -> Result<Portfolio> {
        self.store
            .find_portfolio(user_id, session.id)?
            .ok_or_else(|| PaperError::NotFound(format!("Portfolio for {}", user_id)))
    }

    fn ensure_owner(&self, user_id: &str, portfolio_id: Uuid, order_id: OrderId) -> Result<()> {
        match self.store.get_portfolio(portfolio_id)? {
            Some(portfolio) if portfolio.user_id == user_id => Ok(()),
            _ => Err(PaperError::NotFound(format!("Order {}", order_id))),
        }
    }

    /// Best-effort feed entry
    fn record(&self, user_id: &str, kind: ActivityKind, message: String) {
        if let Err(e) = self.store.record_activity(&Activity::new(user_id, kind, message)) {
            log::warn!("Failed to record {} activity for {}: {}", kind.as_str(), user_id, e);
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("quotes", &self.quotes.name())
            .field("oracle", &self.oracle)
            .field("ledger", &self.ledger)
            .field("hooks", &self.hooks)
            .finish()
    }
}

pub(crate) fn trade_for(portfolio: &Portfolio, order: &ValidatedOrder) -> Trade {
    trade_at(portfolio.id, order, order.price)
}

pub(crate) fn trade_at(portfolio_id: Uuid, order: &ValidatedOrder, price: Price) -> Trade {
    Trade {
        portfolio_id,
        instrument_id: order.instrument_id,
        symbol: order.symbol.clone(),
        side: order.side,
        quantity: order.quantity,
        price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::ManualClock;
    use crate::hooks::ChannelHook;
    use crate::order::OrderSide;
    use crate::quotes::InMemoryQuoteSource;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    struct Harness {
        engine: ExecutionEngine,
        quotes: Arc<InMemoryQuoteSource>,
        clock: Arc<ManualClock>,
    }

    /// Wednesday 2024-03-13 11:00 New York
    fn open_time() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 13, 15, 0, 0).unwrap()
    }

    /// Saturday 2024-03-16 noon New York
    fn weekend_time() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 16, 16, 0, 0).unwrap()
    }

    fn harness(now: Timestamp) -> Harness {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let session = GameSession::new("Spring League", dec!(10000), now - Duration::days(30));
        store.insert_session(&session).unwrap();
        store.activate_session(session.id).unwrap();
        store.insert_instrument(&Asset::stock(1, "AAPL", "NASDAQ")).unwrap();
        store.insert_instrument(&Asset::fund(2, "VTI").fractional()).unwrap();

        let quotes = Arc::new(InMemoryQuoteSource::new());
        quotes.set_price("AAPL", dec!(50));
        quotes.set_price("VTI", dec!(20));

        let clock = Arc::new(ManualClock::new(now));
        let engine = ExecutionEngine::new(store, quotes.clone(), MarketOracle::nyse())
            .with_clock(clock.clone());
        Harness { engine, quotes, clock }
    }

    fn rule(err: PaperError) -> ValidationRule {
        match err {
            PaperError::ValidationFailed(failure) => failure.rule,
            other => panic!("expected validation failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_market_buy_executes_when_open() {
        let h = harness(open_time());
        let outcome = h
            .engine
            .submit_market_order("alice", &OrderRequest::buy_quantity(1, dec!(10)))
            .await
            .unwrap();

        match outcome {
            OrderOutcome::Executed { transaction, new_cash } => {
                assert_eq!(transaction.price, dec!(50));
                assert_eq!(new_cash, dec!(9500));
            }
            other => panic!("expected execution, got {:?}", other),
        }
        assert_eq!(h.engine.transactions("alice").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_market_order_queued_when_closed() {
        let h = harness(weekend_time());
        let outcome = h
            .engine
            .submit_market_order("alice", &OrderRequest::buy_amount(2, dec!(1000)))
            .await
            .unwrap();

        assert_eq!(outcome.label(), "QUEUED");
        match outcome {
            OrderOutcome::Queued { order, next_session } => {
                assert_eq!(order.quantity, None);
                assert_eq!(order.dollar_amount, Some(dec!(1000)));
                assert_eq!(order.reference_price, dec!(20));
                // Monday 09:30 New York
                assert_eq!(next_session, Some(Utc.with_ymd_and_hms(2024, 3, 18, 13, 30, 0).unwrap()));
            }
            other => panic!("expected queued order, got {:?}", other),
        }
        // Cash untouched while queued
        let snapshot = h.engine.portfolio_snapshot("alice").await.unwrap();
        assert_eq!(snapshot.portfolio.cash, dec!(10000));
        assert_eq!(h.engine.pending_orders("alice").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_oversell_rejected_without_mutation() {
        let h = harness(open_time());
        h.engine
            .submit_market_order("alice", &OrderRequest::buy_quantity(1, dec!(10)))
            .await
            .unwrap();

        let err = h
            .engine
            .submit_market_order("alice", &OrderRequest::sell_quantity(1, dec!(11)))
            .await
            .unwrap_err();
        assert_eq!(rule(err), ValidationRule::InsufficientShares);

        let snapshot = h.engine.portfolio_snapshot("alice").await.unwrap();
        assert_eq!(snapshot.portfolio.cash, dec!(9500));
        assert_eq!(snapshot.holdings[0].holding.quantity, dec!(10));
    }

    #[tokio::test]
    async fn test_rejections() {
        let h = harness(open_time());
        let err = h
            .engine
            .submit_market_order("alice", &OrderRequest::buy_quantity(42, dec!(1)))
            .await
            .unwrap_err();
        assert_eq!(rule(err), ValidationRule::UnknownInstrument);

        h.quotes.remove("AAPL");
        let err = h
            .engine
            .submit_market_order("alice", &OrderRequest::buy_quantity(1, dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, PaperError::PriceUnavailable { .. }));

        // No portfolio is created by a rejected order
        assert!(h.engine.transactions("alice").unwrap().is_empty());
        assert!(matches!(
            h.engine.portfolio_snapshot("alice").await,
            Err(PaperError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_session_rules() {
        let h = harness(open_time());
        let ended = GameSession::new("Old League", dec!(5000), open_time() - Duration::days(60))
            .ending_at(open_time() - Duration::days(1));
        h.engine.store().insert_session(&ended).unwrap();
        h.engine.store().activate_session(ended.id).unwrap();

        let err = h
            .engine
            .submit_market_order("alice", &OrderRequest::buy_quantity(1, dec!(1)))
            .await
            .unwrap_err();
        assert_eq!(rule(err), ValidationRule::SessionClosed);

        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine = ExecutionEngine::new(store, h.quotes.clone(), MarketOracle::nyse())
            .with_clock(h.clock.clone());
        let err = engine
            .submit_market_order("alice", &OrderRequest::buy_quantity(1, dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, PaperError::NoActiveSession));
    }

    #[tokio::test]
    async fn test_limit_order_placed_and_cancelled() {
        let h = harness(open_time());
        let request = LimitOrderRequest::new(OrderRequest::buy_quantity(1, dec!(10)), dec!(49));
        let outcome = h.engine.submit_limit_order("alice", &request).await.unwrap();
        let order_id = outcome.order_id().unwrap();
        assert_eq!(outcome.label(), "PENDING");

        // Someone else cannot see or cancel it
        assert!(matches!(
            h.engine.cancel_order("mallory", order_id),
            Err(PaperError::NotFound(_))
        ));

        let cancelled = h.engine.cancel_order("alice", order_id).unwrap();
        assert_eq!(cancelled.status(), OrderStatus::Cancelled);

        let again = h.engine.cancel_order("alice", order_id).unwrap_err();
        assert!(matches!(again, PaperError::StateConflict { .. }));
        assert!(h.engine.pending_orders("alice").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_limit_buy_checked_at_limit_price() {
        let h = harness(open_time());
        // 250 shares at 40 costs 10000, at the 50 quote it would not fit
        let request = LimitOrderRequest::new(OrderRequest::buy_quantity(1, dec!(250)), dec!(40));
        assert!(h.engine.submit_limit_order("alice", &request).await.is_ok());

        let past = LimitOrderRequest::new(OrderRequest::buy_quantity(1, dec!(1)), dec!(40))
            .expiring_at(open_time() - Duration::hours(1));
        let err = h.engine.submit_limit_order("alice", &past).await.unwrap_err();
        assert_eq!(rule(err), ValidationRule::ExpirationInPast);
    }

    #[tokio::test]
    async fn test_hooks_receive_settlement() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let session = GameSession::new("League", dec!(1000), open_time() - Duration::days(1));
        store.insert_session(&session).unwrap();
        store.activate_session(session.id).unwrap();
        store.insert_instrument(&Asset::stock(1, "AAPL", "NASDAQ")).unwrap();
        let quotes = Arc::new(InMemoryQuoteSource::new());
        quotes.set_price("AAPL", dec!(10));

        let (channel, mut receiver) = ChannelHook::new();
        let mut hooks = HookRunner::new();
        hooks.register(Arc::new(channel));
        let engine = ExecutionEngine::new(store, quotes, MarketOracle::nyse())
            .with_clock(Arc::new(ManualClock::new(open_time())))
            .with_hooks(hooks);

        engine
            .submit_market_order("bob", &OrderRequest::new(1, OrderSide::Buy).with_quantity(dec!(3)))
            .await
            .unwrap();
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.user_id, "bob");
        assert_eq!(outcome.new_cash, dec!(970));
    }
}

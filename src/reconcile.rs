//! Reconciliation sweep
//!
//! Drains deferred orders through the same validator and ledger as immediate
//! orders. One run goes through four passes in order:
//!
//! 1. queued market orders, when the market is tradable
//! 2. limit order triggers
//! 3. limit order expiration
//! 4. cleanup of orders pending for too long
//!
//! A failure on one order lands in the run summary and never stops the run.

use crate::config::EngineConfig;
use crate::engine::{trade_at, ExecutionEngine};
use crate::error::{PaperError, Result, ValidationFailure};
use crate::finance::constants::{LIMIT_ORDER_MAX_AGE_DAYS, QUEUED_ORDER_MAX_AGE_DAYS};
use crate::finance::validator::OrderContext;
use crate::order::{LimitOrder, OrderRequest, QueuedMarketOrder};
use crate::store::{OrderClaim, SettleOutcome};
use crate::types::{OrderId, Price, Symbol, Timestamp};
use chrono::Duration;
use futures::future::join_all;
use hashbrown::{HashMap, HashSet};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

/// Tunables for the sweep
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepSettings {
    /// Only evaluate limit triggers while the market is tradable
    pub limit_orders_require_open_market: bool,
    pub queued_max_age: Duration,
    pub limit_max_age: Duration,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            limit_orders_require_open_market: false,
            queued_max_age: Duration::days(QUEUED_ORDER_MAX_AGE_DAYS),
            limit_max_age: Duration::days(LIMIT_ORDER_MAX_AGE_DAYS),
        }
    }
}

impl From<&EngineConfig> for SweepSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            limit_orders_require_open_market: config.limit_orders_require_open_market,
            queued_max_age: Duration::days(config.cleanup.queued_max_age_days),
            limit_max_age: Duration::days(config.cleanup.limit_max_age_days),
        }
    }
}

/// Per-order failure, left pending for the next run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepError {
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub message: String,
}

/// Outcome of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    /// Orders evaluated for execution
    pub processed: usize,
    pub executed: usize,
    pub expired: usize,
    /// Cancelled for age
    pub cleaned: usize,
    /// Cancelled because re-validation failed
    pub cancelled: usize,
    pub errors: Vec<SweepError>,
}

impl SweepSummary {
    pub fn is_quiet(&self) -> bool {
        self.processed == 0 && self.expired == 0 && self.cleaned == 0 && self.errors.is_empty()
    }
}

/// Cumulative counters across runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub runs: u64,
    pub total_processed: u64,
    pub total_executed: u64,
    pub total_expired: u64,
    pub total_cleaned: u64,
    pub total_cancelled: u64,
    pub total_errors: u64,
    pub last_run_at: Option<Timestamp>,
    pub last_summary: Option<SweepSummary>,
    /// Read from storage when stats are requested
    pub pending_queued: usize,
    pub pending_limit: usize,
    pub expired_limit_total: usize,
}

impl ProcessingStats {
    fn record(&mut self, summary: &SweepSummary, at: Timestamp) {
        self.runs += 1;
        self.total_processed += summary.processed as u64;
        self.total_executed += summary.executed as u64;
        self.total_expired += summary.expired as u64;
        self.total_cleaned += summary.cleaned as u64;
        self.total_cancelled += summary.cancelled as u64;
        self.total_errors += summary.errors.len() as u64;
        self.last_run_at = Some(at);
        self.last_summary = Some(summary.clone());
    }
}

/// How one deferred order fared
enum Attempt {
    Executed(Box<SettleOutcome>),
    Rejected(ValidationFailure),
    /// Another actor moved the order out of PENDING first
    Lost,
}

pub struct Reconciler {
    engine: Arc<ExecutionEngine>,
    settings: SweepSettings,
    stats: Mutex<ProcessingStats>,
    running: tokio::sync::Mutex<()>,
}

impl Reconciler {
    pub fn new(engine: Arc<ExecutionEngine>, settings: SweepSettings) -> Self {
        Self {
            engine,
            settings,
            stats: Mutex::new(ProcessingStats::default()),
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn settings(&self) -> &SweepSettings {
        &self.settings
    }

    /// Counters so far plus current pending counts from storage
    pub fn stats(&self) -> Result<ProcessingStats> {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let store = self.engine.store();
        let (queued, limit) = store.pending_counts()?;
        stats.pending_queued = queued;
        stats.pending_limit = limit;
        stats.expired_limit_total = store.expired_limit_count()?;
        Ok(stats)
    }

    /// Run one sweep at the engine clock's current time.
    ///
    /// Overlapping calls wait for each other.
    pub async fn run_once(&self) -> Result<SweepSummary> {
        let _running = self.running.lock().await;
        let now = self.engine.clock().now();
        let summary = self.sweep(now).await?;

        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&summary, now);

        if summary.is_quiet() {
            log::debug!("Sweep found nothing to do");
        } else {
            log::info!(
                "Sweep: {} processed, {} executed, {} cancelled, {} expired, {} cleaned, {} errors",
                summary.processed,
                summary.executed,
                summary.cancelled,
                summary.expired,
                summary.cleaned,
                summary.errors.len()
            );
        }
        Ok(summary)
    }

    async fn sweep(&self, now: Timestamp) -> Result<SweepSummary> {
        let store = self.engine.store();
        let status = self.engine.oracle().status(now);
        let evaluate_limits = status.can_execute_orders || !self.settings.limit_orders_require_open_market;

        let queued = store.pending_queued_orders()?;
        let limits = store.pending_limit_orders()?;

        let mut symbols: HashSet<Symbol> = HashSet::new();
        if status.can_execute_orders {
            symbols.extend(queued.iter().map(|o| o.symbol.clone()));
        }
        if evaluate_limits {
            symbols.extend(limits.iter().filter(|o| !o.is_expired(now)).map(|o| o.symbol.clone()));
        }
        let prices = self.fetch_prices(symbols).await;

        let mut summary = SweepSummary::default();
        let mut settled: HashSet<OrderId> = HashSet::new();

        if status.can_execute_orders {
            for order in &queued {
                summary.processed += 1;
                match price_for(&prices, &order.symbol) {
                    Ok(price) => {
                        let attempt = self.execute_queued(order, price, now);
                        self.apply(attempt, order.id, &order.symbol, now, true, &mut summary, &mut settled);
                    }
                    Err(message) => push_error(&mut summary, order.id, &order.symbol, message),
                }
            }
        } else if !queued.is_empty() {
            log::debug!(
                "Market {}: {} queued orders wait for the next session",
                status.market_state,
                queued.len()
            );
        }

        if evaluate_limits {
            for order in limits.iter().filter(|o| !o.is_expired(now)) {
                summary.processed += 1;
                let price = match price_for(&prices, &order.symbol) {
                    Ok(price) => price,
                    Err(message) => {
                        push_error(&mut summary, order.id, &order.symbol, message);
                        continue;
                    }
                };
                if !order.triggers_at(price) {
                    continue;
                }
                log::info!("{} triggered at {}", order, price);
                let attempt = self.execute_limit(order, price, now);
                self.apply(attempt, order.id, &order.symbol, now, false, &mut summary, &mut settled);
            }
        }

        for order in limits.iter().filter(|o| o.is_expired(now)) {
            match store.expire_limit_order(order.id, now) {
                Ok(()) => {
                    log::info!("Expired {}", order);
                    summary.expired += 1;
                }
                Err(PaperError::StateConflict { .. }) => {}
                Err(e) => push_error(&mut summary, order.id, &order.symbol, e.to_string()),
            }
        }

        for order in queued
            .iter()
            .filter(|o| !settled.contains(&o.id) && o.is_stale(now, self.settings.queued_max_age))
        {
            let reason = format!(
                "Not executed within {} days",
                self.settings.queued_max_age.num_days()
            );
            self.clean(store.cancel_queued_order(order.id, &reason, now), order.id, &order.symbol, &mut summary);
        }
        for order in limits
            .iter()
            .filter(|o| !settled.contains(&o.id) && o.is_stale(now, self.settings.limit_max_age))
        {
            let reason = format!(
                "Not filled within {} days",
                self.settings.limit_max_age.num_days()
            );
            self.clean(store.cancel_limit_order(order.id, &reason, now), order.id, &order.symbol, &mut summary);
        }

        Ok(summary)
    }

    /// One fresh quote per distinct symbol, fetched concurrently
    async fn fetch_prices(&self, symbols: HashSet<Symbol>) -> HashMap<Symbol, std::result::Result<Price, String>> {
        let quotes = self.engine.quotes();
        let symbols: Vec<Symbol> = symbols.into_iter().collect();
        let results = join_all(symbols.iter().map(|s| quotes.fresh_quote(s))).await;
        symbols
            .into_iter()
            .zip(results)
            .map(|(symbol, result)| {
                let price = result.map(|q| q.price).map_err(|e| e.to_string());
                (symbol, price)
            })
            .collect()
    }

    fn execute_queued(&self, order: &QueuedMarketOrder, price: Price, now: Timestamp) -> Result<Attempt> {
        let request = OrderRequest {
            instrument_id: order.instrument_id,
            side: order.side,
            quantity: order.quantity,
            dollar_amount: order.dollar_amount,
            notes: order.notes.clone(),
        };
        self.execute(&request, order.portfolio_id, OrderClaim::Queued(order.id), price, now)
    }

    fn execute_limit(&self, order: &LimitOrder, price: Price, now: Timestamp) -> Result<Attempt> {
        let request = OrderRequest {
            instrument_id: order.instrument_id,
            side: order.side,
            quantity: Some(order.quantity),
            dollar_amount: None,
            notes: order.notes.clone(),
        };
        self.execute(&request, order.portfolio_id, OrderClaim::Limit(order.id), price, now)
    }

    /// Re-validate against current cash and holdings, then settle and claim
    /// the order in one transaction
    fn execute(
        &self,
        request: &OrderRequest,
        portfolio_id: uuid::Uuid,
        claim: OrderClaim,
        price: Price,
        now: Timestamp,
    ) -> Result<Attempt> {
        let store = self.engine.store();
        let portfolio = store
            .get_portfolio(portfolio_id)?
            .ok_or_else(|| PaperError::NotFound(format!("Portfolio {}", portfolio_id)))?;
        let instrument = store.get_instrument(request.instrument_id)?;
        let held = store
            .holding(portfolio_id, request.instrument_id)?
            .map(|h| h.quantity)
            .unwrap_or(Decimal::ZERO);

        let ctx = OrderContext {
            instrument: instrument.as_ref(),
            price,
            cash: portfolio.cash,
            held,
            now,
        };
        let validated = match self.engine.validator().validate(request, &ctx) {
            Ok(validated) => validated,
            Err(failure) => return Ok(Attempt::Rejected(failure)),
        };

        let trade = trade_at(portfolio_id, &validated, price);
        match store.settle_trade(self.engine.ledger(), &trade, claim, request.notes.clone(), now) {
            Ok(outcome) => Ok(Attempt::Executed(Box::new(outcome))),
            Err(PaperError::ValidationFailed(failure)) => Ok(Attempt::Rejected(failure)),
            Err(PaperError::StateConflict { .. }) => Ok(Attempt::Lost),
            Err(e) => Err(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply(
        &self,
        attempt: Result<Attempt>,
        order_id: OrderId,
        symbol: &str,
        now: Timestamp,
        queued: bool,
        summary: &mut SweepSummary,
        settled: &mut HashSet<OrderId>,
    ) {
        match attempt {
            Ok(Attempt::Executed(outcome)) => {
                summary.executed += 1;
                settled.insert(order_id);
                self.engine.hooks().dispatch(&outcome);
            }
            Ok(Attempt::Rejected(failure)) => {
                log::info!("Cancelling order {} on {}: {}", order_id, symbol, failure);
                let store = self.engine.store();
                let result = if queued {
                    store.cancel_queued_order(order_id, &failure.message, now)
                } else {
                    store.cancel_limit_order(order_id, &failure.message, now)
                };
                match result {
                    Ok(()) => summary.cancelled += 1,
                    Err(PaperError::StateConflict { .. }) => {}
                    Err(e) => push_error(summary, order_id, symbol, e.to_string()),
                }
                settled.insert(order_id);
            }
            Ok(Attempt::Lost) => {
                log::debug!("Order {} left PENDING before the sweep reached it", order_id);
                settled.insert(order_id);
            }
            Err(e) => push_error(summary, order_id, symbol, e.to_string()),
        }
    }

    fn clean(&self, result: Result<()>, order_id: OrderId, symbol: &str, summary: &mut SweepSummary) {
        match result {
            Ok(()) => {
                log::info!("Cleaned up stale order {} on {}", order_id, symbol);
                summary.cleaned += 1;
            }
            Err(PaperError::StateConflict { .. }) => {}
            Err(e) => push_error(summary, order_id, symbol, e.to_string()),
        }
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("settings", &self.settings)
            .finish()
    }
}

fn price_for(
    prices: &HashMap<Symbol, std::result::Result<Price, String>>,
    symbol: &str,
) -> std::result::Result<Price, String> {
    prices
        .get(symbol)
        .cloned()
        .unwrap_or_else(|| Err(format!("no quote fetched for {}", symbol)))
}

fn push_error(summary: &mut SweepSummary, order_id: OrderId, symbol: &str, message: String) {
    log::warn!("Sweep left order {} on {} pending: {}", order_id, symbol, message);
    summary.errors.push(SweepError {
        order_id,
        symbol: symbol.to_string(),
        message,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Asset;
    use crate::calendar::{ManualClock, MarketOracle};
    use crate::engine::OrderOutcome;
    use crate::order::{LimitOrderRequest, OrderStatus};
    use crate::quotes::InMemoryQuoteSource;
    use crate::session::GameSession;
    use crate::store::Store;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    struct Harness {
        engine: Arc<ExecutionEngine>,
        reconciler: Reconciler,
        quotes: Arc<InMemoryQuoteSource>,
        clock: Arc<ManualClock>,
    }

    /// Saturday 2024-03-16 noon New York
    fn saturday() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 16, 16, 0, 0).unwrap()
    }

    /// Monday 2024-03-18 10:00 New York
    fn monday_open() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 18, 14, 0, 0).unwrap()
    }

    fn harness(now: Timestamp) -> Harness {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let session = GameSession::new("League", dec!(10000), now - Duration::days(30));
        store.insert_session(&session).unwrap();
        store.activate_session(session.id).unwrap();
        store.insert_instrument(&Asset::stock(1, "AAPL", "NASDAQ")).unwrap();
        store.insert_instrument(&Asset::fund(2, "VTI").fractional()).unwrap();

        let quotes = Arc::new(InMemoryQuoteSource::new());
        quotes.set_price("AAPL", dec!(55));
        quotes.set_price("VTI", dec!(20));
        let clock = Arc::new(ManualClock::new(now));
        let engine = Arc::new(
            ExecutionEngine::new(store, quotes.clone(), MarketOracle::nyse()).with_clock(clock.clone()),
        );
        let reconciler = Reconciler::new(engine.clone(), SweepSettings::default());
        Harness {
            engine,
            reconciler,
            quotes,
            clock,
        }
    }

    #[tokio::test]
    async fn test_limit_buy_waits_then_fills_at_trigger_price() {
        let h = harness(monday_open());
        let request = LimitOrderRequest::new(OrderRequest::buy_quantity(1, dec!(10)), dec!(50));
        let order_id = h.engine.submit_limit_order("alice", &request).await.unwrap().order_id().unwrap();

        let summary = h.reconciler.run_once().await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.executed, 0);

        h.quotes.set_price("AAPL", dec!(49));
        let summary = h.reconciler.run_once().await.unwrap();
        assert_eq!(summary.executed, 1);

        let order = h.engine.store().get_limit_order(order_id).unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Executed);
        assert_eq!(order.executed_price, Some(dec!(49)));

        let snapshot = h.engine.portfolio_snapshot("alice").await.unwrap();
        assert_eq!(snapshot.portfolio.cash, dec!(9510));
        assert_eq!(snapshot.holdings[0].holding.average_cost, dec!(49));
    }

    #[tokio::test]
    async fn test_queued_dollar_order_resized_at_execution() {
        let h = harness(saturday());
        let outcome = h
            .engine
            .submit_market_order("alice", &OrderRequest::buy_amount(2, dec!(1000)))
            .await
            .unwrap();
        assert!(matches!(outcome, OrderOutcome::Queued { .. }));

        // Still closed: nothing happens
        let summary = h.reconciler.run_once().await.unwrap();
        assert_eq!(summary.executed, 0);

        h.clock.set(monday_open());
        h.quotes.set_price("VTI", dec!(22));
        let summary = h.reconciler.run_once().await.unwrap();
        assert_eq!(summary.executed, 1);

        let txns = h.engine.transactions("alice").unwrap();
        assert_eq!(txns[0].quantity, dec!(45.454545));
        assert_eq!(txns[0].price, dec!(22));
        assert!(h.engine.pending_orders("alice").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_revalidation_cancels_with_reason() {
        let h = harness(saturday());
        let outcome = h
            .engine
            .submit_market_order("alice", &OrderRequest::buy_quantity(1, dec!(150)))
            .await
            .unwrap();
        let order_id = outcome.order_id().unwrap();

        // 150 @ 55 fit the cash on Saturday, 150 @ 70 does not
        h.clock.set(monday_open());
        h.quotes.set_price("AAPL", dec!(70));
        let summary = h.reconciler.run_once().await.unwrap();
        assert_eq!(summary.cancelled, 1);

        let order = h.engine.store().get_queued_order(order_id).unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert!(order.cancel_reason.unwrap().contains("Insufficient cash"));
    }

    #[tokio::test]
    async fn test_missing_quote_is_reported_and_retried() {
        let h = harness(monday_open());
        let request = LimitOrderRequest::new(OrderRequest::buy_quantity(1, dec!(1)), dec!(60));
        h.engine.submit_limit_order("alice", &request).await.unwrap();

        h.quotes.remove("AAPL");
        let summary = h.reconciler.run_once().await.unwrap();
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.executed, 0);

        h.quotes.set_price("AAPL", dec!(55));
        let summary = h.reconciler.run_once().await.unwrap();
        assert_eq!(summary.executed, 1);
    }

    #[tokio::test]
    async fn test_expiration_and_cleanup() {
        let h = harness(monday_open());
        let expiring = LimitOrderRequest::new(OrderRequest::buy_quantity(1, dec!(1)), dec!(10))
            .expiring_at(monday_open() + Duration::hours(1));
        let expiring_id = h.engine.submit_limit_order("alice", &expiring).await.unwrap().order_id().unwrap();
        let open_ended = LimitOrderRequest::new(OrderRequest::buy_quantity(1, dec!(1)), dec!(10));
        let open_id = h.engine.submit_limit_order("alice", &open_ended).await.unwrap().order_id().unwrap();

        h.clock.advance(Duration::hours(2));
        let summary = h.reconciler.run_once().await.unwrap();
        assert_eq!(summary.expired, 1);
        // The expired order was not evaluated for a trigger
        assert_eq!(summary.processed, 1);

        h.clock.advance(Duration::days(91));
        let summary = h.reconciler.run_once().await.unwrap();
        assert_eq!(summary.cleaned, 1);

        let store = h.engine.store();
        assert_eq!(store.get_limit_order(expiring_id).unwrap().unwrap().status, OrderStatus::Expired);
        assert_eq!(store.get_limit_order(open_id).unwrap().unwrap().status, OrderStatus::Cancelled);

        let stats = h.reconciler.stats().unwrap();
        assert_eq!(stats.runs, 2);
        assert_eq!(stats.total_expired, 1);
        assert_eq!(stats.total_cleaned, 1);
        assert_eq!(stats.pending_limit, 0);
        assert_eq!(stats.expired_limit_total, 1);
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let h = harness(monday_open());
        let request = LimitOrderRequest::new(OrderRequest::buy_quantity(1, dec!(2)), dec!(60));
        h.engine.submit_limit_order("alice", &request).await.unwrap();

        assert_eq!(h.reconciler.run_once().await.unwrap().executed, 1);
        let second = h.reconciler.run_once().await.unwrap();
        assert!(second.is_quiet());
        assert_eq!(h.engine.transactions("alice").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_quotes_fetched_once_per_symbol() {
        let h = harness(monday_open());
        for _ in 0..3 {
            let request = LimitOrderRequest::new(OrderRequest::buy_quantity(1, dec!(1)), dec!(10));
            h.engine.submit_limit_order("alice", &request).await.unwrap();
        }
        let before = h.quotes.request_count();
        h.reconciler.run_once().await.unwrap();
        assert_eq!(h.quotes.request_count() - before, 1);
    }
}

//! Post-settlement hooks
//!
//! Hooks run after the settlement has committed, on spawned tasks. A failing
//! hook is logged and otherwise ignored: it can never undo a trade.

use crate::error::Result;
use crate::order::OrderSide;
use crate::store::{SettleOutcome, Store};
use crate::types::Timestamp;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Kind of activity-feed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityKind {
    Trade,
    OrderQueued,
    LimitPlaced,
    OrderCancelled,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Trade => "TRADE",
            ActivityKind::OrderQueued => "ORDER_QUEUED",
            ActivityKind::LimitPlaced => "LIMIT_PLACED",
            ActivityKind::OrderCancelled => "ORDER_CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "TRADE" => Some(ActivityKind::Trade),
            "ORDER_QUEUED" => Some(ActivityKind::OrderQueued),
            "LIMIT_PLACED" => Some(ActivityKind::LimitPlaced),
            "ORDER_CANCELLED" => Some(ActivityKind::OrderCancelled),
            _ => None,
        }
    }
}

/// Activity-feed entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    pub user_id: String,
    pub kind: ActivityKind,
    pub message: String,
    pub created_at: Timestamp,
}

impl Activity {
    pub fn new(user_id: impl Into<String>, kind: ActivityKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            kind,
            message: message.into(),
            created_at: Utc::now(),
        }
    }

    /// Feed entry describing a settled trade
    pub fn for_trade(outcome: &SettleOutcome) -> Self {
        let txn = &outcome.transaction;
        let verb = match txn.side {
            OrderSide::Buy => "Bought",
            OrderSide::Sell => "Sold",
        };
        let message = format!(
            "{} {} {} at {} ({})",
            verb,
            txn.quantity.normalize(),
            txn.symbol,
            txn.price,
            txn.origin.as_str()
        );
        Self::new(outcome.user_id.clone(), ActivityKind::Trade, message)
    }
}

/// Reaction to a committed settlement
#[async_trait]
pub trait SettlementHook: Send + Sync {
    async fn on_settled(&self, outcome: &SettleOutcome) -> Result<()>;

    fn name(&self) -> &str;
}

/// Writes a feed entry for every trade
pub struct ActivityFeedHook {
    store: Arc<Store>,
}

impl ActivityFeedHook {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SettlementHook for ActivityFeedHook {
    async fn on_settled(&self, outcome: &SettleOutcome) -> Result<()> {
        self.store.record_activity(&Activity::for_trade(outcome))
    }

    fn name(&self) -> &str {
        "activity-feed"
    }
}

/// Forwards settlements to a channel (notifications, tests)
pub struct ChannelHook {
    sender: mpsc::UnboundedSender<SettleOutcome>,
}

impl ChannelHook {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SettleOutcome>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl SettlementHook for ChannelHook {
    async fn on_settled(&self, outcome: &SettleOutcome) -> Result<()> {
        // A dropped receiver just means nobody is listening
        let _ = self.sender.send(outcome.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "channel"
    }
}

/// Registered hooks, dispatched without blocking the caller
#[derive(Clone, Default)]
pub struct HookRunner {
    hooks: Vec<Arc<dyn SettlementHook>>,
}

impl HookRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Arc<dyn SettlementHook>) {
        log::debug!("Registered settlement hook {}", hook.name());
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Spawn every hook for `outcome`. Requires a Tokio runtime.
    pub fn dispatch(&self, outcome: &SettleOutcome) {
        if self.hooks.is_empty() {
            return;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                log::warn!(
                    "No async runtime, skipping {} settlement hooks for transaction {}",
                    self.hooks.len(),
                    outcome.transaction.id
                );
                return;
            }
        };

        for hook in &self.hooks {
            let hook = Arc::clone(hook);
            let outcome = outcome.clone();
            handle.spawn(async move {
                if let Err(e) = hook.on_settled(&outcome).await {
                    log::warn!(
                        "Settlement hook {} failed for transaction {}: {}",
                        hook.name(),
                        outcome.transaction.id,
                        e
                    );
                }
            });
        }
    }
}

impl std::fmt::Debug for HookRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.hooks.iter().map(|h| h.name()).collect();
        f.debug_struct("HookRunner").field("hooks", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PaperError;
    use crate::finance::ledger::{HoldingChange, Settlement, Trade};
    use crate::finance::transaction::{TradeOrigin, Transaction};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn outcome() -> SettleOutcome {
        let trade = Trade {
            portfolio_id: Uuid::new_v4(),
            instrument_id: 1,
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            quantity: dec!(10),
            price: dec!(49),
        };
        let settlement = Settlement {
            trade: trade.clone(),
            quantity: dec!(10),
            fees: dec!(0),
            total: dec!(490),
            previous_cash: dec!(10000),
            new_cash: dec!(9510),
            holding: HoldingChange::Delete {
                portfolio_id: trade.portfolio_id,
                instrument_id: 1,
            },
            realized_pnl: None,
        };
        let transaction: Transaction =
            settlement.to_transaction(TradeOrigin::Limit, None, None, Utc::now());
        SettleOutcome {
            transaction,
            new_cash: dec!(9510),
            settlement,
            user_id: "alice".to_string(),
        }
    }

    struct FailingHook;

    #[async_trait]
    impl SettlementHook for FailingHook {
        async fn on_settled(&self, _outcome: &SettleOutcome) -> Result<()> {
            Err(PaperError::PersistenceFailure("feed offline".to_string()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[test]
    fn test_activity_message() {
        let activity = Activity::for_trade(&outcome());
        assert_eq!(activity.kind, ActivityKind::Trade);
        assert_eq!(activity.message, "Bought 10 AAPL at 49 (LIMIT)");
    }

    #[tokio::test]
    async fn test_failing_hook_does_not_block_others() {
        let (channel, mut receiver) = ChannelHook::new();
        let mut runner = HookRunner::new();
        runner.register(Arc::new(FailingHook));
        runner.register(Arc::new(channel));

        runner.dispatch(&outcome());
        let received = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.user_id, "alice");
    }

    #[tokio::test]
    async fn test_activity_feed_hook_writes_entry() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let hook = ActivityFeedHook::new(store.clone());
        hook.on_settled(&outcome()).await.unwrap();
        assert_eq!(store.activities("alice").unwrap().len(), 1);
    }

    #[test]
    fn test_dispatch_without_runtime_is_noop() {
        let (channel, mut receiver) = ChannelHook::new();
        let mut runner = HookRunner::new();
        runner.register(Arc::new(channel));
        runner.dispatch(&outcome());
        assert!(receiver.try_recv().is_err());
    }
}

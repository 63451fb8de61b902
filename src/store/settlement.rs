//! Atomic settlement
//!
//! Claiming a deferred order, reading cash and holding, applying the ledger
//! effect and appending the transaction all happen in one SQL transaction.
//! Any failure rolls every step back.

use super::orders::{current_status, OrderTable};
use super::{portfolio_from_row, select_holding, Store};
use crate::error::{PaperError, Result};
use crate::finance::ledger::{HoldingChange, Ledger, Settlement, Trade};
use crate::finance::transaction::{TradeOrigin, Transaction};
use crate::types::{Cash, OrderId, Timestamp};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Deferred order a settlement executes, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderClaim {
    /// Market order executed on submission
    Immediate,
    Queued(OrderId),
    Limit(OrderId),
}

impl OrderClaim {
    fn origin(&self) -> TradeOrigin {
        match self {
            OrderClaim::Immediate => TradeOrigin::Immediate,
            OrderClaim::Queued(_) => TradeOrigin::QueuedMarket,
            OrderClaim::Limit(_) => TradeOrigin::Limit,
        }
    }

    fn target(&self) -> Option<(OrderTable, OrderId)> {
        match self {
            OrderClaim::Immediate => None,
            OrderClaim::Queued(id) => Some((OrderTable::Queued, *id)),
            OrderClaim::Limit(id) => Some((OrderTable::Limit, *id)),
        }
    }
}

/// Result of a committed settlement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettleOutcome {
    pub transaction: Transaction,
    pub new_cash: Cash,
    pub settlement: Settlement,
    /// Owner of the portfolio, for post-settlement hooks
    pub user_id: String,
}

fn claim_order(conn: &Connection, table: OrderTable, order_id: OrderId, now: Timestamp) -> Result<()> {
    let sql = format!(
        "UPDATE {} SET status = 'EXECUTED', updated_at = ?1 WHERE id = ?2 AND status = 'PENDING'",
        table.name()
    );
    if conn.execute(&sql, params![now, order_id])? == 1 {
        return Ok(());
    }
    match current_status(conn, table, order_id)? {
        Some(status) => Err(PaperError::StateConflict { order_id, status }),
        None => Err(PaperError::NotFound(format!("Order {}", order_id))),
    }
}

fn apply_holding(conn: &Connection, change: &HoldingChange) -> rusqlite::Result<()> {
    match change {
        HoldingChange::Upsert(holding) => {
            conn.execute(
                "INSERT INTO holdings (portfolio_id, instrument_id, symbol, quantity, average_cost, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (portfolio_id, instrument_id) DO UPDATE SET
                    quantity = excluded.quantity,
                    average_cost = excluded.average_cost,
                    updated_at = excluded.updated_at",
                params![
                    holding.portfolio_id,
                    holding.instrument_id as i64,
                    &holding.symbol,
                    holding.quantity.to_string(),
                    holding.average_cost.to_string(),
                    holding.updated_at,
                ],
            )?;
        }
        HoldingChange::Delete {
            portfolio_id,
            instrument_id,
        } => {
            conn.execute(
                "DELETE FROM holdings WHERE portfolio_id = ?1 AND instrument_id = ?2",
                params![portfolio_id, *instrument_id as i64],
            )?;
        }
    }
    Ok(())
}

fn insert_transaction(conn: &Connection, txn: &Transaction) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO transactions (id, portfolio_id, instrument_id, symbol, side, quantity, price,
                                   fees, total, origin, order_id, notes, executed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            txn.id,
            txn.portfolio_id,
            txn.instrument_id as i64,
            &txn.symbol,
            txn.side.as_str(),
            txn.quantity.to_string(),
            txn.price.to_string(),
            txn.fees.to_string(),
            txn.total.to_string(),
            txn.origin.as_str(),
            txn.order_id,
            &txn.notes,
            txn.executed_at,
        ],
    )?;
    Ok(())
}

impl Store {
    /// Settle `trade` against its portfolio, executing `claim` in the same
    /// transaction.
    ///
    /// A claim on an order that is no longer pending fails with
    /// `StateConflict`. A trade the ledger rejects fails with
    /// `ValidationFailed`. Neither leaves any trace.
    pub fn settle_trade(
        &self,
        ledger: &Ledger,
        trade: &Trade,
        claim: OrderClaim,
        notes: Option<String>,
        now: Timestamp,
    ) -> Result<SettleOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if let Some((table, order_id)) = claim.target() {
            claim_order(&tx, table, order_id, now)?;
        }

        let portfolio = tx
            .query_row(
                "SELECT id, user_id, session_id, cash, created_at, updated_at
                 FROM portfolios WHERE id = ?1",
                params![trade.portfolio_id],
                portfolio_from_row,
            )
            .optional()?
            .ok_or_else(|| PaperError::NotFound(format!("Portfolio {}", trade.portfolio_id)))?;
        let holding = select_holding(&tx, trade.portfolio_id, trade.instrument_id)?;

        let settlement = ledger.settle(portfolio.cash, holding.as_ref(), trade, now)?;

        tx.execute(
            "UPDATE portfolios SET cash = ?1, updated_at = ?2 WHERE id = ?3",
            params![settlement.new_cash.to_string(), now, portfolio.id],
        )?;
        apply_holding(&tx, &settlement.holding)?;

        let order_id = claim.target().map(|(_, id)| id);
        let transaction = settlement.to_transaction(claim.origin(), order_id, notes, now);
        insert_transaction(&tx, &transaction)?;

        if let Some((table, order_id)) = claim.target() {
            let sql = format!(
                "UPDATE {} SET executed_price = ?1, executed_at = ?2, transaction_id = ?3 WHERE id = ?4",
                table.name()
            );
            tx.execute(
                &sql,
                params![trade.price.to_string(), now, transaction.id, order_id],
            )?;
        }

        tx.commit()?;

        log::info!(
            "Settled {} {} {} @ {} for portfolio {} (cash {} -> {})",
            trade.side,
            settlement.quantity,
            trade.symbol,
            trade.price,
            portfolio.id,
            settlement.previous_cash,
            settlement.new_cash
        );

        Ok(SettleOutcome {
            new_cash: settlement.new_cash,
            transaction,
            settlement,
            user_id: portfolio.user_id,
        })
    }
}

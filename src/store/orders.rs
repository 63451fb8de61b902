//! Deferred order records
//!
//! Status only ever moves out of `PENDING`, and every move is a
//! compare-and-swap on the current status. Losing the swap surfaces as
//! `StateConflict`.

use super::{read_decimal, read_enum, read_opt_decimal, Store};
use crate::error::{PaperError, Result};
use crate::order::{LimitOrder, OrderSide, OrderStatus, QueuedMarketOrder};
use crate::types::{OrderId, PortfolioId, Timestamp};
use rusqlite::{params, Connection, OptionalExtension, Row};

const QUEUED_COLUMNS: &str = "id, portfolio_id, instrument_id, symbol, side, quantity, dollar_amount,
    reference_price, status, notes, created_at, updated_at, executed_price, executed_at,
    transaction_id, cancel_reason";

const LIMIT_COLUMNS: &str = "id, portfolio_id, instrument_id, symbol, side, quantity, limit_price,
    expire_at, status, notes, created_at, updated_at, executed_price, executed_at,
    transaction_id, cancel_reason";

/// Which table a deferred order lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OrderTable {
    Queued,
    Limit,
}

impl OrderTable {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            OrderTable::Queued => "queued_orders",
            OrderTable::Limit => "limit_orders",
        }
    }
}

fn queued_from_row(row: &Row<'_>) -> rusqlite::Result<QueuedMarketOrder> {
    Ok(QueuedMarketOrder {
        id: row.get(0)?,
        portfolio_id: row.get(1)?,
        instrument_id: row.get::<_, i64>(2)? as u64,
        symbol: row.get(3)?,
        side: read_enum(row, 4, OrderSide::parse)?,
        quantity: read_opt_decimal(row, 5)?,
        dollar_amount: read_opt_decimal(row, 6)?,
        reference_price: read_decimal(row, 7)?,
        status: read_enum(row, 8, OrderStatus::parse)?,
        notes: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        executed_price: read_opt_decimal(row, 12)?,
        executed_at: row.get(13)?,
        transaction_id: row.get(14)?,
        cancel_reason: row.get(15)?,
    })
}

fn limit_from_row(row: &Row<'_>) -> rusqlite::Result<LimitOrder> {
    Ok(LimitOrder {
        id: row.get(0)?,
        portfolio_id: row.get(1)?,
        instrument_id: row.get::<_, i64>(2)? as u64,
        symbol: row.get(3)?,
        side: read_enum(row, 4, OrderSide::parse)?,
        quantity: read_decimal(row, 5)?,
        limit_price: read_decimal(row, 6)?,
        expire_at: row.get(7)?,
        status: read_enum(row, 8, OrderStatus::parse)?,
        notes: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        executed_price: read_opt_decimal(row, 12)?,
        executed_at: row.get(13)?,
        transaction_id: row.get(14)?,
        cancel_reason: row.get(15)?,
    })
}

/// Current status of an order, `None` if it does not exist
pub(crate) fn current_status(
    conn: &Connection,
    table: OrderTable,
    order_id: OrderId,
) -> rusqlite::Result<Option<OrderStatus>> {
    let sql = format!("SELECT status FROM {} WHERE id = ?1", table.name());
    conn.query_row(&sql, params![order_id], |row| read_enum(row, 0, OrderStatus::parse))
        .optional()
}

/// Move a pending order to `to`, failing if it is no longer pending
pub(crate) fn transition(
    conn: &Connection,
    table: OrderTable,
    order_id: OrderId,
    to: OrderStatus,
    reason: Option<&str>,
    now: Timestamp,
) -> Result<()> {
    let sql = format!(
        "UPDATE {} SET status = ?1, cancel_reason = ?2, updated_at = ?3
         WHERE id = ?4 AND status = 'PENDING'",
        table.name()
    );
    let updated = conn.execute(&sql, params![to.as_str(), reason, now, order_id])?;
    if updated == 1 {
        return Ok(());
    }
    match current_status(conn, table, order_id)? {
        Some(status) => Err(PaperError::StateConflict { order_id, status }),
        None => Err(PaperError::NotFound(format!("Order {}", order_id))),
    }
}

impl Store {
    pub fn insert_queued_order(&self, order: &QueuedMarketOrder) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO queued_orders ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                QUEUED_COLUMNS
            ),
            params![
                order.id,
                order.portfolio_id,
                order.instrument_id as i64,
                &order.symbol,
                order.side.as_str(),
                order.quantity.map(|q| q.to_string()),
                order.dollar_amount.map(|a| a.to_string()),
                order.reference_price.to_string(),
                order.status.as_str(),
                &order.notes,
                order.created_at,
                order.updated_at,
                order.executed_price.map(|p| p.to_string()),
                order.executed_at,
                order.transaction_id,
                &order.cancel_reason,
            ],
        )?;
        Ok(())
    }

    pub fn get_queued_order(&self, order_id: OrderId) -> Result<Option<QueuedMarketOrder>> {
        let conn = self.conn()?;
        let order = conn
            .query_row(
                &format!("SELECT {} FROM queued_orders WHERE id = ?1", QUEUED_COLUMNS),
                params![order_id],
                queued_from_row,
            )
            .optional()?;
        Ok(order)
    }

    /// All pending queued market orders, oldest first
    pub fn pending_queued_orders(&self) -> Result<Vec<QueuedMarketOrder>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM queued_orders WHERE status = 'PENDING' ORDER BY created_at",
            QUEUED_COLUMNS
        ))?;
        let orders = stmt
            .query_map([], queued_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orders)
    }

    /// Every queued market order of a portfolio, newest first
    pub fn queued_orders_for(&self, portfolio_id: PortfolioId) -> Result<Vec<QueuedMarketOrder>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM queued_orders WHERE portfolio_id = ?1 ORDER BY created_at DESC",
            QUEUED_COLUMNS
        ))?;
        let orders = stmt
            .query_map(params![portfolio_id], queued_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orders)
    }

    pub fn insert_limit_order(&self, order: &LimitOrder) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO limit_orders ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                LIMIT_COLUMNS
            ),
            params![
                order.id,
                order.portfolio_id,
                order.instrument_id as i64,
                &order.symbol,
                order.side.as_str(),
                order.quantity.to_string(),
                order.limit_price.to_string(),
                order.expire_at,
                order.status.as_str(),
                &order.notes,
                order.created_at,
                order.updated_at,
                order.executed_price.map(|p| p.to_string()),
                order.executed_at,
                order.transaction_id,
                &order.cancel_reason,
            ],
        )?;
        Ok(())
    }

    pub fn get_limit_order(&self, order_id: OrderId) -> Result<Option<LimitOrder>> {
        let conn = self.conn()?;
        let order = conn
            .query_row(
                &format!("SELECT {} FROM limit_orders WHERE id = ?1", LIMIT_COLUMNS),
                params![order_id],
                limit_from_row,
            )
            .optional()?;
        Ok(order)
    }

    /// All pending limit orders, oldest first
    pub fn pending_limit_orders(&self) -> Result<Vec<LimitOrder>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM limit_orders WHERE status = 'PENDING' ORDER BY created_at",
            LIMIT_COLUMNS
        ))?;
        let orders = stmt
            .query_map([], limit_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orders)
    }

    /// Every limit order of a portfolio, newest first
    pub fn limit_orders_for(&self, portfolio_id: PortfolioId) -> Result<Vec<LimitOrder>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM limit_orders WHERE portfolio_id = ?1 ORDER BY created_at DESC",
            LIMIT_COLUMNS
        ))?;
        let orders = stmt
            .query_map(params![portfolio_id], limit_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orders)
    }

    pub fn cancel_queued_order(&self, order_id: OrderId, reason: &str, now: Timestamp) -> Result<()> {
        let conn = self.conn()?;
        transition(&conn, OrderTable::Queued, order_id, OrderStatus::Cancelled, Some(reason), now)
    }

    pub fn cancel_limit_order(&self, order_id: OrderId, reason: &str, now: Timestamp) -> Result<()> {
        let conn = self.conn()?;
        transition(&conn, OrderTable::Limit, order_id, OrderStatus::Cancelled, Some(reason), now)
    }

    pub fn expire_limit_order(&self, order_id: OrderId, now: Timestamp) -> Result<()> {
        let conn = self.conn()?;
        transition(&conn, OrderTable::Limit, order_id, OrderStatus::Expired, None, now)
    }

    /// (queued, limit) orders still pending
    pub fn pending_counts(&self) -> Result<(usize, usize)> {
        let conn = self.conn()?;
        let queued: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queued_orders WHERE status = 'PENDING'",
            [],
            |row| row.get(0),
        )?;
        let limit: i64 = conn.query_row(
            "SELECT COUNT(*) FROM limit_orders WHERE status = 'PENDING'",
            [],
            |row| row.get(0),
        )?;
        Ok((queued as usize, limit as usize))
    }

    pub fn expired_limit_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let expired: i64 = conn.query_row(
            "SELECT COUNT(*) FROM limit_orders WHERE status = 'EXPIRED'",
            [],
            |row| row.get(0),
        )?;
        Ok(expired as usize)
    }
}

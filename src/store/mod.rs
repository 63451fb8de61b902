//! Durable records with SQLite
//!
//! One connection behind a mutex. Every write goes through it, so settlements
//! for the same portfolio (and in fact all settlements) are serialized, and a
//! settlement's reads and writes share one SQL transaction.

mod orders;
mod settlement;

pub use settlement::{OrderClaim, SettleOutcome};

use crate::asset::{Asset, AssetDetails, AssetType};
use crate::error::{PaperError, Result};
use crate::finance::account::{Holding, Portfolio};
use crate::finance::transaction::{TradeOrigin, Transaction};
use crate::hooks::{Activity, ActivityKind};
use crate::order::OrderSide;
use crate::session::GameSession;
use crate::types::{InstrumentId, PortfolioId, SessionId, Timestamp};
use rust_decimal::Decimal;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS game_sessions (
    id BLOB PRIMARY KEY,
    name TEXT NOT NULL,
    starting_cash TEXT NOT NULL,
    starts_at TEXT NOT NULL,
    ends_at TEXT,
    is_active INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS instruments (
    id INTEGER PRIMARY KEY,
    symbol TEXT NOT NULL UNIQUE,
    name TEXT,
    asset_type TEXT NOT NULL,
    fractional_shares INTEGER NOT NULL DEFAULT 0,
    currency TEXT NOT NULL,
    details TEXT
);

CREATE TABLE IF NOT EXISTS portfolios (
    id BLOB PRIMARY KEY,
    user_id TEXT NOT NULL,
    session_id BLOB NOT NULL REFERENCES game_sessions(id),
    cash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (user_id, session_id)
);

CREATE TABLE IF NOT EXISTS holdings (
    portfolio_id BLOB NOT NULL REFERENCES portfolios(id),
    instrument_id INTEGER NOT NULL REFERENCES instruments(id),
    symbol TEXT NOT NULL,
    quantity TEXT NOT NULL,
    average_cost TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (portfolio_id, instrument_id)
);

CREATE TABLE IF NOT EXISTS transactions (
    id BLOB PRIMARY KEY,
    portfolio_id BLOB NOT NULL REFERENCES portfolios(id),
    instrument_id INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity TEXT NOT NULL,
    price TEXT NOT NULL,
    fees TEXT NOT NULL,
    total TEXT NOT NULL,
    origin TEXT NOT NULL,
    order_id BLOB,
    notes TEXT,
    executed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transactions_portfolio ON transactions(portfolio_id);

CREATE TABLE IF NOT EXISTS queued_orders (
    id BLOB PRIMARY KEY,
    portfolio_id BLOB NOT NULL REFERENCES portfolios(id),
    instrument_id INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity TEXT,
    dollar_amount TEXT,
    reference_price TEXT NOT NULL,
    status TEXT NOT NULL,
    notes TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    executed_price TEXT,
    executed_at TEXT,
    transaction_id BLOB,
    cancel_reason TEXT
);
CREATE INDEX IF NOT EXISTS idx_queued_status ON queued_orders(status);

CREATE TABLE IF NOT EXISTS limit_orders (
    id BLOB PRIMARY KEY,
    portfolio_id BLOB NOT NULL REFERENCES portfolios(id),
    instrument_id INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity TEXT NOT NULL,
    limit_price TEXT NOT NULL,
    expire_at TEXT,
    status TEXT NOT NULL,
    notes TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    executed_price TEXT,
    executed_at TEXT,
    transaction_id BLOB,
    cancel_reason TEXT
);
CREATE INDEX IF NOT EXISTS idx_limit_status ON limit_orders(status);

CREATE TABLE IF NOT EXISTS activities (
    id BLOB PRIMARY KEY,
    user_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_activities_user ON activities(user_id);
";

/// SQLite-backed store for sessions, instruments, portfolios and orders
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Create or open database at path
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(|e| {
            PaperError::PersistenceFailure(format!("Failed to open database: {}", e))
        })?;
        Self::with_connection(conn)
    }

    /// Create in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            PaperError::PersistenceFailure(format!("Failed to create in-memory database: {}", e))
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA).map_err(|e| {
            PaperError::PersistenceFailure(format!("Failed to create tables: {}", e))
        })?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PaperError::PersistenceFailure("database lock poisoned".to_string()))
    }

    // ----- game sessions -----

    pub fn insert_session(&self, session: &GameSession) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO game_sessions (id, name, starting_cash, starts_at, ends_at, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.id,
                &session.name,
                session.starting_cash.to_string(),
                session.starts_at,
                session.ends_at,
                session.is_active,
            ],
        )?;
        Ok(())
    }

    /// Make `session_id` the only active session
    pub fn activate_session(&self, session_id: SessionId) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("UPDATE game_sessions SET is_active = 0", [])?;
        let updated = tx.execute(
            "UPDATE game_sessions SET is_active = 1 WHERE id = ?1",
            params![session_id],
        )?;
        if updated == 0 {
            return Err(PaperError::NotFound(format!("Game session {}", session_id)));
        }
        tx.commit()?;
        log::info!("Activated game session {}", session_id);
        Ok(())
    }

    pub fn active_session(&self) -> Result<Option<GameSession>> {
        let conn = self.conn()?;
        let session = conn
            .query_row(
                "SELECT id, name, starting_cash, starts_at, ends_at, is_active
                 FROM game_sessions WHERE is_active = 1 LIMIT 1",
                [],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    pub fn get_session(&self, session_id: SessionId) -> Result<Option<GameSession>> {
        let conn = self.conn()?;
        let session = conn
            .query_row(
                "SELECT id, name, starting_cash, starts_at, ends_at, is_active
                 FROM game_sessions WHERE id = ?1",
                params![session_id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    // ----- instruments -----

    pub fn insert_instrument(&self, asset: &Asset) -> Result<()> {
        let details = asset
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO instruments (id, symbol, name, asset_type, fractional_shares, currency, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                asset.id as i64,
                &asset.symbol,
                &asset.name,
                asset.asset_type.as_str(),
                asset.fractional_shares,
                &asset.currency,
                details,
            ],
        )?;
        Ok(())
    }

    pub fn get_instrument(&self, instrument_id: InstrumentId) -> Result<Option<Asset>> {
        let conn = self.conn()?;
        let asset = conn
            .query_row(
                "SELECT id, symbol, name, asset_type, fractional_shares, currency, details
                 FROM instruments WHERE id = ?1",
                params![instrument_id as i64],
                asset_from_row,
            )
            .optional()?;
        Ok(asset)
    }

    pub fn find_instrument(&self, symbol: &str) -> Result<Option<Asset>> {
        let conn = self.conn()?;
        let asset = conn
            .query_row(
                "SELECT id, symbol, name, asset_type, fractional_shares, currency, details
                 FROM instruments WHERE symbol = ?1",
                params![symbol.to_ascii_uppercase()],
                asset_from_row,
            )
            .optional()?;
        Ok(asset)
    }

    pub fn list_instruments(&self) -> Result<Vec<Asset>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, symbol, name, asset_type, fractional_shares, currency, details
             FROM instruments ORDER BY symbol",
        )?;
        let assets = stmt
            .query_map([], asset_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(assets)
    }

    // ----- portfolios and holdings -----

    /// The user's portfolio in `session`, created with the session's starting
    /// cash on first use
    pub fn get_or_create_portfolio(
        &self,
        user_id: &str,
        session: &GameSession,
        now: Timestamp,
    ) -> Result<Portfolio> {
        let conn = self.conn()?;
        let created = conn.execute(
            "INSERT OR IGNORE INTO portfolios (id, user_id, session_id, cash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                Uuid::new_v4(),
                user_id,
                session.id,
                session.starting_cash.to_string(),
                now,
            ],
        )?;
        if created > 0 {
            log::info!(
                "Created portfolio for {} in session {} with {}",
                user_id,
                session.name,
                session.starting_cash
            );
        }
        let portfolio = conn.query_row(
            "SELECT id, user_id, session_id, cash, created_at, updated_at
             FROM portfolios WHERE user_id = ?1 AND session_id = ?2",
            params![user_id, session.id],
            portfolio_from_row,
        )?;
        Ok(portfolio)
    }

    pub fn find_portfolio(&self, user_id: &str, session_id: SessionId) -> Result<Option<Portfolio>> {
        let conn = self.conn()?;
        let portfolio = conn
            .query_row(
                "SELECT id, user_id, session_id, cash, created_at, updated_at
                 FROM portfolios WHERE user_id = ?1 AND session_id = ?2",
                params![user_id, session_id],
                portfolio_from_row,
            )
            .optional()?;
        Ok(portfolio)
    }

    pub fn get_portfolio(&self, portfolio_id: PortfolioId) -> Result<Option<Portfolio>> {
        let conn = self.conn()?;
        let portfolio = conn
            .query_row(
                "SELECT id, user_id, session_id, cash, created_at, updated_at
                 FROM portfolios WHERE id = ?1",
                params![portfolio_id],
                portfolio_from_row,
            )
            .optional()?;
        Ok(portfolio)
    }

    pub fn holdings(&self, portfolio_id: PortfolioId) -> Result<Vec<Holding>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT portfolio_id, instrument_id, symbol, quantity, average_cost, updated_at
             FROM holdings WHERE portfolio_id = ?1 ORDER BY symbol",
        )?;
        let holdings = stmt
            .query_map(params![portfolio_id], holding_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(holdings)
    }

    pub fn holding(
        &self,
        portfolio_id: PortfolioId,
        instrument_id: InstrumentId,
    ) -> Result<Option<Holding>> {
        let conn = self.conn()?;
        Ok(select_holding(&conn, portfolio_id, instrument_id)?)
    }

    /// Executed trades, newest first
    pub fn transactions(&self, portfolio_id: PortfolioId) -> Result<Vec<Transaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, portfolio_id, instrument_id, symbol, side, quantity, price, fees, total,
                    origin, order_id, notes, executed_at
             FROM transactions WHERE portfolio_id = ?1 ORDER BY executed_at DESC",
        )?;
        let txns = stmt
            .query_map(params![portfolio_id], transaction_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(txns)
    }

    // ----- activity feed -----

    pub fn record_activity(&self, activity: &Activity) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO activities (id, user_id, kind, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                activity.id,
                &activity.user_id,
                activity.kind.as_str(),
                &activity.message,
                activity.created_at,
            ],
        )?;
        Ok(())
    }

    /// Newest first
    pub fn activities(&self, user_id: &str) -> Result<Vec<Activity>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, kind, message, created_at
             FROM activities WHERE user_id = ?1 ORDER BY created_at DESC",
        )?;
        let activities = stmt
            .query_map(params![user_id], |row| {
                Ok(Activity {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    kind: read_enum(row, 2, ActivityKind::parse)?,
                    message: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(activities)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

// ----- row helpers -----

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

pub(crate) fn read_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text).map_err(|e| conversion_error(idx, format!("bad decimal {}: {}", text, e)))
}

pub(crate) fn read_opt_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        Decimal::from_str(&t).map_err(|e| conversion_error(idx, format!("bad decimal {}: {}", t, e)))
    })
    .transpose()
}

pub(crate) fn read_enum<T>(
    row: &Row<'_>,
    idx: usize,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    parse(&text).ok_or_else(|| conversion_error(idx, format!("unexpected value {}", text)))
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<GameSession> {
    Ok(GameSession {
        id: row.get(0)?,
        name: row.get(1)?,
        starting_cash: read_decimal(row, 2)?,
        starts_at: row.get(3)?,
        ends_at: row.get(4)?,
        is_active: row.get(5)?,
    })
}

fn asset_from_row(row: &Row<'_>) -> rusqlite::Result<Asset> {
    let details: Option<String> = row.get(6)?;
    let details = details
        .map(|json| serde_json::from_str::<AssetDetails>(&json))
        .transpose()
        .map_err(|e| conversion_error(6, format!("bad instrument details: {}", e)))?;
    Ok(Asset {
        id: row.get::<_, i64>(0)? as u64,
        symbol: row.get(1)?,
        name: row.get(2)?,
        asset_type: read_enum(row, 3, AssetType::parse)?,
        fractional_shares: row.get(4)?,
        currency: row.get(5)?,
        details,
    })
}

pub(crate) fn portfolio_from_row(row: &Row<'_>) -> rusqlite::Result<Portfolio> {
    Ok(Portfolio {
        id: row.get(0)?,
        user_id: row.get(1)?,
        session_id: row.get(2)?,
        cash: read_decimal(row, 3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn holding_from_row(row: &Row<'_>) -> rusqlite::Result<Holding> {
    Ok(Holding {
        portfolio_id: row.get(0)?,
        instrument_id: row.get::<_, i64>(1)? as u64,
        symbol: row.get(2)?,
        quantity: read_decimal(row, 3)?,
        average_cost: read_decimal(row, 4)?,
        updated_at: row.get(5)?,
    })
}

pub(crate) fn select_holding(
    conn: &Connection,
    portfolio_id: PortfolioId,
    instrument_id: InstrumentId,
) -> rusqlite::Result<Option<Holding>> {
    conn.query_row(
        "SELECT portfolio_id, instrument_id, symbol, quantity, average_cost, updated_at
         FROM holdings WHERE portfolio_id = ?1 AND instrument_id = ?2",
        params![portfolio_id, instrument_id as i64],
        holding_from_row,
    )
    .optional()
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        portfolio_id: row.get(1)?,
        instrument_id: row.get::<_, i64>(2)? as u64,
        symbol: row.get(3)?,
        side: read_enum(row, 4, OrderSide::parse)?,
        quantity: read_decimal(row, 5)?,
        price: read_decimal(row, 6)?,
        fees: read_decimal(row, 7)?,
        total: read_decimal(row, 8)?,
        origin: read_enum(row, 9, TradeOrigin::parse)?,
        order_id: row.get(10)?,
        notes: row.get(11)?,
        executed_at: row.get(12)?,
    })
}

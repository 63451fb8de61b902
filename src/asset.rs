//! Tradable instrument reference data

use crate::types::{InstrumentId, Symbol};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetType {
    /// Common stock
    Stock,
    /// Fixed income
    Bond,
    /// Mutual fund or ETF
    Fund,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Stock => "STOCK",
            AssetType::Bond => "BOND",
            AssetType::Fund => "FUND",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "STOCK" => Some(AssetType::Stock),
            "BOND" => Some(AssetType::Bond),
            "FUND" | "ETF" => Some(AssetType::Fund),
            _ => None,
        }
    }
}

/// Type-specific extension of an instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssetDetails {
    Stock {
        exchange: String,
        sector: Option<String>,
    },
    Bond {
        /// Annual coupon as a fraction (0.05 = 5%)
        coupon_rate: Decimal,
        maturity: NaiveDate,
        face_value: Decimal,
    },
    Fund {
        /// Annual expense ratio as a fraction
        expense_ratio: Option<Decimal>,
        category: Option<String>,
    },
}

/// Instrument representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    /// Unique instrument identifier
    pub id: InstrumentId,
    /// Ticker symbol
    pub symbol: Symbol,
    /// Display name
    pub name: Option<String>,
    /// Kind of instrument
    pub asset_type: AssetType,
    /// Whether fractional units may be held
    pub fractional_shares: bool,
    /// Quote currency
    pub currency: String,
    /// Type-specific attributes
    pub details: Option<AssetDetails>,
}

impl Asset {
    /// Create a new instrument
    pub fn new(id: InstrumentId, symbol: impl Into<Symbol>, asset_type: AssetType) -> Self {
        Self {
            id,
            symbol: symbol.into(),
            name: None,
            asset_type,
            fractional_shares: false,
            currency: "USD".to_string(),
            details: None,
        }
    }

    /// Create a stock
    pub fn stock(id: InstrumentId, symbol: impl Into<Symbol>, exchange: impl Into<String>) -> Self {
        Self::new(id, symbol, AssetType::Stock).with_details(AssetDetails::Stock {
            exchange: exchange.into(),
            sector: None,
        })
    }

    /// Create a bond
    pub fn bond(
        id: InstrumentId,
        symbol: impl Into<Symbol>,
        coupon_rate: Decimal,
        maturity: NaiveDate,
        face_value: Decimal,
    ) -> Self {
        Self::new(id, symbol, AssetType::Bond).with_details(AssetDetails::Bond {
            coupon_rate,
            maturity,
            face_value,
        })
    }

    /// Create a fund
    pub fn fund(id: InstrumentId, symbol: impl Into<Symbol>) -> Self {
        Self::new(id, symbol, AssetType::Fund).with_details(AssetDetails::Fund {
            expense_ratio: None,
            category: None,
        })
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Allow fractional units
    pub fn fractional(mut self) -> Self {
        self.fractional_shares = true;
        self
    }

    pub fn with_details(mut self, details: AssetDetails) -> Self {
        self.details = Some(details);
        self
    }

    /// Years until a bond matures, `None` for other kinds or matured bonds
    pub fn years_to_maturity(&self, as_of: NaiveDate) -> Option<f64> {
        match &self.details {
            Some(AssetDetails::Bond { maturity, .. }) if *maturity > as_of => {
                Some((*maturity - as_of).num_days() as f64 / 365.25)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Asset({}, {})", self.symbol, self.asset_type)
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

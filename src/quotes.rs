//! Quote sources
//!
//! The market-data provider is an outside collaborator. The engine only needs
//! a current price, its currency and, optionally, the provider's view of the
//! session state.

use crate::cache::TtlCache;
use crate::calendar::MarketState;
use crate::error::{PaperError, Result};
use crate::types::{Price, Symbol, Timestamp};
use async_trait::async_trait;
use chrono::Utc;
use hashbrown::HashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Current price for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: Symbol,
    pub price: Price,
    pub currency: String,
    /// Provider-reported session state, if it sends one
    pub market_state: Option<MarketState>,
    pub as_of: Timestamp,
}

impl Quote {
    pub fn new(symbol: impl Into<Symbol>, price: Price) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            currency: "USD".to_string(),
            market_state: None,
            as_of: Utc::now(),
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn with_market_state(mut self, state: MarketState) -> Self {
        self.market_state = Some(state);
        self
    }
}

/// Quote provider
#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// Current quote for `symbol`, `PriceUnavailable` if there is none
    async fn quote(&self, symbol: &str) -> Result<Quote>;

    /// Quote that bypasses any caching layer. Used to price settlements.
    async fn fresh_quote(&self, symbol: &str) -> Result<Quote> {
        self.quote(symbol).await
    }

    fn name(&self) -> &str {
        "quotes"
    }
}

/// Reject quotes that cannot price a trade
pub fn ensure_usable(quote: Quote) -> Result<Quote> {
    if quote.price <= Decimal::ZERO {
        return Err(PaperError::PriceUnavailable {
            symbol: quote.symbol,
            reason: format!("non-positive price {}", quote.price),
        });
    }
    Ok(quote)
}

/// Quotes held in memory, set by the caller
#[derive(Debug, Default)]
pub struct InMemoryQuoteSource {
    quotes: RwLock<HashMap<Symbol, Quote>>,
    requests: AtomicUsize,
}

impl InMemoryQuoteSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_quote(&self, quote: Quote) {
        self.quotes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(quote.symbol.clone(), quote);
    }

    pub fn set_price(&self, symbol: &str, price: Price) {
        self.set_quote(Quote::new(symbol, price));
    }

    /// Make `symbol` unavailable
    pub fn remove(&self, symbol: &str) {
        self.quotes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(symbol);
    }

    /// Number of `quote` calls served so far
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    /// Load quotes from a CSV file
    /// CSV format: symbol,price[,currency]
    pub fn load_from_csv(&self, path: &Path) -> Result<usize> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|e| PaperError::ConfigError(format!("Failed to read quotes CSV: {}", e)))?;

        let mut loaded = 0;
        for result in reader.records() {
            let record = result
                .map_err(|e| PaperError::ConfigError(format!("Failed to parse CSV row: {}", e)))?;

            if record.len() < 2 {
                continue;
            }

            let symbol = record[0].trim().to_ascii_uppercase();
            let price = Decimal::from_str(record[1].trim()).map_err(|e| {
                PaperError::ConfigError(format!("Invalid price for {}: {}", symbol, e))
            })?;

            let mut quote = Quote::new(symbol, price);
            if let Some(currency) = record.get(2).map(str::trim).filter(|c| !c.is_empty()) {
                quote = quote.with_currency(currency);
            }
            self.set_quote(quote);
            loaded += 1;
        }

        log::debug!("Loaded {} quotes from {}", loaded, path.display());
        Ok(loaded)
    }
}

#[async_trait]
impl QuoteSource for InMemoryQuoteSource {
    async fn quote(&self, symbol: &str) -> Result<Quote> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let quote = self
            .quotes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .cloned()
            .ok_or_else(|| PaperError::PriceUnavailable {
                symbol: symbol.to_string(),
                reason: "no quote".to_string(),
            })?;
        ensure_usable(quote)
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}

/// Wraps a quote source with a TTL cache
///
/// Display paths may read through the cache. Settlement calls `fresh_quote`,
/// which always goes to the inner source and refreshes the cache entry.
pub struct CachedQuoteSource {
    inner: Arc<dyn QuoteSource>,
    cache: TtlCache<Symbol, Quote>,
}

impl CachedQuoteSource {
    pub fn new(inner: Arc<dyn QuoteSource>, ttl: Duration) -> Self {
        Self {
            inner,
            cache: TtlCache::new(ttl),
        }
    }

    pub fn invalidate(&self, symbol: &str) {
        self.cache.invalidate(&symbol.to_string());
    }

    pub fn invalidate_all(&self) {
        self.cache.clear();
    }
}

#[async_trait]
impl QuoteSource for CachedQuoteSource {
    async fn quote(&self, symbol: &str) -> Result<Quote> {
        if let Some(quote) = self.cache.get(&symbol.to_string()) {
            return Ok(quote);
        }
        self.fresh_quote(symbol).await
    }

    async fn fresh_quote(&self, symbol: &str) -> Result<Quote> {
        let quote = self.inner.fresh_quote(symbol).await?;
        self.cache.insert(symbol.to_string(), quote.clone());
        Ok(quote)
    }

    fn name(&self) -> &str {
        "cached"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[tokio::test]
    async fn test_missing_quote_is_unavailable() {
        let source = InMemoryQuoteSource::new();
        let err = source.quote("NOPE").await.unwrap_err();
        assert!(matches!(err, PaperError::PriceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_non_positive_price_rejected() {
        let source = InMemoryQuoteSource::new();
        source.set_price("ZERO", Decimal::ZERO);
        assert!(source.quote("ZERO").await.is_err());
    }

    #[tokio::test]
    async fn test_cache_serves_until_invalidated() {
        let inner = Arc::new(InMemoryQuoteSource::new());
        inner.set_price("AAPL", dec!(150));
        let cached = CachedQuoteSource::new(inner.clone(), Duration::from_secs(60));

        assert_eq!(cached.quote("AAPL").await.unwrap().price, dec!(150));
        inner.set_price("AAPL", dec!(155));
        assert_eq!(cached.quote("AAPL").await.unwrap().price, dec!(150));
        assert_eq!(inner.request_count(), 1);

        cached.invalidate("AAPL");
        assert_eq!(cached.quote("AAPL").await.unwrap().price, dec!(155));
        assert_eq!(inner.request_count(), 2);
    }

    #[tokio::test]
    async fn test_fresh_quote_bypasses_cache() {
        let inner = Arc::new(InMemoryQuoteSource::new());
        inner.set_price("MSFT", dec!(400));
        let cached = CachedQuoteSource::new(inner.clone(), Duration::from_secs(60));
        cached.quote("MSFT").await.unwrap();

        inner.set_price("MSFT", dec!(401.5));
        assert_eq!(cached.fresh_quote("MSFT").await.unwrap().price, dec!(401.5));
        assert_eq!(cached.quote("MSFT").await.unwrap().price, dec!(401.5));
    }

    #[tokio::test]
    async fn test_load_from_csv() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "symbol,price,currency").unwrap();
        writeln!(file, "aapl,189.25,USD").unwrap();
        writeln!(file, "SAP,120.10,EUR").unwrap();

        let source = InMemoryQuoteSource::new();
        assert_eq!(source.load_from_csv(file.path()).unwrap(), 2);
        let sap = source.quote("SAP").await.unwrap();
        assert_eq!(sap.price, dec!(120.10));
        assert_eq!(sap.currency, "EUR");
        assert_eq!(source.quote("AAPL").await.unwrap().price, dec!(189.25));
    }
}

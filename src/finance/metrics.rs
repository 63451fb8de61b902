//! Risk and performance metrics for a single instrument
//!
//! All functions take float price series (converted once at this boundary)
//! and return `None` instead of panicking or producing NaN when the input is
//! empty, too short, misaligned or non-positive.

use crate::asset::{Asset, AssetDetails};
use crate::cache::TtlCache;
use crate::finance::constants::{FIFTY_TWO_WEEK_WINDOW, TRADING_DAYS_PER_YEAR, ZERO_TOLERANCE};
use crate::finance::math;
use crate::types::{InstrumentId, Symbol, Timestamp};
use chrono::{NaiveDate, Utc};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::time::Duration;

/// Dated closing price
pub type PricePoint = (NaiveDate, f64);

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

/// Simple period-over-period returns
pub fn daily_returns(prices: &[f64]) -> Option<Vec<f64>> {
    if prices.len() < 2 || prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
        return None;
    }
    Some(prices.windows(2).map(|w| w[1] / w[0] - 1.0).collect())
}

/// Annualized volatility (sample standard deviation of daily returns)
pub fn volatility(prices: &[f64]) -> Option<f64> {
    let returns = daily_returns(prices)?;
    if returns.len() < 2 {
        return None;
    }
    let std_dev = finite(returns.iter().std_dev())?;
    Some(std_dev * TRADING_DAYS_PER_YEAR.sqrt())
}

/// Annualized Sharpe ratio with an annual risk-free rate
pub fn sharpe_ratio(prices: &[f64], risk_free_rate: f64) -> Option<f64> {
    let returns = daily_returns(prices)?;
    if returns.len() < 2 {
        return None;
    }
    let mean = finite(returns.iter().mean())?;
    let std_dev = finite(returns.iter().std_dev())?;
    if std_dev < ZERO_TOLERANCE {
        return None;
    }

    let daily_rf = risk_free_rate / TRADING_DAYS_PER_YEAR;
    finite((mean - daily_rf) / std_dev * TRADING_DAYS_PER_YEAR.sqrt())
}

/// Largest peak-to-trough decline, as a fraction of the peak
pub fn max_drawdown(prices: &[f64]) -> Option<f64> {
    if prices.len() < 2 || prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
        return None;
    }

    let mut peak = prices[0];
    let mut max_dd: f64 = 0.0;
    for &price in prices {
        if price > peak {
            peak = price;
        }
        max_dd = max_dd.max((peak - price) / peak);
    }
    Some(max_dd)
}

/// Join two dated series on the dates present in both, in date order
pub fn align_series(asset: &[PricePoint], benchmark: &[PricePoint]) -> (Vec<f64>, Vec<f64>) {
    let bench: HashMap<NaiveDate, f64> = benchmark.iter().copied().collect();
    let mut joined: Vec<(NaiveDate, f64, f64)> = asset
        .iter()
        .filter_map(|(date, price)| bench.get(date).map(|b| (*date, *price, *b)))
        .collect();
    joined.sort_by_key(|(date, _, _)| *date);
    joined.dedup_by_key(|(date, _, _)| *date);
    joined.into_iter().map(|(_, a, b)| (a, b)).unzip()
}

/// Beta of an instrument against a benchmark over their common dates
pub fn beta(asset: &[PricePoint], benchmark: &[PricePoint]) -> Option<f64> {
    let (asset_prices, bench_prices) = align_series(asset, benchmark);
    let asset_returns = daily_returns(&asset_prices)?;
    let bench_returns = daily_returns(&bench_prices)?;
    if asset_returns.len() < 2 {
        return None;
    }

    let bench_variance = finite(bench_returns.iter().variance())?;
    if bench_variance < ZERO_TOLERANCE {
        return None;
    }
    let covariance = finite(asset_returns.iter().covariance(bench_returns.iter()))?;
    finite(covariance / bench_variance)
}

/// Where `current` sits inside the trailing 52-week range, clamped to [0, 1]
pub fn fifty_two_week_position(prices: &[f64], current: f64) -> Option<f64> {
    if prices.is_empty() || !current.is_finite() || current <= 0.0 {
        return None;
    }
    if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
        return None;
    }
    let start = prices.len().saturating_sub(FIFTY_TWO_WEEK_WINDOW);
    let window = &prices[start..];
    let high = finite(Statistics::max(window.iter()))?;
    let low = finite(Statistics::min(window.iter()))?;
    let range = high - low;
    if range.abs() < ZERO_TOLERANCE {
        return None;
    }
    Some(((current - low) / range).clamp(0.0, 1.0))
}

/// Macaulay duration in years.
///
/// `coupon_rate` and `yield_to_maturity` are annual fractions, `frequency`
/// is coupon payments per year.
pub fn macaulay_duration(
    coupon_rate: f64,
    yield_to_maturity: f64,
    years_to_maturity: f64,
    frequency: u32,
) -> Option<f64> {
    if frequency == 0
        || !years_to_maturity.is_finite()
        || years_to_maturity <= 0.0
        || coupon_rate < 0.0
        || yield_to_maturity <= -1.0
    {
        return None;
    }

    let freq = f64::from(frequency);
    let n = years_to_maturity * freq;
    let c = coupon_rate / freq;
    let y = yield_to_maturity / freq;

    // Zero-coupon bonds pay everything at maturity
    if c.abs() < ZERO_TOLERANCE {
        return Some(years_to_maturity);
    }

    let periods = if y.abs() < ZERO_TOLERANCE {
        // Undiscounted cash flows
        (c * n * (n + 1.0) / 2.0 + n) / (c * n + 1.0)
    } else {
        let growth = (1.0 + y).powf(n);
        (1.0 + y) / y - (1.0 + y + n * (c - y)) / (c * (growth - 1.0) + y)
    };

    finite(periods / freq).filter(|d| *d > 0.0)
}

/// Modified duration in years
pub fn modified_duration(
    coupon_rate: f64,
    yield_to_maturity: f64,
    years_to_maturity: f64,
    frequency: u32,
) -> Option<f64> {
    let macaulay = macaulay_duration(coupon_rate, yield_to_maturity, years_to_maturity, frequency)?;
    finite(macaulay / (1.0 + yield_to_maturity / f64::from(frequency)))
}

/// Closed-form duration estimate from coupon, yield and years to maturity.
///
/// Assumes one coupon a year and a fractional final period, so it differs
/// from `macaulay_duration` for bonds paying more often.
pub fn duration_estimate(coupon_rate: f64, yield_to_maturity: f64, years_to_maturity: f64) -> Option<f64> {
    macaulay_duration(coupon_rate, yield_to_maturity, years_to_maturity, 1)
}

/// Every risk metric for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskReport {
    pub instrument_id: InstrumentId,
    pub symbol: Symbol,
    pub observations: usize,
    pub volatility: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub max_drawdown: Option<f64>,
    pub beta: Option<f64>,
    pub fifty_two_week_position: Option<f64>,
    /// Annual closed-form estimate shown to traders
    pub duration_estimate: Option<f64>,
    pub macaulay_duration: Option<f64>,
    pub modified_duration: Option<f64>,
    pub computed_at: Timestamp,
}

/// Risk & Metrics calculator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskCalculator {
    /// Annual risk-free rate used by the Sharpe ratio
    pub risk_free_rate: f64,
    /// Bond coupon payments per year
    pub coupon_frequency: u32,
}

impl Default for RiskCalculator {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.0,
            coupon_frequency: 2,
        }
    }
}

impl RiskCalculator {
    pub fn new(risk_free_rate: f64) -> Self {
        Self {
            risk_free_rate,
            ..Self::default()
        }
    }

    /// Compute a report from a dated price history.
    ///
    /// Bonds without a supplied yield are treated as priced at par, so the
    /// yield equals the coupon rate.
    pub fn report(
        &self,
        asset: &Asset,
        history: &[PricePoint],
        benchmark: Option<&[PricePoint]>,
        yield_to_maturity: Option<f64>,
        as_of: NaiveDate,
    ) -> RiskReport {
        let mut sorted = history.to_vec();
        sorted.sort_by_key(|(date, _)| *date);
        let prices: Vec<f64> = sorted.iter().map(|(_, p)| *p).collect();

        let (estimate, macaulay, modified) = match &asset.details {
            Some(AssetDetails::Bond { coupon_rate, .. }) => {
                let coupon = math::to_f64(*coupon_rate);
                let years = asset.years_to_maturity(as_of);
                match (coupon, years) {
                    (Some(coupon), Some(years)) => {
                        let ytm = yield_to_maturity.unwrap_or(coupon);
                        (
                            duration_estimate(coupon, ytm, years),
                            macaulay_duration(coupon, ytm, years, self.coupon_frequency),
                            modified_duration(coupon, ytm, years, self.coupon_frequency),
                        )
                    }
                    _ => (None, None, None),
                }
            }
            _ => (None, None, None),
        };

        RiskReport {
            instrument_id: asset.id,
            symbol: asset.symbol.clone(),
            observations: prices.len(),
            volatility: volatility(&prices),
            sharpe_ratio: sharpe_ratio(&prices, self.risk_free_rate),
            max_drawdown: max_drawdown(&prices),
            beta: benchmark.and_then(|b| beta(&sorted, b)),
            fifty_two_week_position: prices
                .last()
                .and_then(|current| fifty_two_week_position(&prices, *current)),
            duration_estimate: estimate,
            macaulay_duration: macaulay,
            modified_duration: modified,
            computed_at: Utc::now(),
        }
    }
}

/// Computed reports keyed by instrument, with a TTL and explicit invalidation
#[derive(Debug)]
pub struct MetricsCache {
    reports: TtlCache<InstrumentId, RiskReport>,
}

impl MetricsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            reports: TtlCache::new(ttl),
        }
    }

    pub fn get(&self, instrument_id: InstrumentId) -> Option<RiskReport> {
        self.reports.get(&instrument_id)
    }

    /// Cached report, or compute and cache one
    pub fn get_or_compute<F>(&self, instrument_id: InstrumentId, compute: F) -> RiskReport
    where
        F: FnOnce() -> RiskReport,
    {
        if let Some(report) = self.reports.get(&instrument_id) {
            return report;
        }
        let report = compute();
        self.reports.insert(instrument_id, report.clone());
        report
    }

    pub fn invalidate(&self, instrument_id: InstrumentId) {
        self.reports.invalidate(&instrument_id);
    }

    pub fn clear(&self) {
        self.reports.clear();
    }
}

#[derive(Debug, Deserialize)]
struct PriceRow {
    date: NaiveDate,
    close: f64,
}

/// Read a `date,close` CSV (dates as YYYY-MM-DD) into a price series
pub fn read_price_series<R: std::io::Read>(reader: R) -> crate::error::Result<Vec<PricePoint>> {
    let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut series = Vec::new();
    for row in csv_reader.deserialize::<PriceRow>() {
        let row = row.map_err(|e| {
            crate::error::PaperError::ConfigError(format!("Invalid price row: {}", e))
        })?;
        series.push((row.date, row.close));
    }
    series.sort_by_key(|(date, _)| *date);
    Ok(series)
}

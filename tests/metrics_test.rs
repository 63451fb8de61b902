//! Risk metric behavior on realistic and degenerate series

use approx::assert_relative_eq;
use chrono::NaiveDate;
use rust_decimal_macros::dec;
use rusty_paper::asset::Asset;
use rusty_paper::finance::metrics::{
    beta, daily_returns, duration_estimate, fifty_two_week_position, macaulay_duration, max_drawdown,
    modified_duration, read_price_series, sharpe_ratio, volatility, RiskCalculator,
};

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
}

#[test]
fn test_degenerate_inputs_return_none() {
    let empty: [f64; 0] = [];
    assert!(daily_returns(&empty).is_none());
    assert!(volatility(&empty).is_none());
    assert!(sharpe_ratio(&empty, 0.0).is_none());
    assert!(max_drawdown(&empty).is_none());
    assert!(fifty_two_week_position(&empty, 10.0).is_none());
    assert!(beta(&[], &[]).is_none());

    // Non-positive prices
    assert!(volatility(&[100.0, 0.0, 101.0]).is_none());
    assert!(max_drawdown(&[100.0, -1.0]).is_none());
    assert!(fifty_two_week_position(&[100.0, -1.0, 120.0], 110.0).is_none());

    // Flat series has no volatility to divide by
    assert!(sharpe_ratio(&[100.0, 100.0, 100.0], 0.0).is_none());
    assert!(fifty_two_week_position(&[50.0, 50.0], 50.0).is_none());

    assert!(macaulay_duration(0.05, 0.05, 0.0, 2).is_none());
    assert!(macaulay_duration(0.05, 0.05, 10.0, 0).is_none());
}

#[test]
fn test_drawdown_and_range() {
    let prices = [100.0, 120.0, 90.0, 110.0];
    assert_relative_eq!(max_drawdown(&prices).unwrap(), 0.25, epsilon = 1e-12);
    assert_relative_eq!(fifty_two_week_position(&prices, 105.0).unwrap(), 0.5, epsilon = 1e-12);
    assert_eq!(fifty_two_week_position(&prices, 200.0), Some(1.0));
}

#[test]
fn test_beta_uses_common_dates() {
    let asset = vec![(day(2), 100.0), (day(3), 102.0), (day(4), 101.0), (day(5), 104.0)];
    // Benchmark moves half as much and is missing day 4 on the asset side
    let bench = vec![(day(1), 50.0), (day(2), 50.0), (day(3), 50.5), (day(5), 51.0)];
    let b = beta(&asset, &bench).unwrap();
    assert!(b.is_finite());
    assert!(b > 0.0);

    let disjoint = vec![(day(10), 1.0), (day(11), 2.0)];
    assert!(beta(&asset, &disjoint).is_none());
}

#[test]
fn test_bond_duration() {
    // 10-year 5% semi-annual bond priced at par
    let macaulay = macaulay_duration(0.05, 0.05, 10.0, 2).unwrap();
    assert_relative_eq!(macaulay, 7.9894, epsilon = 1e-3);
    assert_relative_eq!(duration_estimate(0.05, 0.05, 10.0).unwrap(), 8.1078, epsilon = 1e-3);
    let modified = modified_duration(0.05, 0.05, 10.0, 2).unwrap();
    assert_relative_eq!(modified, macaulay / 1.025, epsilon = 1e-9);

    // Zero coupon: duration equals maturity
    assert_relative_eq!(macaulay_duration(0.0, 0.04, 7.0, 2).unwrap(), 7.0);
}

#[test]
fn test_report_from_csv() {
    let csv = "date,close\n2024-01-02,100\n2024-01-03,101\n2024-01-04,99.5\n2024-01-05,102\n";
    let history = read_price_series(csv.as_bytes()).unwrap();
    let bond = Asset::bond(9, "UST10", dec!(0.05), NaiveDate::from_ymd_opt(2034, 1, 5).unwrap(), dec!(100));

    let report = RiskCalculator::new(0.0).report(&bond, &history, Some(&history), None, day(5));
    assert_eq!(report.observations, 4);
    assert_relative_eq!(report.beta.unwrap(), 1.0, epsilon = 1e-9);
    assert!(report.max_drawdown.unwrap() > 0.0);
    assert!(report.macaulay_duration.unwrap() > 7.0);
    assert!(report.duration_estimate.is_some());

    let stock = Asset::stock(1, "AAPL", "NASDAQ");
    let report = RiskCalculator::default().report(&stock, &[], None, None, day(5));
    assert_eq!(report.observations, 0);
    assert!(report.volatility.is_none());
    assert!(report.macaulay_duration.is_none());
    assert!(report.duration_estimate.is_none());
}

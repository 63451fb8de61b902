use chrono::{Duration, NaiveDate, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use rusty_paper::asset::Asset;
use rusty_paper::calendar::MarketOracle;
use rusty_paper::finance::account::Holding;
use rusty_paper::finance::ledger::{Ledger, Trade};
use rusty_paper::finance::metrics::{beta, max_drawdown, sharpe_ratio, volatility, PricePoint};
use rusty_paper::finance::validator::{OrderContext, OrderValidator};
use rusty_paper::order::{OrderRequest, OrderSide};
use rusty_paper::session::GameSession;
use rusty_paper::store::{OrderClaim, Store};
use uuid::Uuid;

fn price_series(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 100.0 + (i as f64 * 0.37).sin() * 5.0 + i as f64 * 0.01)
        .collect()
}

fn dated(prices: &[f64]) -> Vec<PricePoint> {
    let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
    prices
        .iter()
        .enumerate()
        .map(|(i, p)| (start + Duration::days(i as i64), *p))
        .collect()
}

fn benchmark_metrics(c: &mut Criterion) {
    let prices = price_series(2520);
    let bench = price_series(2520).iter().map(|p| p * 1.1).collect::<Vec<_>>();
    let (asset_dated, bench_dated) = (dated(&prices), dated(&bench));

    c.bench_function("volatility_10y", |b| b.iter(|| volatility(black_box(&prices))));
    c.bench_function("sharpe_10y", |b| b.iter(|| sharpe_ratio(black_box(&prices), 0.02)));
    c.bench_function("max_drawdown_10y", |b| b.iter(|| max_drawdown(black_box(&prices))));
    c.bench_function("beta_10y", |b| {
        b.iter(|| beta(black_box(&asset_dated), black_box(&bench_dated)))
    });
}

fn benchmark_ledger(c: &mut Criterion) {
    let ledger = Ledger::default();
    let portfolio_id = Uuid::new_v4();
    let holding = Holding {
        portfolio_id,
        instrument_id: 1,
        symbol: "AAPL".to_string(),
        quantity: dec!(100),
        average_cost: dec!(150.25),
        updated_at: Utc::now(),
    };

    c.bench_function("ledger_settle_1000", |b| {
        b.iter(|| {
            for i in 0..1000 {
                let side = if i % 2 == 0 { OrderSide::Buy } else { OrderSide::Sell };
                let trade = Trade {
                    portfolio_id,
                    instrument_id: 1,
                    symbol: "AAPL".to_string(),
                    side,
                    quantity: dec!(1.5),
                    price: dec!(151.1234),
                };
                let _ = ledger.settle(black_box(dec!(100000)), Some(&holding), &trade, Utc::now());
            }
        });
    });

    let validator = OrderValidator::default();
    let asset = Asset::fund(2, "VTI").fractional();
    c.bench_function("validate_dollar_order", |b| {
        let request = OrderRequest::buy_amount(2, dec!(1000));
        b.iter(|| {
            let ctx = OrderContext {
                instrument: Some(&asset),
                price: dec!(22.17),
                cash: dec!(5000),
                held: Decimal::ZERO,
                now: Utc::now(),
            };
            validator.validate(black_box(&request), &ctx)
        });
    });
}

fn benchmark_settlement(c: &mut Criterion) {
    let store = Store::open_in_memory().unwrap();
    let session = GameSession::new("Bench", dec!(1000000000), Utc::now());
    store.insert_session(&session).unwrap();
    store.insert_instrument(&Asset::stock(1, "AAPL", "NASDAQ")).unwrap();
    let portfolio = store.get_or_create_portfolio("bench", &session, Utc::now()).unwrap();
    let ledger = Ledger::default();

    c.bench_function("store_settle_trade", |b| {
        b.iter(|| {
            let trade = Trade {
                portfolio_id: portfolio.id,
                instrument_id: 1,
                symbol: "AAPL".to_string(),
                side: OrderSide::Buy,
                quantity: dec!(1),
                price: dec!(10),
            };
            store
                .settle_trade(&ledger, &trade, OrderClaim::Immediate, None, Utc::now())
                .unwrap()
        });
    });
}

fn benchmark_oracle(c: &mut Criterion) {
    let oracle = MarketOracle::nyse();
    let start = Utc::now();
    c.bench_function("oracle_status_week", |b| {
        b.iter(|| {
            for minutes in (0..7 * 24 * 60).step_by(15) {
                black_box(oracle.status(start + Duration::minutes(minutes)));
            }
        });
    });
}

criterion_group!(
    benches,
    benchmark_metrics,
    benchmark_ledger,
    benchmark_settlement,
    benchmark_oracle
);
criterion_main!(benches);

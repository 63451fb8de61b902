//! rusty-paper CLI - drive the paper-trading engine from a shell
//!
//! Quotes come from a CSV file (`symbol,price[,currency]`) instead of a live
//! market-data provider.
//!
//! ## Example Usage
//!
//! ```bash
//! # Create the database and a session
//! rusty-paper init
//! rusty-paper session "Spring League" --cash 10000 --days 30
//! rusty-paper instrument add 1 AAPL --kind stock
//!
//! # Trade
//! rusty-paper --quotes quotes.csv buy alice AAPL --qty 10
//! rusty-paper --quotes quotes.csv limit alice AAPL buy --qty 10 --price 49
//!
//! # Drain pending orders
//! rusty-paper --quotes quotes.csv sweep
//! ```

use anyhow::{anyhow, bail, Context as _};
use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use rust_decimal::Decimal;
use rusty_paper::asset::{Asset, AssetType};
use rusty_paper::config::EngineConfig;
use rusty_paper::engine::{ExecutionEngine, OrderOutcome};
use rusty_paper::error::PaperError;
use rusty_paper::finance::metrics::{read_price_series, RiskCalculator};
use rusty_paper::hooks::{ActivityFeedHook, HookRunner};
use rusty_paper::order::{LimitOrderRequest, OrderRequest, OrderSide, PendingOrder};
use rusty_paper::quotes::{CachedQuoteSource, InMemoryQuoteSource, QuoteSource};
use rusty_paper::reconcile::{Reconciler, SweepSettings, SweepSummary};
use rusty_paper::scheduler::SweepScheduler;
use rusty_paper::session::GameSession;
use rusty_paper::store::Store;
use std::fs::File;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use uuid::Uuid;

/// rusty-paper: paper-trading order execution and portfolio accounting
#[derive(Parser)]
#[command(name = "rusty-paper")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Robert Fall")]
#[command(about = "Paper-trading order execution and portfolio accounting", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Quotes CSV (symbol,price[,currency])
    #[arg(short, long, global = true)]
    quotes: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database
    Init,

    /// Create and activate a game session
    Session {
        name: String,

        /// Starting cash for every portfolio
        #[arg(long, default_value = "100000")]
        cash: Decimal,

        /// Session length in days (open-ended if omitted)
        #[arg(long)]
        days: Option<i64>,
    },

    /// Manage tradable instruments
    Instrument {
        #[command(subcommand)]
        action: InstrumentAction,
    },

    /// Market buy
    Buy(MarketArgs),

    /// Market sell
    Sell(MarketArgs),

    /// Place a limit order
    Limit {
        user: String,
        symbol: String,
        side: SideArg,

        #[arg(long)]
        qty: Option<Decimal>,

        #[arg(long)]
        amount: Option<Decimal>,

        /// Limit price
        #[arg(long)]
        price: Decimal,

        /// Expire after this many hours
        #[arg(long)]
        expires_in: Option<i64>,
    },

    /// Cancel a pending order
    Cancel { user: String, order_id: Uuid },

    /// Run one reconciliation sweep
    Sweep,

    /// Run the sweep on a schedule until Ctrl-C
    Serve,

    /// Sweep statistics and pending order counts
    Stats,

    /// Show a user's portfolio
    Portfolio { user: String },

    /// Risk metrics from a `date,close` CSV
    Risk {
        symbol: String,

        #[arg(long)]
        prices: PathBuf,

        /// Benchmark series for beta
        #[arg(long)]
        benchmark: Option<PathBuf>,

        /// Bond yield to maturity (defaults to the coupon rate)
        #[arg(long)]
        ytm: Option<f64>,
    },
}

#[derive(Subcommand)]
enum InstrumentAction {
    /// Register an instrument
    Add {
        id: u64,
        symbol: String,

        #[arg(long, value_enum, default_value = "stock")]
        kind: KindArg,

        #[arg(long)]
        name: Option<String>,

        /// Allow fractional units
        #[arg(long)]
        fractional: bool,

        #[arg(long, default_value = "NYSE")]
        exchange: String,

        /// Bond coupon rate as a fraction
        #[arg(long)]
        coupon: Option<Decimal>,

        /// Bond maturity (YYYY-MM-DD)
        #[arg(long)]
        maturity: Option<NaiveDate>,
    },

    /// List instruments
    List,
}

#[derive(clap::Args)]
struct MarketArgs {
    user: String,
    symbol: String,

    #[arg(long)]
    qty: Option<Decimal>,

    /// Dollar amount instead of a quantity
    #[arg(long)]
    amount: Option<Decimal>,

    #[arg(long)]
    notes: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum SideArg {
    Buy,
    Sell,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Stock,
    Bond,
    Fund,
}

impl From<SideArg> for OrderSide {
    fn from(side: SideArg) -> Self {
        match side {
            SideArg::Buy => OrderSide::Buy,
            SideArg::Sell => OrderSide::Sell,
        }
    }
}

struct App {
    config: EngineConfig,
    store: Arc<Store>,
    engine: Arc<ExecutionEngine>,
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    if let Err(e) = run(cli).await {
        let message = match e.downcast_ref::<PaperError>() {
            Some(err) => err.user_message(),
            None => e.to_string(),
        };
        eprintln!("{} {}", "Error:".red().bold(), message);
        log::debug!("{:?}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = EngineConfig::load_or_default(cli.config.as_deref())?;
    let app = App::open(config, cli.quotes, cli.verbose)?;

    if cli.verbose {
        println!("{} v{}", "rusty-paper".cyan().bold(), env!("CARGO_PKG_VERSION"));
        println!("Database: {}", app.config.db_path.display().to_string().dimmed());
    }

    match cli.command {
        Commands::Init => {
            println!("{} Database ready at {}", "✓".green().bold(), app.config.db_path.display());
            Ok(())
        }
        Commands::Session { name, cash, days } => create_session(&app, name, cash, days),
        Commands::Instrument { action } => handle_instrument(&app, action),
        Commands::Buy(args) => market_order(&app, OrderSide::Buy, args).await,
        Commands::Sell(args) => market_order(&app, OrderSide::Sell, args).await,
        Commands::Limit {
            user,
            symbol,
            side,
            qty,
            amount,
            price,
            expires_in,
        } => {
            let request = order_request(&app, &symbol, side.into(), qty, amount, None)?;
            let mut limit = LimitOrderRequest::new(request, price);
            if let Some(hours) = expires_in {
                limit = limit.expiring_at(Utc::now() + Duration::hours(hours));
            }
            let outcome = app.engine.submit_limit_order(&user, &limit).await?;
            print_outcome(&outcome);
            Ok(())
        }
        Commands::Cancel { user, order_id } => {
            let order = app.engine.cancel_order(&user, order_id)?;
            println!("{} Cancelled order {}", "✓".green().bold(), order.id());
            Ok(())
        }
        Commands::Sweep => {
            let reconciler = app.reconciler();
            let summary = reconciler.run_once().await?;
            print_summary(&summary);
            Ok(())
        }
        Commands::Serve => serve(&app).await,
        Commands::Stats => show_stats(&app),
        Commands::Portfolio { user } => show_portfolio(&app, &user).await,
        Commands::Risk {
            symbol,
            prices,
            benchmark,
            ytm,
        } => show_risk(&app, &symbol, prices, benchmark, ytm),
    }
}

impl App {
    fn open(config: EngineConfig, quotes_csv: Option<PathBuf>, verbose: bool) -> anyhow::Result<Self> {
        let store = Arc::new(
            Store::open(&config.db_path)
                .with_context(|| format!("opening {}", config.db_path.display()))?,
        );

        let source = Arc::new(InMemoryQuoteSource::new());
        if let Some(path) = quotes_csv {
            let loaded = source.load_from_csv(&path)?;
            log::info!("Loaded {} quotes from {}", loaded, path.display());
        }
        let quotes: Arc<dyn QuoteSource> = Arc::new(CachedQuoteSource::new(source, config.quote_ttl()));

        let mut hooks = HookRunner::new();
        hooks.register(Arc::new(ActivityFeedHook::new(store.clone())));
        let engine = ExecutionEngine::from_config(&config, store.clone(), quotes).with_hooks(hooks);

        Ok(Self {
            config,
            store,
            engine: Arc::new(engine),
            verbose,
        })
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.engine.clone(), SweepSettings::from(&self.config))
    }
}

fn create_session(app: &App, name: String, cash: Decimal, days: Option<i64>) -> anyhow::Result<()> {
    let now = Utc::now();
    let mut session = GameSession::new(name, cash, now);
    if let Some(days) = days {
        if days <= 0 {
            bail!("--days must be positive");
        }
        session = session.ending_at(now + Duration::days(days));
    }
    app.store.insert_session(&session)?;
    app.store.activate_session(session.id)?;
    println!(
        "{} Session {} active with {} starting cash",
        "✓".green().bold(),
        session.name.bold(),
        format!("${}", cash).bright_green()
    );
    Ok(())
}

fn handle_instrument(app: &App, action: InstrumentAction) -> anyhow::Result<()> {
    match action {
        InstrumentAction::Add {
            id,
            symbol,
            kind,
            name,
            fractional,
            exchange,
            coupon,
            maturity,
        } => {
            let symbol = symbol.to_ascii_uppercase();
            let mut asset = match kind {
                KindArg::Stock => Asset::stock(id, symbol, exchange),
                KindArg::Fund => Asset::fund(id, symbol),
                KindArg::Bond => {
                    let coupon = coupon.ok_or_else(|| anyhow!("bonds need --coupon"))?;
                    let maturity = maturity.ok_or_else(|| anyhow!("bonds need --maturity"))?;
                    Asset::bond(id, symbol, coupon, maturity, Decimal::ONE_HUNDRED)
                }
            };
            if let Some(name) = name {
                asset = asset.with_name(name);
            }
            if fractional {
                asset = asset.fractional();
            }
            app.store.insert_instrument(&asset)?;
            println!("{} Added {}", "✓".green().bold(), asset);
        }
        InstrumentAction::List => {
            let assets = app.store.list_instruments()?;
            if assets.is_empty() {
                println!("{}", "No instruments registered".yellow());
            }
            for asset in assets {
                let fractional = if asset.fractional_shares { "fractional" } else { "whole" };
                println!(
                    "  {:>4}  {:<8} {:<6} {}",
                    asset.id,
                    asset.symbol.bold(),
                    asset.asset_type.as_str(),
                    fractional.dimmed()
                );
            }
        }
    }
    Ok(())
}

fn order_request(
    app: &App,
    symbol: &str,
    side: OrderSide,
    qty: Option<Decimal>,
    amount: Option<Decimal>,
    notes: Option<String>,
) -> anyhow::Result<OrderRequest> {
    let asset = app
        .store
        .find_instrument(symbol)?
        .ok_or_else(|| anyhow!("Unknown symbol {}", symbol))?;
    let mut request = OrderRequest::new(asset.id, side);
    request.quantity = qty;
    request.dollar_amount = amount;
    request.notes = notes;
    Ok(request)
}

async fn market_order(app: &App, side: OrderSide, args: MarketArgs) -> anyhow::Result<()> {
    let request = order_request(app, &args.symbol, side, args.qty, args.amount, args.notes)?;
    let outcome = app.engine.submit_market_order(&args.user, &request).await?;
    print_outcome(&outcome);
    Ok(())
}

fn print_outcome(outcome: &OrderOutcome) {
    match outcome {
        OrderOutcome::Executed { transaction, new_cash } => {
            println!(
                "{} {} {} {} @ {} (total {})",
                outcome.label().green().bold(),
                transaction.side,
                transaction.quantity.normalize(),
                transaction.symbol.bold(),
                transaction.price,
                transaction.total
            );
            println!("  Cash: {}", format!("${}", new_cash).bright_green());
        }
        OrderOutcome::Queued { order, next_session } => {
            println!("{} {}", outcome.label().yellow().bold(), order);
            match next_session {
                Some(at) => println!("  Executes when the market opens at {}", at),
                None => println!("  Executes when the market next opens"),
            }
        }
        OrderOutcome::LimitPlaced { order } => {
            println!("{} {}", outcome.label().cyan().bold(), order);
            println!("  Order id: {}", order.id);
        }
    }
}

fn print_summary(summary: &SweepSummary) {
    println!("{}", "Sweep Summary".green().bold());
    println!("{}", "=============".green());
    println!("  Processed:  {}", summary.processed);
    println!("  Executed:   {}", summary.executed.to_string().bright_green());
    println!("  Cancelled:  {}", summary.cancelled);
    println!("  Expired:    {}", summary.expired);
    println!("  Cleaned up: {}", summary.cleaned);
    if !summary.errors.is_empty() {
        println!("  Errors:     {}", summary.errors.len().to_string().red().bold());
        for error in &summary.errors {
            println!("    {} {}: {}", error.order_id, error.symbol, error.message.dimmed());
        }
    }
}

async fn serve(app: &App) -> anyhow::Result<()> {
    let reconciler = Arc::new(app.reconciler());
    let scheduler = SweepScheduler::new(reconciler.clone(), app.config.sweep_interval())
        .sweep_when_closed(app.config.sweep_when_closed);
    scheduler.start();
    println!(
        "{} Sweeping every {}s, Ctrl-C to stop",
        "▶".cyan().bold(),
        app.config.sweep_interval_secs
    );

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    scheduler.stop().await;

    let stats = reconciler.stats()?;
    println!(
        "{} {} runs, {} executed",
        "■".cyan().bold(),
        stats.runs,
        stats.total_executed
    );
    Ok(())
}

fn show_stats(app: &App) -> anyhow::Result<()> {
    let stats = app.reconciler().stats()?;
    let status = app.engine.market_status();
    println!("{}", "Engine Status".green().bold());
    println!("{}", "=============".green());
    println!("  Market:          {}", status.market_state.to_string().cyan());
    if let Some(next) = status.next_trading_session {
        println!("  Next session:    {}", next);
    }
    println!("  Pending queued:  {}", stats.pending_queued);
    println!("  Pending limit:   {}", stats.pending_limit);
    println!("  Expired (total): {}", stats.expired_limit_total);
    Ok(())
}

async fn show_portfolio(app: &App, user: &str) -> anyhow::Result<()> {
    let snapshot = app.engine.portfolio_snapshot(user).await?;
    println!("{} {}", "Portfolio".green().bold(), user.bold());
    println!("  Cash:        {}", format!("${}", snapshot.portfolio.cash).bright_green());
    println!("  Positions:   ${}", snapshot.positions_value);
    println!("  Total value: {}", format!("${}", snapshot.total_value).bright_green().bold());
    if let Some(ret) = snapshot.total_return {
        let pct = format!("{:+.2}%", ret * Decimal::ONE_HUNDRED);
        let pct = if ret.is_sign_negative() { pct.red() } else { pct.bright_green() };
        println!("  Return:      {}", pct);
    }

    for valuation in &snapshot.holdings {
        let h = &valuation.holding;
        let value = valuation
            .market_value
            .map(|v| format!("${}", v))
            .unwrap_or_else(|| "n/a".to_string());
        println!(
            "  {:<8} {:>14} @ {:<12} {}",
            h.symbol.bold(),
            h.quantity.normalize(),
            h.average_cost.normalize(),
            value
        );
    }

    let pending = app.engine.pending_orders(user)?;
    if !pending.is_empty() && app.verbose {
        println!("{}", "Pending orders".yellow().bold());
        for order in pending {
            match order {
                PendingOrder::Market(o) => println!("  {}", o),
                PendingOrder::Limit(o) => println!("  {}", o),
            }
        }
    }
    Ok(())
}

fn show_risk(
    app: &App,
    symbol: &str,
    prices: PathBuf,
    benchmark: Option<PathBuf>,
    ytm: Option<f64>,
) -> anyhow::Result<()> {
    let asset = app
        .store
        .find_instrument(symbol)?
        .unwrap_or_else(|| Asset::new(0, symbol.to_ascii_uppercase(), AssetType::Stock));
    let history = read_price_series(File::open(&prices).with_context(|| format!("opening {}", prices.display()))?)?;
    let benchmark = match benchmark {
        Some(path) => Some(read_price_series(
            File::open(&path).with_context(|| format!("opening {}", path.display()))?,
        )?),
        None => None,
    };

    let calculator = RiskCalculator::new(app.config.risk_free_rate);
    let report = calculator.report(
        &asset,
        &history,
        benchmark.as_deref(),
        ytm,
        Utc::now().date_naive(),
    );

    let fmt = |value: Option<f64>, pct: bool| match value {
        Some(v) if pct => format!("{:.2}%", v * 100.0),
        Some(v) => format!("{:.4}", v),
        None => "n/a".dimmed().to_string(),
    };
    println!("{} {} ({} observations)", "Risk Report".green().bold(), report.symbol.bold(), report.observations);
    println!("  Volatility:        {}", fmt(report.volatility, true));
    println!("  Sharpe ratio:      {}", fmt(report.sharpe_ratio, false));
    println!("  Max drawdown:      {}", fmt(report.max_drawdown, true));
    println!("  Beta:              {}", fmt(report.beta, false));
    println!("  52-week position:  {}", fmt(report.fifty_two_week_position, true));
    if asset.asset_type == AssetType::Bond {
        println!("  Duration estimate: {}", fmt(report.duration_estimate, false));
        println!("  Macaulay duration: {}", fmt(report.macaulay_duration, false));
        println!("  Modified duration: {}", fmt(report.modified_duration, false));
    }
    Ok(())
}

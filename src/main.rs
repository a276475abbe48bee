//! Delta Arb - Main Entry Point
//!
//! Paper trading against simulated venues, configuration checks and a view
//! of persisted trade cycles.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use delta_arb::config::Config;
use delta_arb::events::EventBus;
use delta_arb::exchange::{AccountKind, ExchangeClient, ExchangeManager, MockExchange, Symbol};
use delta_arb::persistence::{RecordEmitter, SqliteTradeSink};
use delta_arb::strategy::{ArbitrageCoordinator, CoordinatorHandle};
use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal_macros::dec;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Reference price of the simulated market
const SIM_PRICE: Decimal = dec!(30000);
/// Peak of the simulated basis, in percent
const SIM_BASIS_AMPLITUDE_PCT: Decimal = dec!(0.8);
/// Half the simulated bid/ask spread, in percent
const SIM_HALF_SPREAD_PCT: Decimal = dec!(0.01);
const SIM_TICK_MS: u64 = 200;
const STATUS_LOG_SECS: u64 = 10;

/// Delta Arb CLI
#[derive(Parser)]
#[command(name = "delta-arb")]
#[command(version, about = "Delta-neutral spot/futures arbitrage engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Paper trade against two simulated venues until Ctrl-C
    Run {
        /// Emit logs as JSON
        #[arg(long)]
        json_logs: bool,
    },

    /// Load and validate the configuration
    CheckConfig,

    /// Show persisted trade cycles
    Status {
        /// Path to SQLite database
        #[arg(short, long, default_value = "data/cycles.db")]
        db: String,

        /// Number of most recent cycles to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { json_logs } => {
            init_logging(json_logs)?;
            run().await
        }
        Commands::CheckConfig => check_config(),
        Commands::Status { db, limit } => show_status(&db, limit),
    }
}

async fn run() -> Result<()> {
    info!("Delta Arb v{} - paper trading", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    config.validate()?;
    log_config(&config);

    let symbol = config.strategy.symbol();
    let spot = Arc::new(MockExchange::new("spot-sim", AccountKind::Cash));
    let futures = Arc::new(MockExchange::new("futures-sim", AccountKind::Margin));
    spot.fund(&symbol.quote, config.strategy.initial_equity).await;
    futures.fund(&symbol.quote, config.strategy.initial_equity).await;
    set_sim_quotes(&spot, &futures, &symbol, 0).await;

    let exchanges = Arc::new(
        ExchangeManager::new(config.exchange.clone())
            .with_role(config.strategy.long_role, spot.clone() as Arc<dyn ExchangeClient>)
            .with_role(config.strategy.hedge_role, futures.clone() as Arc<dyn ExchangeClient>),
    );
    for role in exchanges.roles() {
        info!(%role, account = ?exchanges.account_kind(role)?, "Venue registered");
    }

    let (records, writer) = if config.persistence.db_path.is_empty() {
        info!("Persistence disabled");
        (RecordEmitter::disabled(), None)
    } else {
        let sink = SqliteTradeSink::new(&config.persistence.db_path)?;
        let (emitter, writer) = RecordEmitter::spawn(Box::new(sink), config.persistence.queue_capacity)?;
        (emitter, Some(writer))
    };

    let events = EventBus::new(symbol.to_string());
    let (handle, coordinator) = ArbitrageCoordinator::spawn(config, exchanges, events, records);

    let feed = spawn_sim_feed(spot.clone(), futures.clone(), symbol.clone());
    let reporter = spawn_status_reporter(handle.clone());

    let state = handle.start().await?;
    info!(%state, "🚀 Strategy started");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("🛑 Shutdown signal received");

    handle.stop().await?;
    feed.abort();
    reporter.abort();

    let status = handle.get_status();
    info!(
        state = %status.state,
        cycles = status.cycles,
        cumulative_pnl = %status.cumulative_pnl,
        last_error = status.last_error.as_deref().unwrap_or("none"),
        "Final status"
    );
    info!(
        spot_base = %spot.balance(&symbol.base).await,
        spot_quote = %spot.balance(&symbol.quote).await,
        futures_position = %futures.position(&symbol).await,
        futures_collateral = %futures.balance(&symbol.quote).await,
        "Simulated venue balances"
    );

    drop(handle);
    coordinator.await.context("Coordinator task failed")?;
    if let Some(writer) = writer {
        tokio::task::spawn_blocking(move || writer.join())
            .await
            .context("Failed to join cycle writer")?
            .map_err(|_| anyhow::anyhow!("Cycle writer panicked"))?;
    }

    info!("👋 Delta Arb shutdown complete");
    Ok(())
}

/// Quote both venues around a drifting mid with an oscillating basis.
async fn set_sim_quotes(spot: &MockExchange, futures: &MockExchange, symbol: &Symbol, tick: u64) {
    let t = Decimal::from(tick);
    let spot_mid = SIM_PRICE * (Decimal::ONE + dec!(0.002) * (t / dec!(150)).sin());
    let basis_pct = SIM_BASIS_AMPLITUDE_PCT * (t / dec!(40)).sin();
    let futures_mid = spot_mid * (Decimal::ONE + basis_pct / dec!(100));
    let half = SIM_HALF_SPREAD_PCT / dec!(100);

    for (venue, mid) in [(spot, spot_mid), (futures, futures_mid)] {
        let bid = (mid * (Decimal::ONE - half)).round_dp(2);
        let ask = (mid * (Decimal::ONE + half)).round_dp(2);
        venue.set_quote(symbol, bid, ask, dec!(1)).await;
    }
}

fn spawn_sim_feed(spot: Arc<MockExchange>, futures: Arc<MockExchange>, symbol: Symbol) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(SIM_TICK_MS));
        let mut tick = 0u64;
        loop {
            ticker.tick().await;
            tick += 1;
            set_sim_quotes(&spot, &futures, &symbol, tick).await;
        }
    })
}

fn spawn_status_reporter(handle: CoordinatorHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(STATUS_LOG_SECS));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let status = handle.get_status();
            info!(
                state = %status.state,
                since = %status.state_since.format("%H:%M:%S"),
                transitions = status.transitions,
                long = %status.position.long_qty,
                hedge = %status.position.hedge_qty,
                delta = %status.delta,
                cumulative_pnl = %status.cumulative_pnl,
                session_mdd_pct = %status.session_mdd_pct.round_dp(2),
                open_trades = status.open_trades,
                cycles = status.cycles,
                "📊 Status"
            );
            if let Some(error) = &status.last_error {
                warn!(%error, "Last error");
            }
        }
    })
}

fn check_config() -> Result<()> {
    let config = Config::load()?;
    config.validate()?;
    println!("Configuration OK");
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Print the most recent persisted cycles.
fn show_status(db_path: &str, limit: usize) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              DELTA ARB CYCLE HISTORY                       ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   The engine has not run with persistence enabled, or the path is incorrect.");
        return Ok(());
    }

    let sink = SqliteTradeSink::new(db_path)?;
    let records = sink.recent(limit)?;
    if records.is_empty() {
        println!("\n   No cycles recorded yet.");
        return Ok(());
    }

    println!(
        "\n{:<6} {:<10} {:<16} {:>10} {:>12} {:>12}  {:<12} {}",
        "cycle", "kind", "direction", "spread%", "hedged", "pnl", "outcome", "finished"
    );
    for record in &records {
        println!(
            "{:<6} {:<10} {:<16} {:>10} {:>12} {:>12}  {:<12} {}",
            record.cycle_id,
            record.kind.as_str(),
            record.direction.as_deref().unwrap_or("-"),
            record
                .spread_pct
                .map(|s| s.round_dp(4).to_string())
                .unwrap_or_else(|| "-".to_string()),
            record.hedged_qty,
            record.pnl.round_dp(4),
            record.outcome,
            record.finished_at.format("%Y-%m-%d %H:%M:%S UTC"),
        );
    }

    let compensated = records.iter().filter(|r| r.outcome == "compensated").count();
    println!("\n   {} cycles shown, {} compensated", records.len(), compensated);
    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    let s = &config.strategy;
    let t = &config.thresholds;
    let r = &config.risk;
    info!("📋 Configuration:");
    info!("   Symbol: {} ({} long, {} hedge)", s.symbol(), s.long_role, s.hedge_role);
    info!("   Base Position: {} / Trade Size: {}", s.base_position_size, s.trade_quantity);
    info!("   Entry / Exit: {}% / {}%", t.entry_pct, t.exit_pct);
    if t.zscore.enabled {
        info!("   Z-Score Gate: {} over {} samples", t.zscore.min_zscore, t.zscore.window);
    }
    info!("   Rebalance Tolerance: {}%", s.rebalance_tolerance_pct);
    info!("   Max Position: {} / Max Leverage: {}x", r.max_position_size, r.max_leverage);
    info!("   Max Drawdown: {}%", r.max_drawdown_pct);
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging(json: bool) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "delta-arb.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the guard alive for the program duration
    Box::leak(Box::new(guard));

    let filter = EnvFilter::from_default_env()
        .add_directive("delta_arb=debug".parse()?)
        .add_directive(Level::INFO.into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE);

    if json {
        builder.json().init();
    } else {
        builder.with_ansi(true).init();
    }

    Ok(())
}

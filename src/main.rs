//! Hedge Keeper - Main Entry Point
//!
//! Runs the hedge engine against the in-memory paper venue.

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use hedge_keeper::config::Config;
use hedge_keeper::engine::HedgeEngine;
use hedge_keeper::events::{EventBus, LogSink};
use hedge_keeper::persistence::{JournalSink, JournalStore};
use hedge_keeper::risk::RiskGate;
use hedge_keeper::venue::{MarketId, PaperVenue, PriceWalk};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Hedge Keeper CLI
#[derive(Parser)]
#[command(name = "hedge-keeper")]
#[command(version, about = "Synchronized multi-account hedge engine")]
struct Cli {
    /// Configuration file (extension optional)
    #[arg(short, long, default_value = "config", global = true)]
    config: String,

    /// JSON output: structured log lines for `run`, a JSON report for `status`
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine against the paper venue (default)
    Run,

    /// Show journaled positions and recent lifecycle events
    Status {
        /// Path to the journal database (defaults to the configured path)
        #[arg(short, long)]
        db: Option<String>,

        /// Number of recent events to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Load, validate and print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Status { db, limit }) => {
            let config = Config::load_from(&cli.config)?;
            let db = db.unwrap_or(config.journal.path);
            return show_status(&db, limit, cli.json);
        }
        Some(Commands::CheckConfig) => {
            let config = Config::load_from(&cli.config)?;
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    init_logging(cli.json)?;

    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║         Hedge Keeper v{} - Paper Venue                  ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let config = Config::load_from(&cli.config)?;
    config.validate()?;
    log_config(&config);
    let config = Arc::new(config);

    let venue = Arc::new(
        PaperVenue::new(config.paper.fee_rate, config.paper.half_spread)
            .with_order_retention(config.reconciliation.history_scan_limit.saturating_mul(50)),
    );
    seed_paper_venue(&venue, &config).await;

    let journal = if config.journal.enabled {
        let store = Arc::new(JournalStore::new(&config.journal.path)?);
        info!("📂 [JOURNAL] {}", config.journal.path);
        Some(store)
    } else {
        warn!("⚠️  Journal disabled, positions will not survive a restart");
        None
    };

    let mut events = EventBus::new().with_sink(Arc::new(LogSink));
    if let Some(store) = &journal {
        events = events.with_sink(Arc::new(JournalSink::new(store.clone())));
    }

    let risk = Arc::new(RiskGate::new(&config, events.clone()));
    let mut engine = HedgeEngine::new(config.clone(), venue.clone(), risk.clone(), events);

    if let Some(store) = &journal {
        match store.load_loss_ledger(Utc::now().date_naive()) {
            Ok(Some(ledger)) => {
                let global = ledger.global;
                if risk.restore_ledger(ledger) {
                    info!("📂 [JOURNAL] Restored today's loss ledger (global loss {})", global);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("⚠️  [JOURNAL] Failed to load loss ledger: {}", e),
        }
        engine = engine.with_journal(store.clone());
    }
    let engine = Arc::new(engine);

    if let Some(store) = &journal {
        match store.load_open_positions() {
            Ok(positions) if !positions.is_empty() => {
                let restored = engine.restore_positions(positions).await;
                info!("📂 [JOURNAL] Restored {} open positions", restored);
            }
            Ok(_) => info!("📂 [JOURNAL] No open positions to restore"),
            Err(e) => warn!("⚠️  [JOURNAL] Failed to load positions: {}", e),
        }
    }

    // Shutdown signal
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    spawn_price_walk(venue.clone(), &config, shutdown.clone());
    spawn_status_log(engine.clone(), shutdown.clone());

    info!("🚀 Starting hedge engine...");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    engine.clone().run(shutdown).await;

    if let Some(store) = &journal {
        for position in engine.live_positions().await {
            if let Err(e) = store.save_position(&position) {
                warn!(position = %position.id, "Failed to save position: {}", e);
            }
        }
        if let Err(e) = store.save_loss_ledger(&risk.ledger_snapshot()) {
            warn!("Failed to save loss ledger: {}", e);
        }
        info!("💾 [JOURNAL] State saved");
    }

    let snapshot = engine.snapshot().await;
    info!(
        "👋 Stopped. Open positions: {}, recent: {}, global loss today: {}",
        snapshot.pairs.iter().map(|p| p.positions.len()).sum::<usize>(),
        snapshot.recent.len(),
        snapshot.risk.global_loss
    );
    Ok(())
}

/// Accounts, leverage and starting prices for every configured market.
async fn seed_paper_venue(venue: &PaperVenue, config: &Config) {
    for account in &config.accounts {
        venue.add_account(account.id, config.paper.initial_balance).await;
    }
    for pair in &config.pairs {
        venue.set_leverage(pair.market, pair.leverage_decimal()).await;
        if venue.mid_price(pair.market).await.is_none() {
            venue.set_mid_price(pair.market, config.paper.start_price).await;
        }
    }
    info!(
        "📝 Paper venue: {} accounts at {} each, {} markets",
        config.accounts.len(),
        config.paper.initial_balance,
        paper_markets(config).len()
    );
}

fn paper_markets(config: &Config) -> BTreeSet<MarketId> {
    config.pairs.iter().map(|p| p.market).collect()
}

/// Drive paper mid prices so protective orders and the emergency
/// trigger see movement.
fn spawn_price_walk(venue: Arc<PaperVenue>, config: &Config, shutdown: Arc<AtomicBool>) {
    let markets = paper_markets(config);
    let period = Duration::from_millis(config.paper.tick_ms.max(10));
    let seed = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    let mut walk = PriceWalk::new(seed, config.paper.volatility_bps);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        while !shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;
            for market in &markets {
                if let Some(mid) = venue.mid_price(*market).await {
                    venue.set_mid_price(*market, walk.step(mid)).await;
                }
            }
        }
    });
}

/// Log an engine snapshot once a minute.
fn spawn_status_log(engine: Arc<HedgeEngine>, shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.tick().await;
        while !shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;
            let snapshot = engine.snapshot().await;
            for pair in &snapshot.pairs {
                for position in &pair.positions {
                    info!(
                        "📊 [STATUS] {} {} {} upnl={} rpnl={}",
                        pair.pair_id, position.id, position.status, position.unrealized_pnl, position.realized_pnl
                    );
                }
            }
            if snapshot.emergency_stop {
                warn!("🚨 [STATUS] Emergency stop active");
            }
            match serde_json::to_string(&snapshot) {
                Ok(json) => info!(target: "hedge_snapshot", "{}", json),
                Err(e) => warn!("Failed to serialize snapshot: {}", e),
            }
        }
    });
}

fn init_logging(json: bool) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "hedge-keeper.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("hedge_keeper=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE);

    if json {
        builder.with_ansi(false).json().flatten_event(true).init();
    } else {
        builder.with_ansi(true).init();
    }

    Ok(())
}

fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!(
        "   Ticks: open every {}s, manage every {}s",
        config.engine.opportunity_interval_secs, config.engine.management_interval_secs
    );
    info!(
        "   Strikes: {} over at least {}s",
        config.reconciliation.strike_threshold, config.reconciliation.min_strike_span_secs
    );
    info!("   Global daily loss limit: {}", config.risk.global_max_daily_loss);
    for pair in &config.pairs {
        info!(
            "   Pair {} (market {}): {}x, stops {}, accounts {:?}{}",
            pair.display_name(),
            pair.market,
            pair.leverage,
            pair.stop_take_distance,
            pair.accounts,
            if pair.is_enabled { "" } else { " [disabled]" }
        );
    }
}

fn show_status(db_path: &str, limit: usize, json: bool) -> Result<()> {
    if !Path::new(db_path).exists() {
        println!("❌ Journal not found: {}", db_path);
        println!("   The engine has not been started yet, or the path is incorrect.");
        return Ok(());
    }

    let store = JournalStore::new(db_path)?;
    let counts = store.position_counts()?;
    let events = store.recent_events(limit)?;

    if json {
        let out = serde_json::json!({
            "positions": counts.iter().map(|(s, n)| (s.clone(), *n)).collect::<std::collections::BTreeMap<_, _>>(),
            "recent_events": events,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              HEDGE KEEPER STATUS                           ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    println!("\n📊 Positions");
    if counts.is_empty() {
        println!("   (none)");
    }
    for (i, (status, count)) in counts.iter().enumerate() {
        let branch = if i + 1 == counts.len() { "└─" } else { "├─" };
        println!("   {} {:<14} {}", branch, status, count);
    }

    println!("\n📜 Recent Events");
    if events.is_empty() {
        println!("   (none)");
    }
    for event in &events {
        println!(
            "   {} {:<18} {:<8} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.event_type,
            event.pair_id.as_deref().unwrap_or("-"),
            event.position_id.as_deref().unwrap_or("")
        );
    }

    Ok(())
}

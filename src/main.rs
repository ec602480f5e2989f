//! Prediction Trader - Main Entry Point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prediction_trader::alert::{AlertDispatcher, LogNotifier, Notifier, WebhookNotifier};
use prediction_trader::audit::{replay, AuditLog};
use prediction_trader::config::{Config, FeedSource};
use prediction_trader::engine::{operator, Scheduler, TradingEngine};
use prediction_trader::exchange::{
    GammaClient, MarketDataSource, OrderVenue, PaperVenue, RestVenueClient, StaticMarketSource,
};
use prediction_trader::persistence::SqliteAuditStore;
use rust_decimal_macros::dec;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Prediction Trader CLI
#[derive(Parser)]
#[command(name = "prediction-trader")]
#[command(version, about = "Risk-managed trading core for prediction markets")]
struct Cli {
    /// Path to the audit database (overrides configuration)
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trading engine with the operator console (default)
    Run,

    /// Rebuild state from the audit log and print it
    Status,

    /// Verify the audit log hash chain
    Verify,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let mut config = Config::load()?;
    if let Some(db) = cli.db {
        config.audit.db_path = db;
    }
    config.validate()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Status => show_status(&config.audit.db_path),
        Commands::Verify => verify(&config.audit.db_path),
    }
}

async fn run(config: Config) -> Result<()> {
    info!(
        "Prediction Trader v{} starting ({})",
        env!("CARGO_PKG_VERSION"),
        if config.execution.paper_trading {
            "paper trading"
        } else {
            "LIVE trading"
        }
    );
    log_config(&config);

    let audit = Arc::new(AuditLog::open(Box::new(SqliteAuditStore::open(
        &config.audit.db_path,
    )?))?);

    let source: Arc<dyn MarketDataSource> = match config.feed.source {
        FeedSource::Gamma => Arc::new(GammaClient::new(&config.feed)?),
        FeedSource::Static => Arc::new(StaticMarketSource::sample()),
    };
    let venue: Arc<dyn OrderVenue> = if config.execution.paper_trading {
        Arc::new(PaperVenue::new())
    } else {
        warn!("Live venue enabled - real money at risk");
        Arc::new(RestVenueClient::new(&config.venue)?)
    };

    let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    if let Some(url) = &config.alerts.webhook_url {
        notifiers.push(Arc::new(WebhookNotifier::new(url.clone())?));
    }
    let (alerts, alert_task) = AlertDispatcher::spawn(notifiers, config.alerts.channel_capacity);

    let engine = Arc::new(TradingEngine::new(&config, source, venue, audit, alerts)?);
    print!("{}", engine.status().await);

    let mut scheduler = Scheduler::new();
    engine.start(&mut scheduler);
    let console = tokio::spawn(operator::run_console(
        engine.clone(),
        scheduler.shutdown_signal(),
    ));

    tokio::signal::ctrl_c().await.ok();
    info!("Shutdown signal received");

    scheduler.shutdown().await;
    let _ = console.await;
    drop(engine);
    // Approval waiters may still hold the dispatcher; give queued alerts a moment.
    if tokio::time::timeout(Duration::from_secs(2), alert_task).await.is_err() {
        warn!("Alert dispatcher still busy at exit");
    }

    info!("Prediction Trader stopped");
    Ok(())
}

/// Print the state rebuilt from the audit log.
fn show_status(db_path: &str) -> Result<()> {
    if !Path::new(db_path).exists() {
        println!("Audit database not found: {}", db_path);
        return Ok(());
    }

    let audit = AuditLog::open(Box::new(SqliteAuditStore::open(db_path)?))?;
    let Some(replayed) = replay(&audit.records()?)? else {
        println!("Audit log is empty, nothing has run yet.");
        return Ok(());
    };

    let now = chrono::Utc::now();
    let snapshot = replayed.state.ledger.snapshot(now);
    let pnl = snapshot.equity - replayed.state.ledger.starting_cash();

    println!("Account (audit sequence {})", replayed.last_sequence);
    println!("   Starting cash:  {:.2}", replayed.state.ledger.starting_cash());
    println!("   Cash:           {:.2}", snapshot.cash);
    println!("   Equity:         {:.2}", snapshot.equity);
    println!(
        "   PnL:            {:.2} ({:+.2}%)",
        pnl,
        replayed.state.ledger.total_return() * dec!(100)
    );
    println!("   Daily loss:     {:.2} ({})", snapshot.daily_loss, snapshot.day);
    if replayed.paused {
        println!("   Trading is PAUSED");
    }
    if let Some(reason) = &replayed.halted {
        println!("   Trading is HALTED: {}", reason);
    }

    println!("\nPositions ({})", snapshot.positions.len());
    for pos in &snapshot.positions {
        println!(
            "   {:<24} qty {:>10} @ {:.4} realized {:.2}",
            pos.market_id, pos.quantity, pos.avg_entry_price, pos.realized_pnl
        );
    }

    let open: Vec<_> = replayed.state.open_orders().collect();
    println!("\nOpen orders ({})", open.len());
    for order in open {
        println!(
            "   {} {} {} {}/{} @ {} {}",
            order.id,
            order.market_id,
            order.side,
            order.filled_quantity,
            order.quantity,
            order.limit_price,
            order.status
        );
    }

    let pending: Vec<_> = replayed
        .approvals
        .iter()
        .filter(|r| r.effective_status(now) == prediction_trader::risk::ApprovalStatus::Pending)
        .collect();
    println!("\nPending approvals ({})", pending.len());
    for request in pending {
        println!(
            "   {} {} {:.2} until {}",
            request.id,
            request.opportunity.market_id,
            request.opportunity.suggested_notional,
            request.deadline.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}

fn verify(db_path: &str) -> Result<()> {
    let store = SqliteAuditStore::open(db_path)?;
    let audit = AuditLog::open(Box::new(store)).context("Audit log failed verification")?;
    let records = audit.verify()?;
    println!("Audit log intact: {} records", records);
    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "prediction-trader.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("prediction_trader=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

fn log_config(config: &Config) {
    info!("Configuration:");
    info!("   Feed: {:?} every {}s", config.feed.source, config.feed.poll_interval_secs);
    info!("   Strategy: {:?}", config.scanner.strategy);
    info!(
        "   Single trade cap: {:.1}%",
        config.risk.single_trade_cap_pct * dec!(100)
    );
    info!("   Daily loss limit: {}", config.risk.daily_loss_limit);
    info!(
        "   Manual approval above: {} (timeout {}s)",
        config.risk.manual_approval_threshold, config.approval.timeout_secs
    );
    info!("   Audit log: {}", config.audit.db_path);
}

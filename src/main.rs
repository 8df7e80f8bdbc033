//! Basis bot entry point.
//!
//! Wires the OKX gateway, SQLite records and the rebalance controller
//! together behind a small CLI. `run` is the long-lived mode; the other
//! subcommands are one-shot operations against the same position.

use anyhow::{Context, Result};
use basis_bot::config::Config;
use basis_bot::exchange::types::TickerEvent;
use basis_bot::exchange::{ExchangeGateway, OkxClient};
use basis_bot::executor::{AddParams, Executor, ExitFlag, ReduceParams};
use basis_bot::monitor::Monitor;
use basis_bot::position::{InstrumentIds, PositionReader};
use basis_bot::stats::{SpreadStats, SqliteSpreadStats};
use basis_bot::store::{RecordStore, SqliteStore};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Spacing between persisted spread samples.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "basis-bot", version)]
#[command(about = "Spot/swap basis trading with liquidation-aware rebalancing")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the hedge and rebalance automatically (default)
    Run,
    /// Open or enlarge the hedged position
    Open {
        /// Quote capital to deploy, in USDT
        #[arg(long)]
        usdt: Decimal,
        /// Required swap premium over spot before a pair is fired
        #[arg(long, default_value = "0.002")]
        price_diff: Decimal,
    },
    /// Close the whole position
    Close {
        /// Highest acceptable close premium of swap over spot
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        price_diff: Decimal,
    },
    /// Show the position, funding history and annualized return
    Status {
        /// Window in days; zero means since the first recorded funding
        #[arg(long, default_value = "0")]
        days: u32,
    },
    /// Backfill realized funding from the account bill archive
    Backfill,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging()?;

    let cli = Cli::parse();
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    if let Some(dir) = Path::new(&config.store.db_path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }

    let gateway: Arc<dyn ExchangeGateway> = Arc::new(OkxClient::new(&config.exchange)?);
    let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open(&config.store.db_path)?);
    let stats = Arc::new(SqliteSpreadStats::open(&config.store.db_path)?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(gateway, store, stats, &config).await,
        Commands::Open { usdt, price_diff } => {
            open(gateway, store, stats, &config, usdt, price_diff).await
        }
        Commands::Close { price_diff } => close(gateway, store, stats, &config, price_diff).await,
        Commands::Status { days } => status(gateway, store, stats, &config, days).await,
        Commands::Backfill => backfill(gateway, store, stats, &config).await,
    }
}

fn init_logging() -> Result<()> {
    std::fs::create_dir_all("logs")?;
    let file_appender = tracing_appender::rolling::hourly("logs", "basis-bot.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    // Keep the writer thread alive for the lifetime of the process.
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("basis_bot=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .init();
    Ok(())
}

/// Record spot/swap spread samples so the statistics windows the
/// controller and executor consult stay populated. Resubscribes
/// whenever the venue drops the stream.
async fn record_spreads(
    gateway: Arc<dyn ExchangeGateway>,
    stats: Arc<SqliteSpreadStats>,
    currency: String,
) {
    let ids = InstrumentIds::new(&currency);
    let wanted = [ids.spot.clone(), ids.swap.clone()];
    let mut last_sample = Instant::now() - SAMPLE_INTERVAL;

    loop {
        let mut stream = match gateway.subscribe_tickers(&wanted).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "spread recorder failed to subscribe");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        let mut spot = None;
        let mut swap = None;
        while let Some(event) = stream.recv().await {
            let TickerEvent::Ticker(ticker) = event else {
                continue;
            };
            if ticker.inst_id == ids.spot {
                spot = Some(ticker);
            } else if ticker.inst_id == ids.swap {
                swap = Some(ticker);
            }
            if last_sample.elapsed() < SAMPLE_INTERVAL {
                continue;
            }
            if let (Some(spot), Some(swap)) = (&spot, &swap) {
                if let Err(err) = stats.record(&currency, spot, swap) {
                    warn!(error = %err, "failed to record spread sample");
                }
                last_sample = Instant::now();
            }
        }
        warn!("ticker stream closed, resubscribing");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn arm_ctrl_c(exit: ExitFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown requested, stopping after the current slice");
            exit.trigger();
        }
    });
}

async fn run(
    gateway: Arc<dyn ExchangeGateway>,
    store: Arc<dyn RecordStore>,
    stats: Arc<SqliteSpreadStats>,
    config: &Config,
) -> Result<()> {
    info!(
        instrument = %config.portfolio.instrument,
        leverage = config.portfolio.leverage,
        "starting rebalance controller"
    );
    let monitor = Monitor::new(
        Arc::clone(&gateway),
        Arc::clone(&store),
        Arc::clone(&stats) as Arc<dyn SpreadStats>,
        config,
    )
    .await?;
    arm_ctrl_c(monitor.exit_flag());

    let recorder = tokio::spawn(record_spreads(
        Arc::clone(&gateway),
        stats,
        config.portfolio.instrument.clone(),
    ));
    let result = monitor.watch().await;
    recorder.abort();
    result?;
    info!("controller stopped");
    Ok(())
}

async fn open(
    gateway: Arc<dyn ExchangeGateway>,
    store: Arc<dyn RecordStore>,
    stats: Arc<SqliteSpreadStats>,
    config: &Config,
    usdt: Decimal,
    price_diff: Decimal,
) -> Result<()> {
    let executor = Executor::new(
        Arc::clone(&gateway),
        store,
        Arc::clone(&stats) as Arc<dyn SpreadStats>,
        config.portfolio.account_id,
        &config.portfolio.instrument,
        ExitFlag::new(),
    )
    .await?;
    arm_ctrl_c(executor.exit_flag());
    let recorder = tokio::spawn(record_spreads(
        gateway,
        stats,
        config.portfolio.instrument.clone(),
    ));

    let params = AddParams {
        usdt_size: usdt,
        target_size: Decimal::ZERO,
        leverage: config.portfolio.leverage,
        price_diff,
        accelerate_after: config.monitor.accelerate_after_hours,
    };
    let result = executor.open(&params).await;
    recorder.abort();
    let filled = result?;
    info!(%filled, "open finished");
    Ok(())
}

async fn close(
    gateway: Arc<dyn ExchangeGateway>,
    store: Arc<dyn RecordStore>,
    stats: Arc<SqliteSpreadStats>,
    config: &Config,
    price_diff: Decimal,
) -> Result<()> {
    let executor = Executor::new(
        Arc::clone(&gateway),
        store,
        Arc::clone(&stats) as Arc<dyn SpreadStats>,
        config.portfolio.account_id,
        &config.portfolio.instrument,
        ExitFlag::new(),
    )
    .await?;
    arm_ctrl_c(executor.exit_flag());
    let recorder = tokio::spawn(record_spreads(
        gateway,
        stats,
        config.portfolio.instrument.clone(),
    ));

    let params = ReduceParams {
        target_size: Decimal::ZERO,
        price_diff,
        accelerate_after: config.monitor.accelerate_after_hours,
    };
    let result = executor.close_all(&params).await;
    recorder.abort();
    let closed = result?;
    info!(%closed, "close finished");
    Ok(())
}

async fn status(
    gateway: Arc<dyn ExchangeGateway>,
    store: Arc<dyn RecordStore>,
    stats: Arc<SqliteSpreadStats>,
    config: &Config,
    days: u32,
) -> Result<()> {
    let reader = PositionReader::new(Arc::clone(&gateway), &config.portfolio.instrument).await?;
    match reader.swap_position().await? {
        Some(pos) => {
            let spot = reader.spot_size().await?;
            info!(
                instrument = %config.portfolio.instrument,
                contracts = %pos.contracts,
                spot_size = %spot,
                avg_price = %pos.avg_price,
                last = %pos.last,
                liquidation_price = %pos.liquidation_price,
                margin = %pos.margin,
                unrealized_pnl = %pos.unrealized_pnl,
                "swap position"
            );
        }
        None => info!(
            instrument = %config.portfolio.instrument,
            "no open swap position"
        ),
    }

    if let Some(book) = store.find_portfolio(
        config.portfolio.account_id,
        &config.portfolio.instrument,
    )? {
        info!(
            leverage = book.leverage,
            size = %book.size,
            updated_at = %book.updated_at,
            "tracked book"
        );
    }

    if let Some(summary) = store.funding_summary(
        config.portfolio.account_id,
        &config.portfolio.instrument,
    )? {
        info!(
            total = %summary.total,
            settlements = summary.count,
            first = %summary.first,
            last = %summary.last,
            "recorded funding"
        );
    } else {
        info!("no funding recorded yet");
    }

    let monitor = Monitor::new(gateway, store, stats as Arc<dyn SpreadStats>, config).await?;
    let apr = monitor.apr(days).await?;
    info!(days, apr = %apr, "annualized return on gross position");
    Ok(())
}

async fn backfill(
    gateway: Arc<dyn ExchangeGateway>,
    store: Arc<dyn RecordStore>,
    stats: Arc<SqliteSpreadStats>,
    config: &Config,
) -> Result<()> {
    let monitor = Monitor::new(gateway, store, stats as Arc<dyn SpreadStats>, config).await?;
    let inserted = monitor.backfill_funding().await?;
    info!(inserted, "funding backfill complete");
    Ok(())
}

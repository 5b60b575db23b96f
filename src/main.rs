//! BANKNIFTY Intraday - Main Entry Point
//!
//! Logs in, starts the short straddle and the daily session refresh, and
//! serves the control panel until Ctrl-C or a fatal broker error.

use anyhow::{Context, Result};
use banknifty_intraday::broker::totp::totp_now;
use banknifty_intraday::clock::{Clock, SystemClock};
use banknifty_intraday::config::{Config, Credentials};
use banknifty_intraday::control::{AppState, ControlServer};
use banknifty_intraday::error::BrokerError;
use banknifty_intraday::ledger::{CsvLedger, StraddleOrderRecord, TRADEBOOK_KEYS};
use banknifty_intraday::session::{run_session_refresh, BrokerSession, PositionTracker, SessionSlot};
use banknifty_intraday::strategy::{StraddleBook, StraddleStrategy, TrendFollowController};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

#[derive(Parser)]
#[command(name = "banknifty-intraday")]
#[command(version, about = "Intraday BANKNIFTY option strategies on Zerodha Kite")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print an order ledger as JSON
    Tradebook {
        /// Show the short straddle ledger instead of the Five-EMA one
        #[arg(long)]
        straddle: bool,
    },

    /// Print the current login one-time code from the credentials file
    Totp,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = Config::load()?;
    config.validate()?;

    // Flushes the log file when dropped, so it must outlive every return below
    let _log_guard = init_logging(&config.paths.logs_dir)?;

    match cli.command {
        Some(Commands::Tradebook { straddle }) => {
            show_tradebook(&config, straddle)?;
            return Ok(ExitCode::SUCCESS);
        }
        Some(Commands::Totp) => {
            show_totp(&config)?;
            return Ok(ExitCode::SUCCESS);
        }
        None => {
            // Default: run the bot
        }
    }

    info!("BANKNIFTY Intraday v{} starting", env!("CARGO_PKG_VERSION"));
    log_config(&config);

    let creds = Credentials::load(&config.broker.credentials_file)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(config.utc_offset_minutes));
    let tracker = Arc::new(PositionTracker::new());
    let ema_ledger = Arc::new(CsvLedger::new(&config.paths.ema_ledger));
    let straddle_ledger = Arc::new(CsvLedger::new(&config.paths.straddle_ledger));

    let session = match BrokerSession::authenticate(
        &config,
        &creds,
        clock.clone(),
        tracker.clone(),
        ema_ledger.clone(),
    )
    .await
    {
        Ok(session) => session,
        Err(e) => {
            error!("CRITICAL: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };
    let slot = Arc::new(SessionSlot::new(session));

    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<BrokerError>();
    let running = Arc::new(AtomicBool::new(true));

    // Short straddle runs every day for the life of the process
    let straddle_book = Arc::new(StraddleBook::new());
    let straddle = StraddleStrategy::new(
        slot.clone(),
        clock.clone(),
        config.straddle.clone(),
        straddle_book.clone(),
        straddle_ledger,
        running.clone(),
        config.session.retry_delay(),
    );
    let straddle_fatal = fatal_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = straddle.run().await {
            let _ = straddle_fatal.send(e);
        }
    });

    // Fresh login shortly after each open
    let refresh_fatal = fatal_tx.clone();
    let refresh = {
        let config = config.clone();
        let clock = clock.clone();
        let tracker = tracker.clone();
        let ledger = ema_ledger.clone();
        run_session_refresh(slot.clone(), clock.clone(), move || {
            let config = config.clone();
            let creds = creds.clone();
            let clock = clock.clone();
            let tracker = tracker.clone();
            let ledger = ledger.clone();
            async move { BrokerSession::authenticate(&config, &creds, clock, tracker, ledger).await }
        })
    };
    tokio::spawn(async move {
        if let Err(e) = refresh.await {
            let _ = refresh_fatal.send(e);
        }
    });

    let trend = Arc::new(TrendFollowController::new(
        slot.clone(),
        clock.clone(),
        config.paths.params_file.clone(),
        config.session.retry_delay(),
        fatal_tx.clone(),
    ));

    let server = ControlServer::new(AppState {
        slot,
        trend: trend.clone(),
        straddle: straddle_book,
        ema_ledger,
        params_file: config.paths.params_file.clone(),
        underlying: config.underlying.clone(),
    });

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    let bind_addr = config.server.bind_addr.clone();
    let server_task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = stop_rx.changed().await;
        };
        if let Err(e) = server.serve(&bind_addr, shutdown).await {
            error!("Control panel stopped: {:#}", e);
        }
    });

    let exit_code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            ExitCode::SUCCESS
        }
        Some(e) = fatal_rx.recv() => {
            error!("CRITICAL: {}", e);
            ExitCode::FAILURE
        }
    };

    running.store(false, Ordering::SeqCst);
    trend.stop().await;
    let _ = stop_tx.send(true);
    if let Err(e) = server_task.await {
        warn!("Control panel task failed: {}", e);
    }

    info!("Shutdown complete");
    Ok(exit_code)
}

fn show_tradebook(config: &Config, straddle: bool) -> Result<()> {
    let body = if straddle {
        let rows: Vec<StraddleOrderRecord> =
            CsvLedger::new(&config.paths.straddle_ledger).read()?;
        serde_json::to_string_pretty(&rows)?
    } else {
        let rows = CsvLedger::new(&config.paths.ema_ledger).read_json(TRADEBOOK_KEYS)?;
        serde_json::to_string_pretty(&rows)?
    };
    println!("{}", body);
    Ok(())
}

fn show_totp(config: &Config) -> Result<()> {
    let creds = Credentials::load(&config.broker.credentials_file)?;
    let code = totp_now(&creds.totp_code).context("Failed to compute one-time code")?;
    println!("{}", code);
    Ok(())
}

/// Initialize logging to stdout and a daily rolling file. The returned guard
/// flushes pending file writes when dropped.
fn init_logging(logs_dir: &Path) -> Result<WorkerGuard> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("Failed to create log directory {:?}", logs_dir))?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "banknifty-intraday.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("banknifty_intraday=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false)
        .init();

    Ok(guard)
}

fn log_config(config: &Config) {
    info!("Configuration:");
    info!("   Underlying: {}", config.underlying);
    info!("   Control panel: {}", config.server.bind_addr);
    info!(
        "   Straddle: {} x {} per leg, band {} per unit, paper {}",
        config.straddle.lots,
        config.straddle.lot_size,
        config.straddle.band(),
        config.straddle.paper_trading
    );
    info!("   Five-EMA parameters: {:?}", config.paths.params_file);
    info!("   Ledgers: {:?}, {:?}", config.paths.ema_ledger, config.paths.straddle_ledger);
}

//! `xarb run`: the engine against paper venues.
//!
//! ## Example Usage
//!
//! ```bash
//! # Demo feed, maker-hedge mode, five minutes
//! cargo run -p xarb-cli -- run --config config/xarb.toml --mode maker-hedge --duration 5m
//!
//! # Replay normalized book events from a capture, taker mode
//! cat books.jsonl | cargo run -p xarb-cli -- run --feed stdin --mode taker
//! ```

use anyhow::{bail, Result};
use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use xarb_arbitrage_cross::{ArbEngine, BotHealth, FillRouter, PaperFillPolicy, PaperVenue};
use xarb_core::{ConfigLoader, ConfigWatcher, EngineConfig, ExecutionMode, VenuePair};

use super::duration::parse_duration;
use super::feed::{stdin_feed, DemoFeed};

/// Execution mode override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    MakerHedge,
    Taker,
}

impl From<ModeArg> for ExecutionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::MakerHedge => ExecutionMode::MakerHedge,
            ModeArg::Taker => ExecutionMode::Taker,
        }
    }
}

/// Where book events come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FeedArg {
    /// Synthetic books with occasional cross-venue dislocations
    #[default]
    Demo,
    /// JSONL `BookEvent`s on stdin
    Stdin,
}

/// Arguments for the run command.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Config file path (TOML or JSON)
    #[arg(short, long, default_value = "config/xarb.toml")]
    pub config: PathBuf,

    /// Override the configured execution mode
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Book event source
    #[arg(long, value_enum, default_value = "demo")]
    pub feed: FeedArg,

    /// How long to run (e.g., "30s", "5m", "2h"); runs until Ctrl+C if omitted
    #[arg(long, value_parser = parse_duration)]
    pub duration: Option<Duration>,

    /// Interval between demo feed rounds
    #[arg(long, default_value = "250ms", value_parser = parse_duration)]
    pub demo_interval: Duration,

    /// Seed for the demo feed and paper fills
    #[arg(long, env = "XARB_SEED")]
    pub seed: Option<u64>,

    /// Probability that a paper taker order fills
    #[arg(long, default_value = "0.85")]
    pub taker_fill_rate: f64,

    /// Probability that a paper maker order is hit
    #[arg(long, default_value = "0.5")]
    pub maker_fill_rate: f64,

    /// Reload race parameters when the config file changes
    #[arg(long)]
    pub watch: bool,

    /// Seconds between health log lines
    #[arg(long, default_value = "30")]
    pub health_interval_secs: u64,
}

impl RunArgs {
    fn load_config(&self) -> Result<EngineConfig> {
        let mut config = ConfigLoader::load_from(&self.config)?;
        if let Some(mode) = self.mode {
            config.mode = mode.into();
        }
        if config.events.is_empty() {
            bail!(
                "No events configured in {}; add [[events]] entries",
                self.config.display()
            );
        }
        Ok(config)
    }

    fn paper_policy(&self) -> PaperFillPolicy {
        PaperFillPolicy {
            taker_fill_rate: self.taker_fill_rate.clamp(0.0, 1.0),
            maker_fill_rate: self.maker_fill_rate.clamp(0.0, 1.0),
            ..PaperFillPolicy::default()
        }
    }
}

/// Runs the engine until the duration elapses, stdin closes or Ctrl+C.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the engine
/// cannot be built.
pub async fn run_engine(args: RunArgs) -> Result<()> {
    let config = args.load_config()?;
    log_config(&config, &args);

    let fills = Arc::new(FillRouter::new());
    let mut venue = PaperVenue::new(VenuePair::splat(args.paper_policy()), Arc::clone(&fills));
    if let Some(seed) = args.seed {
        venue = venue.with_seed(seed);
    }
    let engine = Arc::new(ArbEngine::new(config.clone(), Arc::new(venue), fills)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (book_tx, book_rx) = mpsc::channel(1_024);
    let feed_handle = engine.spawn_feed(book_rx);

    let source = match args.feed {
        FeedArg::Demo => {
            let demo = DemoFeed::new(config.events.clone(), args.seed);
            tokio::spawn(demo.run(args.demo_interval, book_tx, shutdown_rx.clone()))
        }
        FeedArg::Stdin => tokio::spawn(async move {
            if let Err(e) = stdin_feed(book_tx).await {
                warn!(error = %e, "Stdin feed failed");
            }
        }),
    };

    if args.watch {
        let (watcher, config_rx) = ConfigWatcher::new(config, args.config.clone());
        tokio::spawn(async move {
            if let Err(e) = watcher.watch().await {
                warn!(error = %e, "Config watcher stopped");
            }
        });
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.watch_config(config_rx).await });
    }

    let runner = {
        let engine = Arc::clone(&engine);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { engine.run(shutdown_rx).await })
    };

    let health = {
        let engine = Arc::clone(&engine);
        let mut shutdown_rx = shutdown_rx;
        let every = Duration::from_secs(args.health_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => log_health(&engine.export_bot_health()),
                    _ = shutdown_rx.changed() => return,
                }
            }
        })
    };

    wait_for_stop(args.duration, args.feed, source).await;
    info!("Shutting down, waiting for in-flight attempts");
    let _ = shutdown_tx.send(true);

    if let Err(e) = runner.await {
        warn!(error = %e, "Engine task failed");
    }
    health.abort();
    feed_handle.abort();

    let final_health = engine.export_bot_health();
    log_summary(&final_health);
    println!("{}", serde_json::to_string_pretty(&final_health)?);
    Ok(())
}

async fn wait_for_stop(
    duration: Option<Duration>,
    feed: FeedArg,
    source: tokio::task::JoinHandle<()>,
) {
    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    // A finished stdin feed means the capture is exhausted; give the last
    // scan a chance to see it.
    let feed_done = async {
        if feed == FeedArg::Stdin {
            let _ = source.await;
            tokio::time::sleep(Duration::from_secs(2)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = deadline => info!("Duration elapsed"),
        () = feed_done => info!("Book feed exhausted"),
        result = tokio::signal::ctrl_c() => {
            if result.is_ok() {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
        }
    }
}

fn log_config(config: &EngineConfig, args: &RunArgs) {
    info!("========================================");
    info!("  XARB CROSS-VENUE ARBITRAGE            ");
    info!("========================================");
    info!("Mode:                  {}", config.mode);
    info!("Feed:                  {:?}", args.feed);
    info!("Events:                {}", config.events.len());
    info!("Scan Interval:         {}ms", config.scan_interval.as_millis());
    info!("----------------------------------------");
    info!("Detection:");
    info!("  Min Edge:            {} bps", config.detector.min_edge_bps);
    info!("  Max Slippage:        {} bps", config.detector.max_slippage_bps);
    info!("  Max Staleness:       {}ms", config.detector.max_staleness_ms);
    info!("  Candidate Size:      {}", config.detector.candidate_size);
    info!("----------------------------------------");
    info!("Risk:");
    info!("  Max Trade Size:      {}", config.risk.max_trade_size);
    info!("  Max Event Exposure:  ${}", config.risk.max_event_exposure);
    info!("  Max Portfolio:       ${}", config.risk.max_portfolio_exposure);
    info!("  Max Daily Loss:      ${}", config.risk.max_daily_loss);
    info!("----------------------------------------");
    info!("Paper Fills:");
    info!("  Taker Fill Rate:     {:.0}%", args.taker_fill_rate * 100.0);
    info!("  Maker Fill Rate:     {:.0}%", args.maker_fill_rate * 100.0);
    match args.duration {
        Some(d) => info!("Duration:              {}s", d.as_secs()),
        None => info!("Duration:              until Ctrl+C"),
    }
    info!("========================================");
}

fn log_health(health: &BotHealth) {
    info!(
        uptime_secs = health.uptime_secs,
        books_usable = health.books_usable,
        books_tracked = health.books_tracked,
        in_flight = health.in_flight_attempts,
        attempts = health.stats.attempts_started,
        daily_pnl = %health.risk.daily_pnl,
        kill_switch = health.risk.kill_switch_active,
        "Engine health"
    );
}

fn log_summary(health: &BotHealth) {
    let stats = &health.stats;
    info!("========================================");
    info!("         SESSION SUMMARY                ");
    info!("========================================");
    info!("Runtime:              {}s", health.uptime_secs);
    info!("Scans:                {}", stats.scans_performed);
    info!("Book Updates:         {}", stats.book_updates);
    info!("----------------------------------------");
    info!("Opportunities:");
    info!("  Detected:           {}", stats.opportunities_detected);
    info!("  Rejected by Risk:   {}", stats.risk_rejections);
    info!("  Attempts:           {}", stats.attempts_started);
    info!("----------------------------------------");
    info!("Outcomes:");
    info!("  Both Filled:        {}", stats.both_filled);
    info!("  One-Sided:          {}", stats.one_sided);
    info!("  Both Failed:        {}", stats.both_failed);
    info!("----------------------------------------");
    info!("Financials:");
    info!("  Daily P&L:          ${}", health.risk.daily_pnl);
    info!("  Realized P&L:       ${}", health.realized_pnl);
    info!("  Open Positions:     {}", health.open_positions);
    info!("========================================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: RunArgs,
    }

    // ==================== Argument Tests ====================

    #[test]
    fn test_defaults() {
        let cli = TestCli::parse_from(["xarb"]);
        assert_eq!(cli.args.feed, FeedArg::Demo);
        assert_eq!(cli.args.demo_interval, Duration::from_millis(250));
        assert!(cli.args.duration.is_none());
        assert!(cli.args.mode.is_none());
    }

    #[test]
    fn test_mode_and_duration_parse() {
        let cli = TestCli::parse_from(["xarb", "--mode", "taker", "--duration", "90s"]);
        assert_eq!(cli.args.mode, Some(ModeArg::Taker));
        assert_eq!(cli.args.duration, Some(Duration::from_secs(90)));
        assert_eq!(ExecutionMode::from(ModeArg::MakerHedge), ExecutionMode::MakerHedge);
    }

    #[test]
    fn test_paper_policy_clamps_rates() {
        let cli = TestCli::parse_from(["xarb", "--taker-fill-rate", "1.5"]);
        let policy = cli.args.paper_policy();
        assert!((policy.taker_fill_rate - 1.0).abs() < f64::EPSILON);
        assert!((policy.maker_fill_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_config_without_events_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xarb.toml");
        std::fs::write(&path, "mode = \"taker\"\n").unwrap();
        let cli = TestCli::parse_from(["xarb", "--config", path.to_str().unwrap()]);
        let err = cli.args.load_config().unwrap_err();
        assert!(err.to_string().contains("No events"));
    }
}

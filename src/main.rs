//! Multi-exchange crypto arbitrage monitor.
//!
//! Wires the feed adapters, the detection engine, and the terminal
//! dashboard together. Exit code is 0 on a clean shutdown (signal or
//! benchmark completion) and nonzero when the primary feed cannot connect
//! or calibration fails at startup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spreadwatch::config::MonitorConfig;
use spreadwatch::dashboard::TerminalDashboard;
use spreadwatch::engine::{DetectionEngine, EngineConfig};
use spreadwatch::feeds::{
    BinanceFeed, BybitFeed, CoinbaseFeed, ExchangeFeed, KrakenFeed, QuoteSink,
};
use spreadwatch::latency::QueueLatencyTracker;
use spreadwatch::queue::build_queue;
use spreadwatch::{feeds, timing};

#[derive(Parser, Debug)]
#[command(name = "spreadwatch")]
#[command(about = "Cross-exchange BBO arbitrage monitor")]
struct Args {
    /// Auto-shutdown after N latency reports (benchmark mode, N >= 1).
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    max_reports: Option<u32>,

    /// Path to a TOML config file. Defaults to monitor.toml when present.
    #[arg(long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Disable the terminal dashboard (logs and reports only).
    #[arg(long)]
    no_dashboard: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let config = match &args.config {
        Some(path) => MonitorConfig::load(path)?,
        None => MonitorConfig::from_env(),
    };

    // Calibration failure means latency numbers would be garbage: refuse
    // to start.
    let calibrator = timing::init().context("cycle counter calibration failed")?;
    info!(
        cycles_per_second = calibrator.cycles_per_second(),
        rdtsc_overhead_ns = calibrator.rdtsc_overhead_ns(),
        "clock calibrated"
    );

    let tracker = Arc::new(QueueLatencyTracker::new(Arc::clone(&calibrator)));
    for venue in [
        feeds::binance::VENUE,
        feeds::coinbase::VENUE,
        feeds::kraken::VENUE,
        feeds::bybit::VENUE,
    ] {
        tracker.register(venue);
    }

    let queue = build_queue(config.queue, Arc::clone(&tracker));
    info!(queue = queue.label(), symbols = config.symbols.len(), "starting monitor");

    let engine = Arc::new(DetectionEngine::new(
        queue,
        tracker,
        EngineConfig {
            min_profit_bps: config.min_profit_bps,
            tick_interval: Duration::from_millis(config.tick_interval_ms),
            max_reports: args.max_reports.unwrap_or(0),
            report_interval: Duration::from_secs(config.report_interval_secs),
            pin_thread: config.pin_threads,
        },
    ));

    let dashboard = (!args.no_dashboard).then(|| {
        let dashboard = Arc::new(TerminalDashboard::new(Duration::from_millis(
            config.dashboard_refresh_ms,
        )));
        dashboard.set_engine(Arc::clone(&engine));
        dashboard
    });

    // Every decoded BBO update lands in the engine; the dashboard keeps its
    // own copy for display.
    let sink: QuoteSink = {
        let engine = Arc::clone(&engine);
        let dashboard = dashboard.clone();
        Arc::new(move |quote| {
            if let Some(dashboard) = &dashboard {
                dashboard.update_market_data(quote.clone());
            }
            engine.ingest(quote);
        })
    };

    let mut connected_feeds: Vec<Box<dyn ExchangeFeed>> = Vec::new();
    {
        // Binance is the primary source: without it the monitor is not
        // viable, so its connect failure is fatal.
        if config.venues.binance {
            let binance = Box::new(BinanceFeed::new(config.symbols.clone(), Arc::clone(&sink)));
            binance
                .connect()
                .context("primary feed (Binance) failed to connect")?;
            connected_feeds.push(binance);
        }

        let secondaries: Vec<Box<dyn ExchangeFeed>> = vec![
            Box::new(CoinbaseFeed::new(config.symbols.clone(), Arc::clone(&sink))),
            Box::new(KrakenFeed::new(config.symbols.clone(), Arc::clone(&sink))),
            Box::new(BybitFeed::new(config.symbols.clone(), Arc::clone(&sink))),
        ];
        for feed in secondaries {
            let enabled = match feed.venue() {
                feeds::coinbase::VENUE => config.venues.coinbase,
                feeds::kraken::VENUE => config.venues.kraken,
                feeds::bybit::VENUE => config.venues.bybit,
                _ => false,
            };
            if !enabled {
                continue;
            }
            match feed.connect() {
                Ok(()) => connected_feeds.push(feed),
                Err(e) => warn!(venue = feed.venue(), "feed unavailable, continuing: {e:#}"),
            }
        }
    }

    if connected_feeds.is_empty() {
        error!("no exchange feeds connected");
        anyhow::bail!("no exchange feeds connected");
    }
    info!(feeds = connected_feeds.len(), "feeds connected, data flowing");

    // Benchmark completion flips this from the detection thread.
    let benchmark_done = Arc::new(tokio::sync::Notify::new());
    {
        let benchmark_done = Arc::clone(&benchmark_done);
        engine.set_shutdown_callback(move || benchmark_done.notify_one());
    }

    engine.start();
    if let Some(dashboard) = &dashboard {
        dashboard.start();
    }
    if let Some(n) = args.max_reports {
        info!(reports = n, "benchmark mode: auto-shutdown after ~{}s", n as u64 * config.report_interval_secs);
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut poll = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("shutdown signal received");
                break;
            }
            _ = benchmark_done.notified() => {
                info!("benchmark complete");
                break;
            }
            _ = poll.tick() => {
                if !connected_feeds.iter().any(|f| f.is_connected()) {
                    warn!("all exchange feeds disconnected, shutting down");
                    break;
                }
            }
        }
    }

    engine.stop();
    if let Some(dashboard) = &dashboard {
        dashboard.stop();
    }
    for feed in &connected_feeds {
        info!(
            venue = feed.venue(),
            messages = feed.message_count(),
            "disconnecting feed"
        );
        feed.disconnect();
    }

    info!("monitor stopped cleanly");
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("spreadwatch={level}")));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

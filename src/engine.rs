//! Cross-venue arbitrage detection engine.
//!
//! One dedicated thread owns the market book. Each tick it drains the quote
//! queue, buckets fresh quotes by canonical symbol, walks every cross-venue
//! pair in both directions, and publishes the tick's opportunities for
//! readers. Every ten wall-seconds it also prints the queue latency report,
//! and in benchmark mode shuts the process down after a fixed number of
//! reports.
//!
//! The book is never locked: it lives on the detection thread and nothing
//! else touches it. The only shared state is the published opportunity
//! vector (swapped atomically once per tick), the callback slot, and the
//! running flag.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::affinity;
use crate::latency::QueueLatencyTracker;
use crate::models::{MarketBook, Opportunity, Quote};
use crate::normalize::canonical_symbol;
use crate::queue::QuoteQueue;

/// Pairs whose quote ages differ by more than this are not comparable.
const MAX_PAIR_AGE_SKEW_MS: i64 = 500;

pub type OpportunityCallback = Box<dyn Fn(&Opportunity) + Send>;
pub type ShutdownCallback = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum profit threshold in basis points.
    pub min_profit_bps: f64,
    /// Detection tick cadence.
    pub tick_interval: Duration,
    /// Auto-shutdown after this many latency reports. 0 runs forever.
    pub max_reports: u32,
    /// Cadence of the latency report.
    pub report_interval: Duration,
    /// Pin the detection thread to its affinity tag.
    pub pin_thread: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_profit_bps: 5.0,
            tick_interval: Duration::from_millis(100),
            max_reports: 0,
            report_interval: Duration::from_secs(10),
            pin_thread: true,
        }
    }
}

pub struct DetectionEngine {
    queue: Arc<dyn QuoteQueue>,
    tracker: Arc<QueueLatencyTracker>,
    config: EngineConfig,

    /// Most recent tick's opportunities, replaced wholesale each tick.
    opportunities: ArcSwap<Vec<Opportunity>>,
    callback: Mutex<Option<OpportunityCallback>>,
    shutdown_callback: Mutex<Option<ShutdownCallback>>,

    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,

    scan_count: AtomicU64,
    opportunity_count: AtomicU64,
    report_count: AtomicU32,
}

impl DetectionEngine {
    pub fn new(
        queue: Arc<dyn QuoteQueue>,
        tracker: Arc<QueueLatencyTracker>,
        config: EngineConfig,
    ) -> Self {
        Self {
            queue,
            tracker,
            config,
            opportunities: ArcSwap::from_pointee(Vec::new()),
            callback: Mutex::new(None),
            shutdown_callback: Mutex::new(None),
            running: AtomicBool::new(false),
            handle: Mutex::new(None),
            scan_count: AtomicU64::new(0),
            opportunity_count: AtomicU64::new(0),
            report_count: AtomicU32::new(0),
        }
    }

    /// Accept a quote from a feed thread. Never blocks.
    #[inline]
    pub fn ingest(&self, quote: Quote) {
        self.queue.push(quote);
    }

    /// Register the per-opportunity callback. Replaces any previous one.
    /// Invoked on the detection thread; it must not block.
    pub fn set_opportunity_callback<F>(&self, callback: F)
    where
        F: Fn(&Opportunity) + Send + 'static,
    {
        *self.callback.lock() = Some(Box::new(callback));
    }

    /// Invoked exactly once when `max_reports` is reached. Not invoked on
    /// `stop()`.
    pub fn set_shutdown_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.shutdown_callback.lock() = Some(Box::new(callback));
    }

    /// Spawn the detection thread. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let engine = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("detection-engine".to_string())
            .spawn(move || engine.run_loop())
            .expect("spawning detection thread");
        *self.handle.lock() = Some(handle);

        info!(queue = self.queue.label(), "detection engine started");
    }

    /// Flag the loop down and join it, then print the final latency report.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
            self.tracker.print_report(self.queue.label());
            self.queue.report_drops();
            info!("detection engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Full copy of the last tick's opportunities.
    pub fn snapshot_opportunities(&self) -> Vec<Opportunity> {
        self.opportunities.load().as_ref().clone()
    }

    pub fn scan_count(&self) -> u64 {
        self.scan_count.load(Ordering::Relaxed)
    }

    pub fn opportunity_count(&self) -> u64 {
        self.opportunity_count.load(Ordering::Relaxed)
    }

    fn run_loop(self: Arc<Self>) {
        if self.config.pin_thread {
            affinity::pin_current_thread(affinity::TAG_DETECTION);
        }

        let mut book = MarketBook::new();
        let mut last_report = Instant::now();

        while self.running.load(Ordering::Relaxed) {
            let now_ms = Utc::now().timestamp_millis();
            self.tick(&mut book, now_ms);

            if last_report.elapsed() >= self.config.report_interval {
                last_report = Instant::now();
                if self.emit_report() {
                    break;
                }
            }

            thread::sleep(self.config.tick_interval);
        }
    }

    /// One detection pass against the given wall clock: drain, bucket,
    /// scan, publish. Returns the number of opportunities found this tick.
    pub fn tick(&self, book: &mut MarketBook, now_ms: i64) -> usize {
        self.queue.drain_all(book);
        self.scan_count.fetch_add(1, Ordering::Relaxed);

        // Bucket usable quotes by the asset they trade. Non-finite quotes
        // stay in the book for diagnostics but cannot pair.
        let mut buckets: HashMap<String, Vec<&Quote>> = HashMap::new();
        for quote in book.values() {
            if !quote.freshness(now_ms).is_usable() || !quote.has_finite_fields() {
                continue;
            }
            buckets
                .entry(canonical_symbol(&quote.raw_symbol))
                .or_default()
                .push(quote);
        }

        let mut found: Vec<Opportunity> = Vec::new();
        for (symbol, quotes) in &buckets {
            if quotes.len() < 2 {
                continue;
            }
            for i in 0..quotes.len() {
                for j in (i + 1)..quotes.len() {
                    let (q1, q2) = (quotes[i], quotes[j]);

                    let skew = (q1.age_ms(now_ms) - q2.age_ms(now_ms)).abs();
                    if skew > MAX_PAIR_AGE_SKEW_MS {
                        continue;
                    }

                    self.check_direction(symbol, q1, q2, &mut found);
                    self.check_direction(symbol, q2, q1, &mut found);
                }
            }
        }

        let count = found.len();
        self.opportunities.store(Arc::new(found));
        count
    }

    /// Evaluate one direction of a pair: buy at `buy`'s ask, sell at
    /// `sell`'s bid.
    fn check_direction(
        &self,
        symbol: &str,
        buy: &Quote,
        sell: &Quote,
        out: &mut Vec<Opportunity>,
    ) {
        if sell.bid_price <= buy.ask_price {
            return;
        }
        let profit_bps = ((sell.bid_price - buy.ask_price) / buy.ask_price) * 10_000.0;
        // A zero ask turns the division non-finite; that is a broken quote,
        // not a trade.
        if !profit_bps.is_finite() || profit_bps < self.config.min_profit_bps {
            return;
        }

        let opportunity = Opportunity {
            symbol: symbol.to_string(),
            buy_venue: buy.venue,
            sell_venue: sell.venue,
            buy_price: buy.ask_price,
            sell_price: sell.bid_price,
            profit_bps,
            max_size: buy.ask_size.min(sell.bid_size),
            wall_ms: Utc::now().timestamp_millis(),
        };

        debug!(
            symbol,
            buy = opportunity.buy_venue,
            sell = opportunity.sell_venue,
            profit_bps = opportunity.profit_bps,
            "arbitrage opportunity"
        );

        self.opportunity_count.fetch_add(1, Ordering::Relaxed);
        self.invoke_callback(&opportunity);
        out.push(opportunity);
    }

    fn invoke_callback(&self, opportunity: &Opportunity) {
        let guard = self.callback.lock();
        if let Some(callback) = guard.as_ref() {
            if catch_unwind(AssertUnwindSafe(|| callback(opportunity))).is_err() {
                error!(
                    symbol = %opportunity.symbol,
                    "opportunity callback panicked, continuing"
                );
            }
        }
    }

    /// Print the periodic report. Returns true when the benchmark report
    /// budget is exhausted and the loop should exit.
    fn emit_report(&self) -> bool {
        let n = self.report_count.fetch_add(1, Ordering::Relaxed) + 1;
        if self.config.max_reports > 0 {
            println!("\n[Report {n}/{}]", self.config.max_reports);
        } else {
            println!("\n[Report {n}]");
        }
        self.tracker.print_report(self.queue.label());
        self.queue.report_drops();

        if self.config.max_reports > 0 && n >= self.config.max_reports {
            info!(reports = n, "benchmark complete, shutting down");
            self.running.store(false, Ordering::SeqCst);
            let callback = self.shutdown_callback.lock().take();
            if let Some(callback) = callback {
                callback();
            }
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MutexQuoteQueue;
    use crate::timing::TscCalibrator;
    use std::sync::atomic::AtomicUsize;

    const T: i64 = 1_700_000_000_000;

    fn test_engine(config: EngineConfig) -> Arc<DetectionEngine> {
        let cal = Arc::new(TscCalibrator::calibrate().expect("calibration"));
        let tracker = Arc::new(QueueLatencyTracker::new(cal));
        let queue: Arc<dyn QuoteQueue> = Arc::new(MutexQuoteQueue::new(Arc::clone(&tracker)));
        Arc::new(DetectionEngine::new(queue, tracker, config))
    }

    #[allow(clippy::too_many_arguments)]
    fn quote(
        venue: &'static str,
        raw: &str,
        bid: f64,
        ask: f64,
        bid_size: f64,
        ask_size: f64,
        wall_ms: i64,
    ) -> Quote {
        Quote {
            venue,
            raw_symbol: raw.to_string(),
            bid_price: bid,
            ask_price: ask,
            bid_size,
            ask_size,
            wall_ms,
            enqueue_tsc: 0,
        }
    }

    fn sorted_by_profit(mut opps: Vec<Opportunity>) -> Vec<Opportunity> {
        opps.sort_by(|a, b| b.profit_bps.partial_cmp(&a.profit_bps).unwrap());
        opps
    }

    #[test]
    fn crossed_book_same_age_emits_one_opportunity() {
        let engine = test_engine(EngineConfig::default());
        engine.ingest(quote("VenueA", "BTCUSDT", 100.0, 100.1, 5.0, 3.0, T));
        engine.ingest(quote("VenueB", "BTC-USD", 100.5, 100.6, 2.0, 4.0, T));

        let mut book = MarketBook::new();
        assert_eq!(engine.tick(&mut book, T + 10), 1);

        let opps = engine.snapshot_opportunities();
        assert_eq!(opps.len(), 1);
        let o = &opps[0];
        assert_eq!(o.symbol, "BTC");
        assert_eq!(o.buy_venue, "VenueA");
        assert_eq!(o.sell_venue, "VenueB");
        assert_eq!(o.buy_price, 100.1);
        assert_eq!(o.sell_price, 100.5);
        assert!((o.profit_bps - 39.960_039_96).abs() < 1e-6, "got {}", o.profit_bps);
        assert_eq!(o.max_size, 2.0);
        assert!(o.sell_price > o.buy_price);
        assert_eq!(engine.opportunity_count(), 1);
    }

    #[test]
    fn spread_below_threshold_is_rejected() {
        let engine = test_engine(EngineConfig::default());
        engine.ingest(quote("VenueA", "BTCUSDT", 100.0, 100.1, 5.0, 3.0, T));
        engine.ingest(quote("VenueB", "BTC-USD", 100.101, 100.2, 2.0, 4.0, T));

        let mut book = MarketBook::new();
        assert_eq!(engine.tick(&mut book, T + 10), 0);
        assert!(engine.snapshot_opportunities().is_empty());
    }

    #[test]
    fn pair_age_skew_over_500ms_is_rejected() {
        let engine = test_engine(EngineConfig::default());
        engine.ingest(quote("VenueA", "BTCUSDT", 100.0, 100.1, 5.0, 3.0, T - 600));
        engine.ingest(quote("VenueB", "BTC-USD", 100.5, 100.6, 2.0, 4.0, T));

        let mut book = MarketBook::new();
        assert_eq!(engine.tick(&mut book, T + 10), 0);
    }

    #[test]
    fn stale_quotes_never_pair() {
        let engine = test_engine(EngineConfig::default());
        engine.ingest(quote("VenueA", "BTCUSDT", 100.0, 100.1, 5.0, 3.0, T - 6_000));
        engine.ingest(quote("VenueB", "BTC-USD", 100.5, 100.6, 2.0, 4.0, T));

        let mut book = MarketBook::new();
        assert_eq!(engine.tick(&mut book, T + 10), 0);
        // The stale quote is still retained in the book.
        assert!(book.contains_key(&("VenueA", "BTCUSDT".to_string())));
    }

    #[test]
    fn three_venues_emit_every_qualifying_direction() {
        let engine = test_engine(EngineConfig::default());
        engine.ingest(quote("VenueA", "BTCUSDT", 100.0, 100.2, 9.0, 5.0, T));
        engine.ingest(quote("VenueB", "BTC-USD", 100.4, 100.3, 7.0, 6.0, T));
        engine.ingest(quote("VenueC", "BTC/USD", 100.5, 100.6, 8.0, 2.0, T));

        let mut book = MarketBook::new();
        engine.tick(&mut book, T + 10);

        let opps = sorted_by_profit(engine.snapshot_opportunities());
        assert_eq!(opps.len(), 3);

        // Highest profit first: A->C, A->B, B->C.
        assert_eq!((opps[0].buy_venue, opps[0].sell_venue), ("VenueA", "VenueC"));
        assert!((opps[0].profit_bps - (0.3 / 100.2) * 10_000.0).abs() < 1e-9);
        assert_eq!(opps[0].max_size, 5.0);

        assert_eq!((opps[1].buy_venue, opps[1].sell_venue), ("VenueA", "VenueB"));
        assert!((opps[1].profit_bps - (0.2 / 100.2) * 10_000.0).abs() < 1e-9);
        assert_eq!(opps[1].max_size, 5.0);

        assert_eq!((opps[2].buy_venue, opps[2].sell_venue), ("VenueB", "VenueC"));
        assert!((opps[2].profit_bps - (0.2 / 100.3) * 10_000.0).abs() < 1e-9);
        assert_eq!(opps[2].max_size, 6.0);

        for o in &opps {
            assert!(o.sell_price > o.buy_price);
            assert!(o.profit_bps >= 5.0);
        }
    }

    #[test]
    fn non_finite_quotes_stay_in_book_but_never_pair() {
        let engine = test_engine(EngineConfig::default());
        engine.ingest(quote("VenueA", "BTCUSDT", 100.0, f64::NAN, 5.0, 3.0, T));
        engine.ingest(quote("VenueB", "BTC-USD", 100.5, 100.6, 2.0, 4.0, T));

        let mut book = MarketBook::new();
        assert_eq!(engine.tick(&mut book, T + 10), 0);
        assert!(book.contains_key(&("VenueA", "BTCUSDT".to_string())));
    }

    #[test]
    fn zero_ask_cannot_produce_infinite_profit() {
        let engine = test_engine(EngineConfig::default());
        engine.ingest(quote("VenueA", "BTCUSDT", 0.0, 0.0, 5.0, 3.0, T));
        engine.ingest(quote("VenueB", "BTC-USD", 100.5, 100.6, 2.0, 4.0, T));

        let mut book = MarketBook::new();
        assert_eq!(engine.tick(&mut book, T + 10), 0);
    }

    #[test]
    fn last_writer_wins_in_the_book() {
        let engine = test_engine(EngineConfig::default());
        engine.ingest(quote("VenueA", "BTCUSDT", 99.0, 99.1, 1.0, 1.0, T - 100));
        engine.ingest(quote("VenueA", "BTCUSDT", 100.0, 100.1, 5.0, 3.0, T));

        let mut book = MarketBook::new();
        engine.tick(&mut book, T + 10);
        assert_eq!(book[&("VenueA", "BTCUSDT".to_string())].bid_price, 100.0);
    }

    #[test]
    fn callback_fires_per_emission_and_replacement_sticks() {
        let engine = test_engine(EngineConfig::default());
        let first_hits = Arc::new(AtomicUsize::new(0));
        let second_hits = Arc::new(AtomicUsize::new(0));

        {
            let hits = Arc::clone(&first_hits);
            engine.set_opportunity_callback(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let hits = Arc::clone(&second_hits);
            engine.set_opportunity_callback(move |o| {
                assert_eq!(o.symbol, "BTC");
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        engine.ingest(quote("VenueA", "BTCUSDT", 100.0, 100.1, 5.0, 3.0, T));
        engine.ingest(quote("VenueB", "BTC-USD", 100.5, 100.6, 2.0, 4.0, T));
        let mut book = MarketBook::new();
        engine.tick(&mut book, T + 10);

        assert_eq!(first_hits.load(Ordering::SeqCst), 0);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_callback_does_not_poison_the_tick() {
        let engine = test_engine(EngineConfig::default());
        engine.set_opportunity_callback(|_| panic!("callback exploded"));

        engine.ingest(quote("VenueA", "BTCUSDT", 100.0, 100.1, 5.0, 3.0, T));
        engine.ingest(quote("VenueB", "BTC-USD", 100.5, 100.6, 2.0, 4.0, T));
        let mut book = MarketBook::new();
        engine.tick(&mut book, T + 10);

        // The opportunity is still recorded in the published buffer.
        assert_eq!(engine.snapshot_opportunities().len(), 1);
    }

    #[test]
    fn benchmark_mode_invokes_shutdown_exactly_once() {
        let engine = test_engine(EngineConfig {
            tick_interval: Duration::from_millis(1),
            report_interval: Duration::ZERO,
            max_reports: 2,
            pin_thread: false,
            ..EngineConfig::default()
        });
        let shutdowns = Arc::new(AtomicUsize::new(0));
        {
            let shutdowns = Arc::clone(&shutdowns);
            engine.set_shutdown_callback(move || {
                shutdowns.fetch_add(1, Ordering::SeqCst);
            });
        }

        engine.start();
        engine.start(); // idempotent

        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!engine.is_running(), "engine should stop after max reports");
        engine.stop();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }
}

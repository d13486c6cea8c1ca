//! ANSI terminal dashboard.
//!
//! Renders the cross-exchange market view and the engine's current
//! opportunities on a fixed cadence. The dashboard keeps its own copy of
//! the latest quotes, fed by the same sink the engine ingests from, so it
//! never touches the detection thread's book.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{Local, Utc};
use parking_lot::Mutex;
use tracing::info;

use crate::affinity;
use crate::engine::DetectionEngine;
use crate::models::{BookKey, MarketBook, Quote};

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";

/// Opportunities shown per refresh.
const MAX_OPPORTUNITY_ROWS: usize = 10;

pub struct TerminalDashboard {
    book: Mutex<MarketBook>,
    previous_mids: Mutex<HashMap<BookKey, f64>>,
    engine: Mutex<Option<Arc<DetectionEngine>>>,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
    update_count: AtomicU64,
    refresh: Duration,
}

impl TerminalDashboard {
    pub fn new(refresh: Duration) -> Self {
        Self {
            book: Mutex::new(MarketBook::new()),
            previous_mids: Mutex::new(HashMap::new()),
            engine: Mutex::new(None),
            running: AtomicBool::new(false),
            handle: Mutex::new(None),
            update_count: AtomicU64::new(0),
            refresh,
        }
    }

    /// Wire up the engine whose opportunities get displayed.
    pub fn set_engine(&self, engine: Arc<DetectionEngine>) {
        *self.engine.lock() = Some(engine);
    }

    /// Record a quote for display. Called from feed threads via the sink.
    pub fn update_market_data(&self, quote: Quote) {
        let key = quote.book_key();
        let mut book = self.book.lock();
        if let Some(previous) = book.get(&key) {
            self.previous_mids.lock().insert(key.clone(), previous.mid_price());
        }
        book.insert(key, quote);
        self.update_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::Relaxed)
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let dashboard = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("dashboard".to_string())
            .spawn(move || dashboard.display_loop())
            .expect("spawning dashboard thread");
        *self.handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
            info!("dashboard stopped");
        }
    }

    fn display_loop(&self) {
        affinity::pin_current_thread(affinity::TAG_DASHBOARD);

        while self.running.load(Ordering::Relaxed) {
            let frame = self.render();
            // One write per frame keeps the redraw tear-free.
            print!("{frame}");
            thread::sleep(self.refresh);
        }
    }

    fn render(&self) -> String {
        let now_ms = Utc::now().timestamp_millis();
        let mut out = String::with_capacity(8 * 1024);

        // Clear screen, cursor home.
        out.push_str("\x1b[2J\x1b[H");

        self.render_header(&mut out);
        self.render_market_table(&mut out, now_ms);
        self.render_opportunities(&mut out, now_ms);
        out.push_str(&format!(
            "\n{CYAN}Ctrl-C to quit. Latency reports print every 10s.{RESET}\n"
        ));
        out
    }

    fn render_header(&self, out: &mut String) {
        let book_len = self.book.lock().len();
        out.push_str(&format!(
            "{BOLD}{CYAN}CROSS-EXCHANGE ARBITRAGE MONITOR{RESET}  {}  updates: {}  markets: {}\n\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            format_count(self.update_count()),
            book_len,
        ));
    }

    fn render_market_table(&self, out: &mut String, now_ms: i64) {
        out.push_str(&format!(
            "{BOLD}{:<10} {:<10} {:>14} {:>14} {:>11} {:>11} {:>9}  {:<6}{RESET}\n",
            "SYMBOL", "VENUE", "BID", "ASK", "BID SIZE", "ASK SIZE", "SPREAD", "STATUS"
        ));

        let book = self.book.lock();
        let previous = self.previous_mids.lock();

        let mut keys: Vec<&BookKey> = book.keys().collect();
        keys.sort_by(|a, b| (&a.1, a.0).cmp(&(&b.1, b.0)));

        for key in keys {
            let quote = &book[key];
            let freshness = quote.freshness(now_ms);
            let status_color = match freshness {
                crate::models::Freshness::Live => GREEN,
                crate::models::Freshness::Slow => YELLOW,
                crate::models::Freshness::Stale => RED,
            };
            let price_color = match previous.get(key) {
                Some(prev) if quote.mid_price() > *prev => GREEN,
                Some(prev) if quote.mid_price() < *prev => RED,
                _ => RESET,
            };

            out.push_str(&format!(
                "{:<10} {:<10} {price_color}{:>14.4}{RESET} {price_color}{:>14.4}{RESET} {:>11.4} {:>11.4} {:>7.2}bp  {status_color}{:<6}{RESET}\n",
                quote.raw_symbol,
                quote.venue,
                quote.bid_price,
                quote.ask_price,
                quote.bid_size,
                quote.ask_size,
                quote.spread_bps(),
                freshness.label(),
            ));
        }
    }

    fn render_opportunities(&self, out: &mut String, now_ms: i64) {
        let engine = self.engine.lock().clone();
        let Some(engine) = engine else {
            return;
        };

        let mut opportunities = engine.snapshot_opportunities();
        opportunities.sort_by(|a, b| {
            b.profit_bps
                .partial_cmp(&a.profit_bps)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        out.push_str(&format!(
            "\n{BOLD}ARBITRAGE OPPORTUNITIES{RESET}  (scans: {}, total found: {})\n",
            format_count(engine.scan_count()),
            format_count(engine.opportunity_count()),
        ));

        if opportunities.is_empty() {
            out.push_str("  none this tick\n");
            return;
        }

        out.push_str(&format!(
            "{BOLD}{:<8} {:<10} {:<10} {:>12} {:>12} {:>9} {:>10} {:>7}{RESET}\n",
            "SYMBOL", "BUY@", "SELL@", "BUY PX", "SELL PX", "PROFIT", "MAX SIZE", "AGE"
        ));
        for o in opportunities.iter().take(MAX_OPPORTUNITY_ROWS) {
            out.push_str(&format!(
                "{GREEN}{:<8} {:<10} {:<10} {:>12.4} {:>12.4} {:>7.2}bp {:>10.4} {:>5}ms{RESET}\n",
                o.symbol,
                o.buy_venue,
                o.sell_venue,
                o.buy_price,
                o.sell_price,
                o.profit_bps,
                o.max_size,
                (now_ms - o.wall_ms).max(0),
            ));
        }
        if opportunities.len() > MAX_OPPORTUNITY_ROWS {
            out.push_str(&format!(
                "  ... and {} more\n",
                opportunities.len() - MAX_OPPORTUNITY_ROWS
            ));
        }
    }
}

fn format_count(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(venue: &'static str, raw: &str, bid: f64, wall_ms: i64) -> Quote {
        Quote {
            venue,
            raw_symbol: raw.to_string(),
            bid_price: bid,
            ask_price: bid + 0.1,
            bid_size: 1.0,
            ask_size: 2.0,
            wall_ms,
            enqueue_tsc: 0,
        }
    }

    #[test]
    fn updates_accumulate_and_render() {
        let dash = TerminalDashboard::new(Duration::from_millis(500));
        let now = Utc::now().timestamp_millis();
        dash.update_market_data(quote("VenueA", "BTCUSDT", 50_000.0, now));
        dash.update_market_data(quote("VenueB", "BTC-USD", 50_010.0, now));
        dash.update_market_data(quote("VenueA", "BTCUSDT", 50_005.0, now));

        assert_eq!(dash.update_count(), 3);

        let frame = dash.render();
        assert!(frame.contains("BTCUSDT"));
        assert!(frame.contains("VenueB"));
        assert!(frame.contains("LIVE"));
    }

    #[test]
    fn stale_quotes_are_flagged() {
        let dash = TerminalDashboard::new(Duration::from_millis(500));
        let now = Utc::now().timestamp_millis();
        dash.update_market_data(quote("VenueA", "BTCUSDT", 50_000.0, now - 10_000));
        let frame = dash.render();
        assert!(frame.contains("STALE"));
    }

    #[test]
    fn counts_format_compactly() {
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1_500), "1.5K");
        assert_eq!(format_count(2_500_000), "2.5M");
    }
}

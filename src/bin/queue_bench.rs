//! Offline A/B benchmark for the quote queue variants.
//!
//! Pushes synthetic quotes from N producer threads through the lock-free
//! ring and the mutex baseline while a consumer drains concurrently, then
//! prints both latency reports. No sockets involved; this isolates the
//! handoff cost itself.
//!
//! Usage:
//!   queue_bench --producers 4 --quotes-per-producer 250000

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;

use spreadwatch::latency::QueueLatencyTracker;
use spreadwatch::models::{MarketBook, Quote, Venue};
use spreadwatch::queue::{build_queue, QueueKind, QuoteQueue};
use spreadwatch::timing;

const VENUES: [Venue; 4] = ["Binance", "Coinbase", "Kraken", "Bybit"];

#[derive(Parser, Debug)]
#[command(name = "queue_bench")]
#[command(about = "A/B latency benchmark of the quote queue variants")]
struct Args {
    /// Producer thread count (each gets its own venue tag, cycled).
    #[arg(long, default_value_t = 4)]
    producers: usize,

    /// Quotes pushed by each producer.
    #[arg(long, default_value_t = 250_000)]
    quotes_per_producer: usize,

    /// Consumer drain cadence in microseconds.
    #[arg(long, default_value_t = 100)]
    drain_interval_us: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let calibrator = timing::init()?;
    println!(
        "calibrated: {} cycles/s, rdtsc overhead {}ns",
        calibrator.cycles_per_second(),
        calibrator.rdtsc_overhead_ns()
    );

    for kind in [QueueKind::LockFree, QueueKind::Mutex] {
        let tracker = Arc::new(QueueLatencyTracker::new(Arc::clone(&calibrator)));
        let queue = build_queue(kind, Arc::clone(&tracker));
        run_benchmark(&args, queue, &tracker);
    }

    Ok(())
}

fn run_benchmark(args: &Args, queue: Arc<dyn QuoteQueue>, tracker: &QueueLatencyTracker) {
    println!("\n=== {} ===", queue.label());
    let started = Instant::now();
    let producers_done = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..args.producers)
        .map(|p| {
            let queue = Arc::clone(&queue);
            let count = args.quotes_per_producer;
            thread::spawn(move || {
                let venue = VENUES[p % VENUES.len()];
                let wall_ms = Utc::now().timestamp_millis();
                for i in 0..count {
                    queue.push(synthetic_quote(venue, p, i, wall_ms));
                }
            })
        })
        .collect();

    let consumer = {
        let queue = Arc::clone(&queue);
        let producers_done = Arc::clone(&producers_done);
        let drain_interval = std::time::Duration::from_micros(args.drain_interval_us);
        thread::spawn(move || {
            let mut book = MarketBook::new();
            let mut consumed = 0usize;
            loop {
                consumed += queue.drain_all(&mut book);
                if producers_done.load(Ordering::Acquire) && queue.drain_all(&mut book) == 0 {
                    break;
                }
                thread::sleep(drain_interval);
            }
            consumed
        })
    };

    for handle in handles {
        handle.join().expect("producer panicked");
    }
    producers_done.store(true, Ordering::Release);
    let consumed = consumer.join().expect("consumer panicked");

    let total = args.producers * args.quotes_per_producer;
    let elapsed = started.elapsed();
    println!(
        "pushed {total} quotes in {:.2}s ({:.0} quotes/s), consumed {consumed}, dropped {}",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64(),
        queue.drops(),
    );
    assert_eq!(consumed as u64 + queue.drops(), total as u64);

    tracker.print_report(queue.label());
}

fn synthetic_quote(venue: Venue, producer: usize, i: usize, wall_ms: i64) -> Quote {
    let base = 50_000.0 + (i % 100) as f64 * 0.1;
    Quote {
        venue,
        raw_symbol: "BTCUSDT".to_string(),
        bid_price: base,
        ask_price: base + 0.5,
        bid_size: 1.0 + (producer as f64),
        ask_size: 2.0,
        wall_ms,
        enqueue_tsc: 0,
    }
}

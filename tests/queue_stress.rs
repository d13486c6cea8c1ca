//! Concurrent stress test of the quote pipeline.
//!
//! Four producers hammer the lock-free queue with a million quotes total
//! while a consumer drains into a market book. Every quote is either
//! consumed or counted as dropped, payloads survive the handoff intact,
//! and push latency stays in the sub-millisecond range.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use rand::{Rng, SeedableRng};

use spreadwatch::latency::QueueLatencyTracker;
use spreadwatch::models::{MarketBook, Quote, Venue};
use spreadwatch::queue::{LockFreeQuoteQueue, QuoteQueue};
use spreadwatch::timing::TscCalibrator;

const PRODUCERS: usize = 4;
const PER_PRODUCER: usize = 250_000;
const VENUES: [Venue; PRODUCERS] = ["Binance", "Coinbase", "Kraken", "Bybit"];

#[test]
fn million_quote_stress_loses_nothing() {
    let calibrator = Arc::new(TscCalibrator::calibrate().expect("calibration"));
    let tracker = Arc::new(QueueLatencyTracker::new(calibrator));
    let queue = Arc::new(LockFreeQuoteQueue::new(4096, Arc::clone(&tracker)));

    let producers_done = Arc::new(AtomicBool::new(false));
    let wall_ms = Utc::now().timestamp_millis();

    let producer_handles: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut rng = rand::rngs::StdRng::seed_from_u64(p as u64);
                let venue = VENUES[p];
                for i in 0..PER_PRODUCER {
                    let base = 50_000.0 + rng.gen_range(0.0..100.0);
                    queue.push(Quote {
                        venue,
                        raw_symbol: format!("SYM{}USDT", i % 16),
                        bid_price: base,
                        ask_price: base + 0.5,
                        bid_size: rng.gen_range(0.0..10.0),
                        ask_size: rng.gen_range(0.0..10.0),
                        wall_ms,
                        enqueue_tsc: 0,
                    });
                }
            })
        })
        .collect();

    let consumer = {
        let queue = Arc::clone(&queue);
        let producers_done = Arc::clone(&producers_done);
        thread::spawn(move || {
            let mut book = MarketBook::new();
            let mut consumed = 0usize;
            loop {
                let drained = queue.drain_all(&mut book);
                consumed += drained;
                if drained == 0 && producers_done.load(Ordering::Acquire) {
                    // One final sweep for quotes published after the flag.
                    consumed += queue.drain_all(&mut book);
                    break;
                }
                if drained == 0 {
                    thread::sleep(Duration::from_micros(50));
                }
            }

            for quote in book.values() {
                assert!(quote.has_finite_fields(), "payload corrupted in transit");
                assert!(quote.enqueue_tsc > 0, "facade must stamp enqueue_tsc");
                assert_eq!(quote.wall_ms, wall_ms);
            }
            consumed
        })
    };

    for handle in producer_handles {
        handle.join().expect("producer panicked");
    }
    producers_done.store(true, Ordering::Release);
    let consumed = consumer.join().expect("consumer panicked");

    let total = (PRODUCERS * PER_PRODUCER) as u64;
    assert_eq!(
        consumed as u64 + queue.drops(),
        total,
        "every quote must be consumed or counted as dropped"
    );

    for venue in VENUES {
        // Intervals where the counter failed to advance are discarded, so
        // allow a sliver of slack below the push count.
        let count = tracker.count(venue);
        let expected = total / PRODUCERS as u64;
        assert!(count <= expected);
        assert!(count >= expected * 95 / 100, "{venue} recorded only {count}");
        let p99 = tracker
            .percentile_ns(venue, 99)
            .expect("samples recorded for every producer");
        assert!(
            p99 < 1_000_000,
            "{venue} push p99 {p99}ns exceeds 1ms on a quiescent machine"
        );
    }
}

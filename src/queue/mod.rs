//! Quote handoff between exchange feed threads and the detection thread.
//!
//! Two interchangeable variants sit behind one trait:
//! - `LockFreeQuoteQueue`: the bounded MPSC ring. Never blocks a producer;
//!   a full ring drops the quote and bumps a counter.
//! - `MutexQuoteQueue`: a plain FIFO behind one lock. Unbounded, never
//!   drops. Kept as the contention baseline for latency comparisons.
//!
//! Both stamp `enqueue_tsc` and record the push interval in the latency
//! tracker, keyed by the quote's venue, together with the occupancy
//! observed just before the push.

pub mod mpsc;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::warn;

use crate::latency::QueueLatencyTracker;
use crate::models::{MarketBook, Quote};
use crate::timing::rdtsc;

/// Ring capacity for the lock-free variant. Power of two.
pub const DEFAULT_RING_CAPACITY: usize = 4096;

/// Which queue variant to run. Both are always compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    #[default]
    LockFree,
    Mutex,
}

/// Uniform interface over the two variants. `push` never blocks the caller;
/// `drain_all` is consumer-side only and empties the queue into the book,
/// overwriting by `(venue, raw_symbol)`.
pub trait QuoteQueue: Send + Sync {
    fn push(&self, quote: Quote);
    fn drain_all(&self, book: &mut MarketBook) -> usize;
    /// Quotes dropped because the queue was full.
    fn drops(&self) -> u64;
    /// Log accumulated drops, if any.
    fn report_drops(&self);
    /// Human tag for reports.
    fn label(&self) -> &'static str;
}

/// Build the configured variant.
pub fn build_queue(kind: QueueKind, tracker: Arc<QueueLatencyTracker>) -> Arc<dyn QuoteQueue> {
    match kind {
        QueueKind::LockFree => Arc::new(LockFreeQuoteQueue::new(DEFAULT_RING_CAPACITY, tracker)),
        QueueKind::Mutex => Arc::new(MutexQuoteQueue::new(tracker)),
    }
}

/// Lock-free variant over the Vyukov ring.
pub struct LockFreeQuoteQueue {
    ring: mpsc::MpscRing<Quote>,
    dropped: AtomicU64,
    tracker: Arc<QueueLatencyTracker>,
}

impl LockFreeQuoteQueue {
    pub fn new(capacity: usize, tracker: Arc<QueueLatencyTracker>) -> Self {
        Self {
            ring: mpsc::MpscRing::with_capacity(capacity),
            dropped: AtomicU64::new(0),
            tracker,
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

impl QuoteQueue for LockFreeQuoteQueue {
    fn push(&self, mut quote: Quote) {
        let venue = quote.venue;
        let occupancy = self.ring.len();

        let start_tsc = rdtsc();
        quote.enqueue_tsc = start_tsc;
        if self.ring.try_push(quote).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        let end_tsc = rdtsc();

        self.tracker.record(venue, start_tsc, end_tsc, occupancy);
    }

    fn drain_all(&self, book: &mut MarketBook) -> usize {
        let mut count = 0;
        while let Some(quote) = self.ring.try_pop() {
            book.insert(quote.book_key(), quote);
            count += 1;
        }
        count
    }

    fn drops(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn report_drops(&self) {
        let drops = self.drops();
        if drops > 0 {
            warn!(drops, "quote queue dropped messages while full");
        }
    }

    fn label(&self) -> &'static str {
        "MPSC Lock-Free"
    }
}

/// Mutex baseline: all producers contend on one lock, nothing is dropped.
pub struct MutexQuoteQueue {
    inner: Mutex<VecDeque<Quote>>,
    tracker: Arc<QueueLatencyTracker>,
}

impl MutexQuoteQueue {
    pub fn new(tracker: Arc<QueueLatencyTracker>) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            tracker,
        }
    }
}

impl QuoteQueue for MutexQuoteQueue {
    fn push(&self, mut quote: Quote) {
        let venue = quote.venue;

        let start_tsc = rdtsc();
        quote.enqueue_tsc = start_tsc;
        let occupancy;
        {
            let mut inner = self.inner.lock();
            occupancy = inner.len();
            inner.push_back(quote);
        }
        let end_tsc = rdtsc();

        self.tracker.record(venue, start_tsc, end_tsc, occupancy);
    }

    fn drain_all(&self, book: &mut MarketBook) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.len();
        for quote in inner.drain(..) {
            book.insert(quote.book_key(), quote);
        }
        count
    }

    fn drops(&self) -> u64 {
        0
    }

    fn report_drops(&self) {}

    fn label(&self) -> &'static str {
        "Mutex-based"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::TscCalibrator;

    fn tracker() -> Arc<QueueLatencyTracker> {
        let cal = Arc::new(TscCalibrator::calibrate().expect("calibration"));
        Arc::new(QueueLatencyTracker::new(cal))
    }

    fn quote(venue: &'static str, raw: &str, bid: f64, wall_ms: i64) -> Quote {
        Quote {
            venue,
            raw_symbol: raw.to_string(),
            bid_price: bid,
            ask_price: bid + 0.1,
            bid_size: 1.0,
            ask_size: 1.0,
            wall_ms,
            enqueue_tsc: 0,
        }
    }

    fn exercise_drain(queue: &dyn QuoteQueue) {
        queue.push(quote("VenueA", "BTCUSDT", 100.0, 1));
        queue.push(quote("VenueB", "BTC-USD", 101.0, 2));
        // Same key again: last writer wins in the book.
        queue.push(quote("VenueA", "BTCUSDT", 102.0, 3));

        let mut book = MarketBook::new();
        let drained = queue.drain_all(&mut book);
        assert_eq!(drained, 3);
        assert_eq!(book.len(), 2);

        let key = ("VenueA", "BTCUSDT".to_string());
        let latest = &book[&key];
        assert_eq!(latest.bid_price, 102.0);
        assert_eq!(latest.wall_ms, 3);
        // Facade stamped the enqueue timestamp.
        assert!(latest.enqueue_tsc > 0);

        let mut book2 = MarketBook::new();
        assert_eq!(queue.drain_all(&mut book2), 0);
    }

    #[test]
    fn lock_free_drain_is_last_writer_wins() {
        let q = LockFreeQuoteQueue::new(16, tracker());
        exercise_drain(&q);
        assert_eq!(q.drops(), 0);
    }

    #[test]
    fn mutex_drain_is_last_writer_wins() {
        let q = MutexQuoteQueue::new(tracker());
        exercise_drain(&q);
        assert_eq!(q.drops(), 0);
    }

    #[test]
    fn lock_free_full_queue_counts_drops() {
        let q = LockFreeQuoteQueue::new(4, tracker());
        for i in 0..6 {
            q.push(quote("VenueA", "BTCUSDT", 100.0 + i as f64, i));
        }
        assert_eq!(q.drops(), 2);

        let mut book = MarketBook::new();
        assert_eq!(q.drain_all(&mut book), 4);
        // The retained quotes are the first four pushed.
        assert_eq!(book[&("VenueA", "BTCUSDT".to_string())].bid_price, 103.0);
    }

    #[test]
    fn pushes_feed_the_latency_tracker() {
        let t = tracker();
        let q = LockFreeQuoteQueue::new(16, Arc::clone(&t));
        for i in 0..10 {
            q.push(quote("VenueA", "BTCUSDT", 100.0, i));
        }
        assert_eq!(t.count("VenueA"), 10);
    }

    #[test]
    fn build_queue_honors_kind() {
        let t = tracker();
        assert_eq!(build_queue(QueueKind::LockFree, Arc::clone(&t)).label(), "MPSC Lock-Free");
        assert_eq!(build_queue(QueueKind::Mutex, t).label(), "Mutex-based");
    }
}

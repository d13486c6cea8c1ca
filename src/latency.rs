//! Per-producer queue push-latency tracking.
//!
//! Every push into the quote queue records a cycle-counter interval here,
//! keyed by the producing venue. Recording is lock-free: counters are
//! atomics, min/max are CAS loops, and samples land in a fixed 10k-entry
//! ring per producer that old samples simply wrap over. Percentiles are
//! computed on demand by copying a producer's ring into a per-report
//! scratch vector and sorting it; a producer writing concurrently can make
//! that percentile a few samples stale, which is acceptable and by contract
//! never blocks the producer.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam::utils::CachePadded;
use tracing::warn;

use crate::models::Venue;
use crate::timing::TscCalibrator;

/// Four venues plus headroom.
pub const MAX_PRODUCERS: usize = 8;

/// Samples retained per producer for percentile estimation.
pub const SAMPLE_WINDOW: usize = 10_000;

/// Histogram bucket upper bounds in nanoseconds, rendered in reports.
const BUCKET_BOUNDS_NS: [u64; 8] = [50, 100, 250, 500, 1_000, 5_000, 10_000, u64::MAX];
const BUCKET_LABELS: [&str; 8] = [
    "    <50ns", " 50-100ns", "100-250ns", "250-500ns", " 0.5-1us ", "  1-5us  ",
    "  5-10us ", "  >10us  ",
];
const BAR_WIDTH: usize = 40;

struct ProducerRecord {
    name: OnceLock<Venue>,
    count: AtomicU64,
    sum_ns: AtomicU64,
    min_ns: AtomicU64,
    max_ns: AtomicU64,
    sample_index: AtomicUsize,
    samples: Box<[AtomicU64]>,
    occupancy: Box<[AtomicU64]>,
}

impl ProducerRecord {
    fn new() -> Self {
        Self {
            name: OnceLock::new(),
            count: AtomicU64::new(0),
            sum_ns: AtomicU64::new(0),
            min_ns: AtomicU64::new(u64::MAX),
            max_ns: AtomicU64::new(0),
            sample_index: AtomicUsize::new(0),
            samples: (0..SAMPLE_WINDOW).map(|_| AtomicU64::new(0)).collect(),
            occupancy: (0..SAMPLE_WINDOW).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    fn record(&self, latency_ns: u64, occupancy: usize) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ns.fetch_add(latency_ns, Ordering::Relaxed);

        let mut current = self.min_ns.load(Ordering::Relaxed);
        while latency_ns < current {
            match self.min_ns.compare_exchange_weak(
                current,
                latency_ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        let mut current = self.max_ns.load(Ordering::Relaxed);
        while latency_ns > current {
            match self.max_ns.compare_exchange_weak(
                current,
                latency_ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        let idx = self.sample_index.fetch_add(1, Ordering::Relaxed) % SAMPLE_WINDOW;
        self.samples[idx].store(latency_ns, Ordering::Relaxed);
        self.occupancy[idx].store(occupancy as u64, Ordering::Relaxed);
    }

    fn window_len(&self) -> usize {
        self.sample_index.load(Ordering::Relaxed).min(SAMPLE_WINDOW)
    }

    /// Copy the sample ring into a fresh scratch vector. Concurrent writers
    /// may tear individual entries across the copy; percentiles tolerate it.
    fn copy_samples(&self) -> Vec<u64> {
        let n = self.window_len();
        (0..n).map(|i| self.samples[i].load(Ordering::Relaxed)).collect()
    }

    fn occupancy_summary(&self) -> (f64, u64, u64) {
        let n = self.window_len();
        if n == 0 {
            return (0.0, 0, 0);
        }
        let mut sum = 0u64;
        let mut min = u64::MAX;
        let mut max = 0u64;
        for i in 0..n {
            let v = self.occupancy[i].load(Ordering::Relaxed);
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        (sum as f64 / n as f64, min, max)
    }
}

/// Tracker shared by all producers of one queue.
pub struct QueueLatencyTracker {
    calibrator: Arc<TscCalibrator>,
    records: Vec<CachePadded<ProducerRecord>>,
    producer_count: AtomicUsize,
    register_lock: parking_lot::Mutex<()>,
}

impl QueueLatencyTracker {
    pub fn new(calibrator: Arc<TscCalibrator>) -> Self {
        Self {
            calibrator,
            records: (0..MAX_PRODUCERS)
                .map(|_| CachePadded::new(ProducerRecord::new()))
                .collect(),
            producer_count: AtomicUsize::new(0),
            register_lock: parking_lot::Mutex::new(()),
        }
    }

    /// Register a producer ahead of time. Recording also registers lazily;
    /// pre-registration just fixes the report ordering.
    pub fn register(&self, venue: Venue) -> usize {
        self.resolve(venue)
    }

    fn resolve(&self, venue: Venue) -> usize {
        let registered = self.producer_count.load(Ordering::Acquire);
        for (i, rec) in self.records.iter().take(registered).enumerate() {
            if rec.name.get().copied() == Some(venue) {
                return i;
            }
        }

        // Cold path. Registration is serialized; lookups stay lock-free.
        let _guard = self.register_lock.lock();
        let registered = self.producer_count.load(Ordering::Acquire);
        for (i, rec) in self.records.iter().take(registered).enumerate() {
            if rec.name.get().copied() == Some(venue) {
                return i;
            }
        }
        if registered >= MAX_PRODUCERS {
            warn!(venue, "producer table full, folding into slot 0");
            return 0;
        }
        self.records[registered]
            .name
            .set(venue)
            .expect("slot claimed under registration lock");
        self.producer_count.store(registered + 1, Ordering::Release);
        registered
    }

    /// Record one push. `start_tsc`/`end_tsc` bracket the push operation;
    /// `occupancy` is the queue depth observed just before it.
    pub fn record(&self, venue: Venue, start_tsc: u64, end_tsc: u64, occupancy: usize) {
        if start_tsc == 0 || end_tsc <= start_tsc {
            return;
        }
        let raw_ns = self.calibrator.cycles_to_ns(end_tsc - start_tsc);
        let latency_ns = raw_ns.saturating_sub(self.calibrator.rdtsc_overhead_ns());
        let idx = self.resolve(venue);
        self.records[idx].record(latency_ns, occupancy);
    }

    pub fn count(&self, venue: Venue) -> u64 {
        let idx = self.resolve(venue);
        self.records[idx].count.load(Ordering::Relaxed)
    }

    pub fn mean_ns(&self, venue: Venue) -> f64 {
        let idx = self.resolve(venue);
        let count = self.records[idx].count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.records[idx].sum_ns.load(Ordering::Relaxed) as f64 / count as f64
    }

    /// Percentile over the sample window, or None before any sample landed.
    pub fn percentile_ns(&self, venue: Venue, percentile: usize) -> Option<u64> {
        let idx = self.resolve(venue);
        let mut samples = self.records[idx].copy_samples();
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        Some(samples[(percentile * samples.len() / 100).min(samples.len() - 1)])
    }

    pub fn reset(&self) {
        let registered = self.producer_count.load(Ordering::Acquire);
        for rec in self.records.iter().take(registered) {
            rec.count.store(0, Ordering::Relaxed);
            rec.sum_ns.store(0, Ordering::Relaxed);
            rec.min_ns.store(u64::MAX, Ordering::Relaxed);
            rec.max_ns.store(0, Ordering::Relaxed);
            rec.sample_index.store(0, Ordering::Relaxed);
        }
    }

    /// Print the periodic report: one summary line per producer, one ASCII
    /// histogram per producer, one occupancy table. Runs entirely on the
    /// caller's thread against scratch copies; producers are never blocked.
    pub fn print_report(&self, queue_label: &str) {
        let registered = self.producer_count.load(Ordering::Acquire);

        println!();
        println!("╔═══════════════════════════════════════════════════════════════════════════╗");
        println!("║           QUEUE PUSH LATENCY ({queue_label:<20})                      ║");
        println!("╠═══════════════════════════════════════════════════════════════════════════╣");
        println!("║ Producer   │   Count   │    Mean    │   Median   │     Min    │    Max    ║");
        println!("╠═══════════════════════════════════════════════════════════════════════════╣");

        let mut sorted_windows: Vec<(usize, Vec<u64>)> = Vec::new();
        for i in 0..registered {
            let rec = &self.records[i];
            let count = rec.count.load(Ordering::Relaxed);
            if count == 0 {
                continue;
            }
            let mut samples = rec.copy_samples();
            samples.sort_unstable();
            let median = samples[samples.len() / 2];

            println!(
                "║ {:<10} │ {:>9} │ {:>10} │ {:>10} │ {:>10} │ {:>9} ║",
                rec.name.get().copied().unwrap_or("?"),
                count,
                format_ns(rec.sum_ns.load(Ordering::Relaxed) / count),
                format_ns(median),
                format_ns(rec.min_ns.load(Ordering::Relaxed)),
                format_ns(rec.max_ns.load(Ordering::Relaxed)),
            );
            sorted_windows.push((i, samples));
        }
        println!("╚═══════════════════════════════════════════════════════════════════════════╝");

        for (i, samples) in &sorted_windows {
            let rec = &self.records[*i];
            let name = rec.name.get().copied().unwrap_or("?");
            let p99 = samples[(99 * samples.len() / 100).min(samples.len() - 1)];
            println!();
            println!(
                "  {name} distribution (window of {} samples, p99 {}):",
                samples.len(),
                format_ns(p99)
            );

            let mut buckets = [0usize; BUCKET_BOUNDS_NS.len()];
            for &s in samples {
                let b = BUCKET_BOUNDS_NS.iter().position(|&bound| s < bound).unwrap_or(
                    BUCKET_BOUNDS_NS.len() - 1,
                );
                buckets[b] += 1;
            }
            let tallest = buckets.iter().copied().max().unwrap_or(1).max(1);
            for (label, &n) in BUCKET_LABELS.iter().zip(buckets.iter()) {
                let bar = "#".repeat(n * BAR_WIDTH / tallest);
                println!("    {label} │{bar:<BAR_WIDTH$}│ {n}");
            }
        }

        if !sorted_windows.is_empty() {
            println!();
            println!("  Occupancy at push (mean / min / max):");
            for (i, _) in &sorted_windows {
                let rec = &self.records[*i];
                let (mean, min, max) = rec.occupancy_summary();
                println!(
                    "    {:<10} {:>8.1} / {:>5} / {:>5}",
                    rec.name.get().copied().unwrap_or("?"),
                    mean,
                    min,
                    max
                );
            }
        }
        println!();
    }
}

/// Human units for a nanosecond value.
fn format_ns(ns: u64) -> String {
    if ns < 1_000 {
        format!("{ns}ns")
    } else if ns < 1_000_000 {
        format!("{:.1}us", ns as f64 / 1_000.0)
    } else {
        format!("{:.1}ms", ns as f64 / 1_000_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> QueueLatencyTracker {
        let cal = Arc::new(TscCalibrator::calibrate().expect("calibration"));
        QueueLatencyTracker::new(cal)
    }

    #[test]
    fn records_accumulate_per_producer() {
        let t = tracker();
        let cal = TscCalibrator::calibrate().expect("calibration");
        let cycles_1us = cal.ns_to_cycles(1_000).max(1);

        for i in 1..=100u64 {
            t.record("VenueA", i, i + cycles_1us, 3);
        }
        t.record("VenueB", 1, 1 + cycles_1us, 0);

        assert_eq!(t.count("VenueA"), 100);
        assert_eq!(t.count("VenueB"), 1);
        assert!(t.mean_ns("VenueA") > 0.0);
        assert!(t.percentile_ns("VenueA", 99).is_some());
    }

    #[test]
    fn invalid_intervals_are_ignored() {
        let t = tracker();
        t.record("VenueA", 0, 100, 0);
        t.record("VenueA", 100, 100, 0);
        t.record("VenueA", 100, 50, 0);
        assert_eq!(t.count("VenueA"), 0);
        assert!(t.percentile_ns("VenueA", 50).is_none());
    }

    #[test]
    fn sample_window_wraps_instead_of_growing() {
        let t = tracker();
        for i in 0..(SAMPLE_WINDOW as u64 + 500) {
            t.record("VenueA", 1, 2 + i, 1);
        }
        assert_eq!(t.count("VenueA"), SAMPLE_WINDOW as u64 + 500);
        let idx = t.resolve("VenueA");
        assert_eq!(t.records[idx].window_len(), SAMPLE_WINDOW);
    }

    #[test]
    fn registration_is_stable_and_bounded() {
        let t = tracker();
        let first = t.register("VenueA");
        assert_eq!(t.register("VenueA"), first);
        for i in 0..(MAX_PRODUCERS + 3) {
            let name = crate::models::intern_venue(&format!("Extra{i}"));
            let _ = t.register(name);
        }
        // Overflow folds into slot 0 rather than panicking.
        let overflow = crate::models::intern_venue("OverflowVenue");
        assert_eq!(t.register(overflow), 0);
    }

    #[test]
    fn report_runs_with_and_without_data() {
        let t = tracker();
        t.print_report("Lock-Free MPSC");
        t.record("VenueA", 10, 10_000, 2);
        t.print_report("Lock-Free MPSC");
    }
}

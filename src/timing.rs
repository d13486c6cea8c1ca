//! Cycle-accurate timing for queue latency measurement.
//!
//! Push latencies are captured as raw cycle-counter deltas and converted to
//! nanoseconds through a once-measured frequency. On x86_64 the unserialized
//! `rdtsc` is used directly; other architectures fall back to a
//! process-relative monotonic nanosecond clock, for which the conversion is
//! the identity.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{ensure, Result};

/// Iterations used to estimate the cost of a single counter read.
const OVERHEAD_ITERATIONS: u64 = 1000;

/// Calibration window. Longer windows tighten the frequency estimate.
const CALIBRATION_SLEEP: Duration = Duration::from_millis(120);

/// Read the cycle counter.
///
/// Unserialized on purpose: the measured intervals span hundreds of
/// instructions, so reordering error is noise next to the cost of a
/// serializing read on the hot path.
#[inline(always)]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        mono_ns()
    }
}

/// Process-relative monotonic nanoseconds. Fallback cycle source on
/// architectures without a userspace cycle counter.
#[inline(always)]
pub fn mono_ns() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// One-time cycle-counter calibration.
///
/// Measures `cycles_per_second` against the OS monotonic clock across a
/// sleep of at least 100 ms, then estimates the cost of a counter read
/// itself so recorded latencies can be corrected for it.
#[derive(Debug)]
pub struct TscCalibrator {
    cycles_per_second: u64,
    overhead_ns: u64,
}

impl TscCalibrator {
    /// Run the calibration. Fails when the measured frequency is unusable,
    /// in which case the process must not start (latency numbers would be
    /// garbage).
    pub fn calibrate() -> Result<Self> {
        #[cfg(not(target_arch = "x86_64"))]
        {
            // Fallback counter already ticks in nanoseconds.
            let mut cal = Self {
                cycles_per_second: 1_000_000_000,
                overhead_ns: 0,
            };
            cal.overhead_ns = cal.measure_overhead();
            return Ok(cal);
        }

        #[cfg(target_arch = "x86_64")]
        {
            let start_wall = Instant::now();
            let start_tsc = rdtsc();

            std::thread::sleep(CALIBRATION_SLEEP);

            let end_tsc = rdtsc();
            let elapsed_ns = start_wall.elapsed().as_nanos() as u64;

            ensure!(elapsed_ns > 0, "monotonic clock did not advance during calibration");
            ensure!(end_tsc > start_tsc, "cycle counter did not advance during calibration");

            let tsc_elapsed = end_tsc - start_tsc;
            let cycles_per_second =
                ((tsc_elapsed as u128 * 1_000_000_000) / elapsed_ns as u128) as u64;
            ensure!(cycles_per_second > 0, "cycle counter frequency measured as zero");

            let mut cal = Self {
                cycles_per_second,
                overhead_ns: 0,
            };
            cal.overhead_ns = cal.measure_overhead();
            Ok(cal)
        }
    }

    /// Mean cost of one counter read, from back-to-back read pairs.
    fn measure_overhead(&self) -> u64 {
        let mut total_cycles: u64 = 0;
        for _ in 0..OVERHEAD_ITERATIONS {
            let start = rdtsc();
            let end = rdtsc();
            total_cycles += end.saturating_sub(start);
        }
        self.cycles_to_ns(total_cycles / OVERHEAD_ITERATIONS)
    }

    /// Convert a cycle delta to nanoseconds. Integer math only; monotonic
    /// non-decreasing for monotonic inputs.
    #[inline]
    pub fn cycles_to_ns(&self, cycles: u64) -> u64 {
        ((cycles as u128 * 1_000_000_000) / self.cycles_per_second as u128) as u64
    }

    /// Convert nanoseconds back to a cycle count.
    #[inline]
    pub fn ns_to_cycles(&self, ns: u64) -> u64 {
        ((ns as u128 * self.cycles_per_second as u128) / 1_000_000_000) as u64
    }

    pub fn cycles_per_second(&self) -> u64 {
        self.cycles_per_second
    }

    /// Calibrated cost of a single `rdtsc` read.
    pub fn rdtsc_overhead_ns(&self) -> u64 {
        self.overhead_ns
    }
}

/// Calibrate the process-wide instance. Idempotent; only the entry points
/// call this. Everything else receives the calibrator by `Arc` so tests can
/// run private instances.
pub fn init() -> Result<Arc<TscCalibrator>> {
    static GLOBAL: OnceLock<Arc<TscCalibrator>> = OnceLock::new();
    if let Some(cal) = GLOBAL.get() {
        return Ok(cal.clone());
    }
    let cal = Arc::new(TscCalibrator::calibrate()?);
    Ok(GLOBAL.get_or_init(|| cal).clone())
}

//! Thread-to-core scheduling hints.
//!
//! Each long-lived thread asks to be scheduled on a distinct core before
//! entering its main loop: the detection thread gets the first tag, then
//! one per exchange feed, with the dashboard last. On Linux the tag maps to
//! a hard CPU mask via `sched_setaffinity`; elsewhere the hint is a no-op.
//! Pinning failures are warnings, never fatal.

use tracing::{debug, warn};

/// Hot path, most latency sensitive.
pub const TAG_DETECTION: usize = 1;
pub const TAG_BINANCE_FEED: usize = 2;
pub const TAG_COINBASE_FEED: usize = 3;
pub const TAG_KRAKEN_FEED: usize = 4;
pub const TAG_BYBIT_FEED: usize = 5;
/// Lowest priority.
pub const TAG_DASHBOARD: usize = 6;

/// Pin the current thread to the core implied by `tag`. Returns whether the
/// hint took effect.
pub fn pin_current_thread(tag: usize) -> bool {
    #[cfg(target_os = "linux")]
    {
        unsafe {
            let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_SET(tag % libc::CPU_SETSIZE as usize, &mut cpuset);
            let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset);
            if rc == 0 {
                debug!(tag, "pinned thread to core");
                true
            } else {
                warn!(
                    tag,
                    error = %std::io::Error::last_os_error(),
                    "failed to pin thread, continuing unpinned"
                );
                false
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        // No portable affinity mask here; the OS scheduler decides.
        debug!(tag, "thread affinity hint not supported on this platform");
        let _ = tag;
        true
    }
}

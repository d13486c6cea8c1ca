//! Exchange BBO feed adapters.
//!
//! One adapter per venue, each owning a dedicated OS thread that runs a
//! current-thread tokio runtime for its TLS WebSocket. Every decoded
//! top-of-book update becomes one `Quote`, wall-clock stamped at decode
//! time, and is handed to the caller's sink. Adapters reconnect on their
//! own with doubling backoff after the first successful connection; the
//! first connection attempt's outcome is reported synchronously from
//! `connect` so the entry point can decide whether the process is viable.

pub mod binance;
pub mod bybit;
pub mod coinbase;
pub mod kraken;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::models::Quote;

pub use binance::BinanceFeed;
pub use bybit::BybitFeed;
pub use coinbase::CoinbaseFeed;
pub use kraken::KrakenFeed;

/// Destination for decoded quotes. Must be cheap and non-blocking; the
/// engine's ingest path qualifies.
pub type QuoteSink = Arc<dyn Fn(Quote) + Send + Sync>;

/// First reconnect delay after a dropped connection.
pub(crate) const RECONNECT_MIN: Duration = Duration::from_millis(100);
/// Backoff ceiling.
pub(crate) const RECONNECT_MAX: Duration = Duration::from_secs(30);
/// How long `connect` waits for the first handshake before giving up.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Socket read poll interval; bounds shutdown latency.
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Common surface of the four venue adapters.
pub trait ExchangeFeed: Send + Sync {
    /// Venue tag stamped on every quote this feed produces.
    fn venue(&self) -> &'static str;
    /// Spawn the feed thread and wait for the first connection attempt.
    fn connect(&self) -> Result<()>;
    /// Stop the feed thread and join it.
    fn disconnect(&self);
    fn is_connected(&self) -> bool;
    fn message_count(&self) -> u64;
}

pub(crate) fn feed_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

pub(crate) fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(RECONNECT_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_saturates() {
        let mut d = RECONNECT_MIN;
        let mut previous = Duration::ZERO;
        for _ in 0..12 {
            assert!(d >= previous);
            previous = d;
            d = next_backoff(d);
        }
        assert_eq!(d, RECONNECT_MAX);
    }
}

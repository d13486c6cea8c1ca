//! Monitor configuration.
//!
//! Loaded from a TOML file when present, otherwise every field falls back
//! to its default, so the binary runs with no config at all. CLI flags
//! override the file.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::queue::QueueKind;

/// Default watchlist, in Binance notation. Venue adapters convert.
fn default_symbols() -> Vec<String> {
    [
        "BTCUSDT", "ETHUSDT", "ADAUSDT", "DOTUSDT", "SOLUSDT", "MATICUSDT", "AVAXUSDT",
        "LTCUSDT", "LINKUSDT", "XLMUSDT", "XRPUSDT", "UNIUSDT", "AAVEUSDT", "ATOMUSDT",
        "ALGOUSDT",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_min_profit_bps() -> f64 {
    5.0
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_report_interval_secs() -> u64 {
    10
}

fn default_dashboard_refresh_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default)]
    pub venues: VenueConfig,

    /// Minimum profit threshold in basis points.
    #[serde(default = "default_min_profit_bps")]
    pub min_profit_bps: f64,

    /// Detection tick cadence.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Queue variant for the feed-to-engine handoff.
    #[serde(default)]
    pub queue: QueueKind,

    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,

    #[serde(default = "default_dashboard_refresh_ms")]
    pub dashboard_refresh_ms: u64,

    /// Pin the detection thread to its CPU tag. Feed and dashboard threads
    /// always request theirs; failures are warnings either way.
    #[serde(default = "default_true")]
    pub pin_threads: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config deserializes from defaults")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    #[serde(default = "default_true")]
    pub binance: bool,
    #[serde(default = "default_true")]
    pub coinbase: bool,
    #[serde(default = "default_true")]
    pub kraken: bool,
    #[serde(default = "default_true")]
    pub bybit: bool,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            binance: true,
            coinbase: true,
            kraken: true,
            bybit: true,
        }
    }
}

impl MonitorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Load from `MONITOR_CONFIG_PATH` or `monitor.toml`, defaulting when
    /// the file is absent.
    pub fn from_env() -> Self {
        let path = std::env::var("MONITOR_CONFIG_PATH").unwrap_or_else(|_| "monitor.toml".into());
        Self::load(&path).unwrap_or_else(|e| {
            debug!(path = %path, "using default config: {e:#}");
            Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.symbols.len(), 15);
        assert_eq!(cfg.min_profit_bps, 5.0);
        assert_eq!(cfg.tick_interval_ms, 100);
        assert_eq!(cfg.queue, QueueKind::LockFree);
        assert!(cfg.venues.binance && cfg.venues.bybit);
        assert!(cfg.pin_threads);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: MonitorConfig = toml::from_str(
            r#"
            min_profit_bps = 12.5
            queue = "mutex"

            [venues]
            bybit = false
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.min_profit_bps, 12.5);
        assert_eq!(cfg.queue, QueueKind::Mutex);
        assert!(!cfg.venues.bybit);
        assert!(cfg.venues.kraken);
        assert_eq!(cfg.tick_interval_ms, 100);
    }

    #[test]
    fn unknown_queue_kind_is_rejected() {
        let result: std::result::Result<MonitorConfig, _> = toml::from_str(r#"queue = "spsc""#);
        assert!(result.is_err());
    }
}

//! Spreadwatch library.
//!
//! Cross-exchange BBO arbitrage monitor: lock-free quote ingestion from
//! exchange WebSocket feeds, a single-threaded detection engine over a
//! last-value market book, and cycle-accurate push-latency tracking.

pub mod affinity;
pub mod config;
pub mod dashboard;
pub mod engine;
pub mod feeds;
pub mod latency;
pub mod models;
pub mod normalize;
pub mod queue;
pub mod timing;

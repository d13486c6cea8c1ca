//! Bybit spot L1 orderbook feed.
//!
//! Subscribes to `orderbook.1.<SYMBOL>` topics, which carry only the best
//! level of each side. Bybit caps subscribe requests at ten topics, so the
//! subscription is sent in batches. Delta frames may omit an empty side;
//! those are skipped rather than treated as parse errors.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::affinity;
use crate::models::Quote;

use super::{feed_runtime, next_backoff, ExchangeFeed, QuoteSink, CONNECT_TIMEOUT, READ_TIMEOUT, RECONNECT_MIN};

const WS_URL: &str = "wss://stream.bybit.com/v5/public/spot";
pub const VENUE: &str = "Bybit";

/// Subscribe requests carry at most this many topics.
const SUBSCRIBE_BATCH: usize = 10;

/// Bybit uses Binance-style symbols; only the topic prefix differs.
pub fn to_topic(symbol: &str) -> String {
    format!("orderbook.1.{}", symbol.to_ascii_uppercase())
}

pub struct BybitFeed {
    symbols: Vec<String>,
    sink: QuoteSink,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    messages: Arc<AtomicU64>,
    parse_errors: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BybitFeed {
    pub fn new(symbols: Vec<String>, sink: QuoteSink) -> Self {
        Self {
            symbols,
            sink,
            running: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
            messages: Arc::new(AtomicU64::new(0)),
            parse_errors: Arc::new(AtomicU64::new(0)),
            handle: Mutex::new(None),
        }
    }

    fn subscribe_messages(symbols: &[String]) -> Vec<String> {
        let topics: Vec<String> = symbols.iter().map(|s| to_topic(s)).collect();
        topics
            .chunks(SUBSCRIBE_BATCH)
            .enumerate()
            .map(|(i, batch)| {
                json!({
                    "req_id": (i + 1).to_string(),
                    "op": "subscribe",
                    "args": batch,
                })
                .to_string()
            })
            .collect()
    }

    fn run_loop(
        symbols: Vec<String>,
        sink: QuoteSink,
        running: Arc<AtomicBool>,
        connected: Arc<AtomicBool>,
        messages: Arc<AtomicU64>,
        parse_errors: Arc<AtomicU64>,
        first_result: mpsc::Sender<Result<()>>,
    ) {
        affinity::pin_current_thread(affinity::TAG_BYBIT_FEED);

        let rt = match feed_runtime() {
            Ok(rt) => rt,
            Err(e) => {
                let _ = first_result.send(Err(e).context("building Bybit feed runtime"));
                return;
            }
        };

        let mut first = Some(first_result);
        let mut backoff = RECONNECT_MIN;

        while running.load(Ordering::Relaxed) {
            let result = rt.block_on(Self::run_connection(
                &symbols,
                &sink,
                &running,
                &connected,
                &messages,
                &parse_errors,
                &mut first,
            ));
            connected.store(false, Ordering::SeqCst);

            match result {
                Ok(()) => backoff = RECONNECT_MIN,
                Err(e) => {
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Err(e));
                        return;
                    }
                    warn!(error = %e, "Bybit connection error");
                }
            }

            if running.load(Ordering::Relaxed) {
                info!(delay_ms = backoff.as_millis() as u64, "Bybit reconnecting");
                thread::sleep(backoff);
                backoff = next_backoff(backoff);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_connection(
        symbols: &[String],
        sink: &QuoteSink,
        running: &AtomicBool,
        connected: &AtomicBool,
        messages: &AtomicU64,
        parse_errors: &AtomicU64,
        first: &mut Option<mpsc::Sender<Result<()>>>,
    ) -> Result<()> {
        info!(url = WS_URL, "connecting to Bybit");
        let (ws, _) = connect_async(WS_URL)
            .await
            .context("Bybit WebSocket handshake")?;
        let (mut write, mut read) = ws.split();

        for msg in Self::subscribe_messages(symbols) {
            write
                .send(Message::Text(msg))
                .await
                .context("Bybit subscribe")?;
        }

        connected.store(true, Ordering::SeqCst);
        if let Some(tx) = first.take() {
            let _ = tx.send(Ok(()));
        }
        info!("Bybit connected");

        while running.load(Ordering::Relaxed) {
            let frame = match tokio::time::timeout(READ_TIMEOUT, read.next()).await {
                Err(_) => continue,
                Ok(None) => {
                    info!("Bybit stream ended");
                    break;
                }
                Ok(Some(frame)) => frame.context("Bybit read")?,
            };

            match frame {
                Message::Text(text) => {
                    messages.fetch_add(1, Ordering::Relaxed);
                    match parse_orderbook_message(&text) {
                        Some(Some(quote)) => sink(quote),
                        Some(None) => {}
                        None => {
                            parse_errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Message::Ping(payload) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Message::Close(_) => {
                    info!("Bybit closed the connection");
                    break;
                }
                _ => {}
            }
        }

        Ok(())
    }
}

impl ExchangeFeed for BybitFeed {
    fn venue(&self) -> &'static str {
        VENUE
    }

    fn connect(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("bybit-feed".to_string())
            .spawn({
                let symbols = self.symbols.clone();
                let sink = Arc::clone(&self.sink);
                let running = Arc::clone(&self.running);
                let connected = Arc::clone(&self.connected);
                let messages = Arc::clone(&self.messages);
                let parse_errors = Arc::clone(&self.parse_errors);
                move || {
                    Self::run_loop(symbols, sink, running, connected, messages, parse_errors, tx)
                }
            })
            .context("spawning Bybit feed thread")?;
        *self.handle.lock() = Some(handle);

        match rx.recv_timeout(CONNECT_TIMEOUT) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                Err(anyhow!("timed out connecting to Bybit"))
            }
        }
    }

    fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn message_count(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }
}

/// Decode an L1 orderbook frame.
///
/// Outer None: malformed payload. Inner None: a valid frame carrying no
/// usable BBO (acks, pongs, one-sided deltas).
fn parse_orderbook_message(text: &str) -> Option<Option<Quote>> {
    let v: Value = serde_json::from_str(text).ok()?;

    if let Some(op) = v.get("op").and_then(Value::as_str) {
        match op {
            "subscribe" => {
                if v.get("success").and_then(Value::as_bool) == Some(true) {
                    debug!("Bybit subscription confirmed");
                }
                return Some(None);
            }
            "pong" => return Some(None),
            _ => return Some(None),
        }
    }

    let Some(topic) = v.get("topic").and_then(Value::as_str) else {
        return Some(None);
    };
    if !topic.starts_with("orderbook.1.") {
        return Some(None);
    }

    let data = v.get("data")?;
    let bids = data.get("b").and_then(Value::as_array);
    let asks = data.get("a").and_then(Value::as_array);
    let (Some(bids), Some(asks)) = (bids, asks) else {
        return Some(None);
    };
    // Deltas can carry one side only; a BBO needs both.
    if bids.is_empty() || asks.is_empty() {
        return Some(None);
    }

    let quote = Quote {
        venue: VENUE,
        raw_symbol: data.get("s")?.as_str()?.to_string(),
        bid_price: bids[0].get(0)?.as_str()?.parse().ok()?,
        bid_size: bids[0].get(1)?.as_str()?.parse().ok()?,
        ask_price: asks[0].get(0)?.as_str()?.parse().ok()?,
        ask_size: asks[0].get(1)?.as_str()?.parse().ok()?,
        wall_ms: Utc::now().timestamp_millis(),
        enqueue_tsc: 0,
    };
    Some(Some(quote))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_format() {
        assert_eq!(to_topic("btcusdt"), "orderbook.1.BTCUSDT");
    }

    #[test]
    fn parses_l1_snapshot() {
        let msg = r#"{
            "topic":"orderbook.1.BTCUSDT","type":"snapshot",
            "data":{"s":"BTCUSDT","b":[["50000.10","0.5"]],"a":[["50001.20","1.25"]],"u":1,"seq":2}
        }"#;
        let q = parse_orderbook_message(msg).expect("valid").expect("quote");
        assert_eq!(q.venue, "Bybit");
        assert_eq!(q.raw_symbol, "BTCUSDT");
        assert_eq!(q.bid_price, 50000.10);
        assert_eq!(q.bid_size, 0.5);
        assert_eq!(q.ask_price, 50001.20);
        assert_eq!(q.ask_size, 1.25);
    }

    #[test]
    fn one_sided_delta_is_skipped_not_an_error() {
        let msg = r#"{
            "topic":"orderbook.1.BTCUSDT","type":"delta",
            "data":{"s":"BTCUSDT","b":[["50000.10","0.5"]],"a":[],"u":3,"seq":4}
        }"#;
        assert_eq!(parse_orderbook_message(msg).expect("valid"), None);
    }

    #[test]
    fn subscription_ack_and_pong_are_skipped() {
        let ack = r#"{"success":true,"op":"subscribe","req_id":"1"}"#;
        assert_eq!(parse_orderbook_message(ack).expect("valid"), None);
        let pong = r#"{"op":"pong"}"#;
        assert_eq!(parse_orderbook_message(pong).expect("valid"), None);
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(parse_orderbook_message("garbage").is_none());
        let missing_symbol = r#"{"topic":"orderbook.1.BTCUSDT","data":{"b":[["1","2"]],"a":[["3","4"]]}}"#;
        assert!(parse_orderbook_message(missing_symbol).is_none());
    }

    #[test]
    fn subscriptions_are_batched_at_ten_topics() {
        let symbols: Vec<String> = (0..15).map(|i| format!("SYM{i}USDT")).collect();
        let msgs = BybitFeed::subscribe_messages(&symbols);
        assert_eq!(msgs.len(), 2);
        let first: Value = serde_json::from_str(&msgs[0]).unwrap();
        let second: Value = serde_json::from_str(&msgs[1]).unwrap();
        assert_eq!(first["args"].as_array().unwrap().len(), 10);
        assert_eq!(second["args"].as_array().unwrap().len(), 5);
        assert_eq!(first["op"], "subscribe");
    }
}

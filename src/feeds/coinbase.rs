//! Coinbase Advanced Trade ticker feed.
//!
//! Subscribes to the `ticker` channel for the configured products. Coinbase
//! batches ticker updates inside an `events[].tickers[]` envelope and uses
//! `BTC-USD` style product ids; the conversion from Binance notation is the
//! generic stablecoin-suffix rewrite.

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

const WS_URL: &str = "wss://advanced-trade-ws.coinbase.com";
pub const VENUE: &str = "Coinbase";

/// `BTCUSDT` -> `BTC-USD`.
pub fn to_product_id(symbol: &str) -> String {
    let upper = symbol.to_ascii_uppercase();
    if upper.len() > 4 && upper.ends_with("USDT") {
        format!("{}-USD", &upper[..upper.len() - 4])
    } else {
        upper
    }
}

pub struct CoinbaseFeed {
    symbols: Vec<String>,
    sink: QuoteSink,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    messages: Arc<AtomicU64>,
    parse_errors: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CoinbaseFeed {
    /// `symbols` in Binance notation; converted to product ids on subscribe.
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

    fn subscribe_message(symbols: &[String]) -> String {
        let product_ids: Vec<String> = symbols.iter().map(|s| to_product_id(s)).collect();
        json!({
            "type": "subscribe",
            "product_ids": product_ids,
            "channel": "ticker",
        })
        .to_string()
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
        affinity::pin_current_thread(affinity::TAG_COINBASE_FEED);

        let rt = match feed_runtime() {
            Ok(rt) => rt,
            Err(e) => {
                let _ = first_result.send(Err(e).context("building Coinbase feed runtime"));
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
                    warn!(error = %e, "Coinbase connection error");
                }
            }

            if running.load(Ordering::Relaxed) {
                info!(delay_ms = backoff.as_millis() as u64, "Coinbase reconnecting");
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
        info!(url = WS_URL, "connecting to Coinbase");
        let (ws, _) = connect_async(WS_URL)
            .await
            .context("Coinbase WebSocket handshake")?;
        let (mut write, mut read) = ws.split();

        write
            .send(Message::Text(Self::subscribe_message(symbols)))
            .await
            .context("Coinbase subscribe")?;

        connected.store(true, Ordering::SeqCst);
        if let Some(tx) = first.take() {
            let _ = tx.send(Ok(()));
        }
        info!("Coinbase connected");

        while running.load(Ordering::Relaxed) {
            let frame = match tokio::time::timeout(READ_TIMEOUT, read.next()).await {
                Err(_) => continue,
                Ok(None) => {
                    info!("Coinbase stream ended");
                    break;
                }
                Ok(Some(frame)) => frame.context("Coinbase read")?,
            };

            match frame {
                Message::Text(text) => {
                    messages.fetch_add(1, Ordering::Relaxed);
                    match parse_ticker_message(&text) {
                        Some(quotes) => {
                            for quote in quotes {
                                sink(quote);
                            }
                        }
                        None => {
                            parse_errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Message::Ping(payload) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Message::Close(_) => {
                    info!("Coinbase closed the connection");
                    break;
                }
                _ => {}
            }
        }

        Ok(())
    }
}

impl ExchangeFeed for CoinbaseFeed {
    fn venue(&self) -> &'static str {
        VENUE
    }

    fn connect(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("coinbase-feed".to_string())
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
            .context("spawning Coinbase feed thread")?;
        *self.handle.lock() = Some(handle);

        match rx.recv_timeout(CONNECT_TIMEOUT) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                Err(anyhow!("timed out connecting to Coinbase"))
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

/// Decode a ticker envelope. Returns None only for malformed ticker data;
/// non-ticker frames (subscription acks, heartbeats) yield an empty vec.
fn parse_ticker_message(text: &str) -> Option<Vec<Quote>> {
    let v: Value = serde_json::from_str(text).ok()?;

    let Some(events) = v.get("events").and_then(Value::as_array) else {
        if v.get("type").and_then(Value::as_str) == Some("subscriptions") {
            debug!("Coinbase subscription confirmed");
        }
        return Some(Vec::new());
    };

    let mut quotes = Vec::new();
    for event in events {
        let Some(tickers) = event.get("tickers").and_then(Value::as_array) else {
            continue;
        };
        for ticker in tickers {
            quotes.push(Quote {
                venue: VENUE,
                raw_symbol: ticker.get("product_id")?.as_str()?.to_string(),
                bid_price: ticker.get("best_bid")?.as_str()?.parse().ok()?,
                ask_price: ticker.get("best_ask")?.as_str()?.parse().ok()?,
                bid_size: ticker.get("best_bid_quantity")?.as_str()?.parse().ok()?,
                ask_size: ticker.get("best_ask_quantity")?.as_str()?.parse().ok()?,
                wall_ms: Utc::now().timestamp_millis(),
                enqueue_tsc: 0,
            });
        }
    }
    Some(quotes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_symbols_to_product_ids() {
        assert_eq!(to_product_id("BTCUSDT"), "BTC-USD");
        assert_eq!(to_product_id("MATICUSDT"), "MATIC-USD");
        assert_eq!(to_product_id("BTC-USD"), "BTC-USD");
    }

    #[test]
    fn parses_ticker_event() {
        let msg = r#"{
            "channel":"ticker",
            "events":[{"type":"update","tickers":[{
                "product_id":"BTC-USD",
                "best_bid":"50000.10","best_bid_quantity":"0.5",
                "best_ask":"50001.20","best_ask_quantity":"1.25"
            }]}]
        }"#;
        let quotes = parse_ticker_message(msg).expect("parse");
        assert_eq!(quotes.len(), 1);
        let q = &quotes[0];
        assert_eq!(q.venue, "Coinbase");
        assert_eq!(q.raw_symbol, "BTC-USD");
        assert_eq!(q.bid_price, 50000.10);
        assert_eq!(q.ask_size, 1.25);
    }

    #[test]
    fn subscription_ack_is_not_an_error() {
        let msg = r#"{"type":"subscriptions","channels":[]}"#;
        assert_eq!(parse_ticker_message(msg).expect("parse").len(), 0);
    }

    #[test]
    fn malformed_ticker_is_an_error() {
        let msg = r#"{"events":[{"tickers":[{"product_id":"BTC-USD","best_bid":"oops"}]}]}"#;
        assert!(parse_ticker_message(msg).is_none());
    }

    #[test]
    fn subscribe_message_lists_products() {
        let msg = CoinbaseFeed::subscribe_message(&["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        let v: Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(v["type"], "subscribe");
        assert_eq!(v["channel"], "ticker");
        assert_eq!(v["product_ids"][0], "BTC-USD");
        assert_eq!(v["product_ids"][1], "ETH-USD");
    }
}

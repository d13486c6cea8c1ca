//! Kraken v2 ticker feed.
//!
//! Subscribes to the v2 `ticker` channel with the `bbo` event trigger so an
//! update arrives on every best-bid/offer change rather than on trades.
//! Kraken spells pairs `BTC/USD` and sends prices as JSON numbers, not
//! strings.

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

const WS_URL: &str = "wss://ws.kraken.com/v2";
pub const VENUE: &str = "Kraken";

/// `BTCUSDT` -> `BTC/USD`.
pub fn to_kraken_pair(symbol: &str) -> String {
    let upper = symbol.to_ascii_uppercase();
    if upper.len() > 4 && upper.ends_with("USDT") {
        format!("{}/USD", &upper[..upper.len() - 4])
    } else {
        upper
    }
}

pub struct KrakenFeed {
    symbols: Vec<String>,
    sink: QuoteSink,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    messages: Arc<AtomicU64>,
    parse_errors: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl KrakenFeed {
    /// `symbols` in Binance notation; converted to Kraken pairs on subscribe.
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
        let pairs: Vec<String> = symbols.iter().map(|s| to_kraken_pair(s)).collect();
        json!({
            "method": "subscribe",
            "params": {
                "channel": "ticker",
                "symbol": pairs,
                "event_trigger": "bbo",
            }
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
        affinity::pin_current_thread(affinity::TAG_KRAKEN_FEED);

        let rt = match feed_runtime() {
            Ok(rt) => rt,
            Err(e) => {
                let _ = first_result.send(Err(e).context("building Kraken feed runtime"));
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
                    warn!(error = %e, "Kraken connection error");
                }
            }

            if running.load(Ordering::Relaxed) {
                info!(delay_ms = backoff.as_millis() as u64, "Kraken reconnecting");
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
        info!(url = WS_URL, "connecting to Kraken");
        let (ws, _) = connect_async(WS_URL)
            .await
            .context("Kraken WebSocket handshake")?;
        let (mut write, mut read) = ws.split();

        write
            .send(Message::Text(Self::subscribe_message(symbols)))
            .await
            .context("Kraken subscribe")?;

        connected.store(true, Ordering::SeqCst);
        if let Some(tx) = first.take() {
            let _ = tx.send(Ok(()));
        }
        info!("Kraken connected");

        while running.load(Ordering::Relaxed) {
            let frame = match tokio::time::timeout(READ_TIMEOUT, read.next()).await {
                Err(_) => continue,
                Ok(None) => {
                    info!("Kraken stream ended");
                    break;
                }
                Ok(Some(frame)) => frame.context("Kraken read")?,
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
                    info!("Kraken closed the connection");
                    break;
                }
                _ => {}
            }
        }

        Ok(())
    }
}

impl ExchangeFeed for KrakenFeed {
    fn venue(&self) -> &'static str {
        VENUE
    }

    fn connect(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("kraken-feed".to_string())
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
            .context("spawning Kraken feed thread")?;
        *self.handle.lock() = Some(handle);

        match rx.recv_timeout(CONNECT_TIMEOUT) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                Err(anyhow!("timed out connecting to Kraken"))
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

/// Decode a v2 ticker frame. Subscription acks and heartbeats yield an
/// empty vec; malformed ticker data yields None.
fn parse_ticker_message(text: &str) -> Option<Vec<Quote>> {
    let v: Value = serde_json::from_str(text).ok()?;

    if v.get("method").and_then(Value::as_str) == Some("subscribe") {
        if v.get("success").and_then(Value::as_bool) == Some(true) {
            debug!("Kraken subscription confirmed");
        }
        return Some(Vec::new());
    }
    if v.get("channel").and_then(Value::as_str) != Some("ticker") {
        return Some(Vec::new());
    }
    let Some(data) = v.get("data").and_then(Value::as_array) else {
        return Some(Vec::new());
    };

    let mut quotes = Vec::new();
    for entry in data {
        quotes.push(Quote {
            venue: VENUE,
            raw_symbol: entry.get("symbol")?.as_str()?.to_string(),
            bid_price: entry.get("bid")?.as_f64()?,
            ask_price: entry.get("ask")?.as_f64()?,
            bid_size: entry.get("bid_qty")?.as_f64()?,
            ask_size: entry.get("ask_qty")?.as_f64()?,
            wall_ms: Utc::now().timestamp_millis(),
            enqueue_tsc: 0,
        });
    }
    Some(quotes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_symbols_to_pairs() {
        assert_eq!(to_kraken_pair("BTCUSDT"), "BTC/USD");
        assert_eq!(to_kraken_pair("AAVEUSDT"), "AAVE/USD");
        assert_eq!(to_kraken_pair("BTC/USD"), "BTC/USD");
    }

    #[test]
    fn parses_ticker_data() {
        let msg = r#"{
            "channel":"ticker","type":"update",
            "data":[{"symbol":"BTC/USD","bid":50000.1,"bid_qty":0.5,
                     "ask":50001.2,"ask_qty":1.25,"last":50000.5}]
        }"#;
        let quotes = parse_ticker_message(msg).expect("parse");
        assert_eq!(quotes.len(), 1);
        let q = &quotes[0];
        assert_eq!(q.venue, "Kraken");
        assert_eq!(q.raw_symbol, "BTC/USD");
        assert_eq!(q.bid_price, 50000.1);
        assert_eq!(q.bid_size, 0.5);
        assert_eq!(q.ask_price, 50001.2);
    }

    #[test]
    fn subscription_ack_yields_no_quotes() {
        let msg = r#"{"method":"subscribe","success":true,"result":{"channel":"ticker"}}"#;
        assert_eq!(parse_ticker_message(msg).expect("parse").len(), 0);
    }

    #[test]
    fn heartbeat_yields_no_quotes() {
        let msg = r#"{"channel":"heartbeat"}"#;
        assert_eq!(parse_ticker_message(msg).expect("parse").len(), 0);
    }

    #[test]
    fn malformed_data_is_an_error() {
        let msg = r#"{"channel":"ticker","data":[{"symbol":"BTC/USD","bid":"not-a-number"}]}"#;
        assert!(parse_ticker_message(msg).is_none());
    }

    #[test]
    fn subscribe_message_uses_bbo_trigger() {
        let msg = KrakenFeed::subscribe_message(&["BTCUSDT".to_string()]);
        let v: Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(v["method"], "subscribe");
        assert_eq!(v["params"]["channel"], "ticker");
        assert_eq!(v["params"]["event_trigger"], "bbo");
        assert_eq!(v["params"]["symbol"][0], "BTC/USD");
    }
}

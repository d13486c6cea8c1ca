//! Binance bookTicker feed.
//!
//! Subscribes to the combined bookTicker streams for all configured symbols
//! in a single connection. Binance pushes an update on every top-of-book
//! change; prices and sizes arrive as decimal strings.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::affinity;
use crate::models::Quote;

use super::{feed_runtime, next_backoff, ExchangeFeed, QuoteSink, CONNECT_TIMEOUT, READ_TIMEOUT, RECONNECT_MIN};

const STREAM_HOST: &str = "wss://stream.binance.us:9443";
pub const VENUE: &str = "Binance";

pub struct BinanceFeed {
    symbols: Vec<String>,
    sink: QuoteSink,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    messages: Arc<AtomicU64>,
    parse_errors: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BinanceFeed {
    /// `symbols` in Binance notation (`BTCUSDT`).
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

    fn stream_url(symbols: &[String]) -> String {
        let streams: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@bookTicker", s.to_ascii_lowercase()))
            .collect();
        format!("{STREAM_HOST}/stream?streams={}", streams.join("/"))
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
        affinity::pin_current_thread(affinity::TAG_BINANCE_FEED);

        let rt = match feed_runtime() {
            Ok(rt) => rt,
            Err(e) => {
                let _ = first_result.send(Err(e).context("building Binance feed runtime"));
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
                        // Never connected; the caller decides what that means.
                        let _ = tx.send(Err(e));
                        return;
                    }
                    warn!(error = %e, "Binance connection error");
                }
            }

            if running.load(Ordering::Relaxed) {
                info!(delay_ms = backoff.as_millis() as u64, "Binance reconnecting");
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
        let url = Self::stream_url(symbols);
        info!(url = %url, "connecting to Binance");

        let (ws, _) = connect_async(&url)
            .await
            .context("Binance WebSocket handshake")?;
        let (mut write, mut read) = ws.split();

        connected.store(true, Ordering::SeqCst);
        if let Some(tx) = first.take() {
            let _ = tx.send(Ok(()));
        }
        info!("Binance connected");

        while running.load(Ordering::Relaxed) {
            let frame = match tokio::time::timeout(READ_TIMEOUT, read.next()).await {
                Err(_) => continue, // idle; poll the running flag
                Ok(None) => {
                    info!("Binance stream ended");
                    break;
                }
                Ok(Some(frame)) => frame.context("Binance read")?,
            };

            match frame {
                Message::Text(text) => {
                    messages.fetch_add(1, Ordering::Relaxed);
                    match parse_book_ticker(&text) {
                        Some(quote) => sink(quote),
                        None => {
                            parse_errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Message::Ping(payload) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Message::Close(_) => {
                    info!("Binance closed the connection");
                    break;
                }
                _ => {}
            }
        }

        Ok(())
    }
}

impl ExchangeFeed for BinanceFeed {
    fn venue(&self) -> &'static str {
        VENUE
    }

    fn connect(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("binance-feed".to_string())
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
            .context("spawning Binance feed thread")?;
        *self.handle.lock() = Some(handle);

        match rx.recv_timeout(CONNECT_TIMEOUT) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                Err(anyhow!("timed out connecting to Binance"))
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

/// Decode one combined-stream bookTicker message into a quote.
///
/// Format:
/// `{"stream":"btcusdt@bookTicker","data":{"s":"BTCUSDT","b":"50000.00",
///  "B":"1.5","a":"50001.00","A":"2.0",...}}`
fn parse_book_ticker(text: &str) -> Option<Quote> {
    let v: Value = serde_json::from_str(text).ok()?;
    let stream = v.get("stream")?.as_str()?;
    if !stream.contains("@bookTicker") {
        return None;
    }
    let data = v.get("data")?;

    Some(Quote {
        venue: VENUE,
        raw_symbol: data.get("s")?.as_str()?.to_string(),
        bid_price: data.get("b")?.as_str()?.parse().ok()?,
        ask_price: data.get("a")?.as_str()?.parse().ok()?,
        bid_size: data.get("B")?.as_str()?.parse().ok()?,
        ask_size: data.get("A")?.as_str()?.parse().ok()?,
        wall_ms: Utc::now().timestamp_millis(),
        enqueue_tsc: 0,
    })
}

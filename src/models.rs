//! Core market data types shared across the pipeline.
//!
//! A `Quote` is the single value that flows from the exchange feed threads
//! through the queue to the detection thread. Quotes are moved, never
//! shared: each producer builds one by value and hands it off.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use serde::Serialize;

/// Interned exchange tag. Comparison is by string content, case-exact.
pub type Venue = &'static str;

/// Intern a venue name constructed at runtime (config, tests). The feed
/// adapters use `&'static str` literals and never go through here.
pub fn intern_venue(name: &str) -> Venue {
    static INTERNED: OnceLock<Mutex<Vec<&'static str>>> = OnceLock::new();
    let pool = INTERNED.get_or_init(|| Mutex::new(Vec::new()));
    let mut pool = pool.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(&existing) = pool.iter().find(|&&existing| existing == name) {
        return existing;
    }
    let leaked: &'static str = Box::leak(name.to_owned().into_boxed_str());
    pool.push(leaked);
    leaked
}

/// Best-bid/best-offer update from one venue.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub venue: Venue,
    /// The venue's native symbol notation, e.g. `BTCUSDT` or `BTC-USD`.
    pub raw_symbol: String,
    pub bid_price: f64,
    pub ask_price: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    /// Producer wall clock at quote creation, epoch milliseconds.
    pub wall_ms: i64,
    /// Cycle counter at enqueue, written by the queue facade. 0 if unused.
    pub enqueue_tsc: u64,
}

impl Quote {
    /// Age relative to the given wall clock. Negative when the producer
    /// clock runs ahead of ours; callers treat that as fresh.
    #[inline]
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.wall_ms
    }

    #[inline]
    pub fn freshness(&self, now_ms: i64) -> Freshness {
        Freshness::from_age_ms(self.age_ms(now_ms))
    }

    #[inline]
    pub fn mid_price(&self) -> f64 {
        (self.bid_price + self.ask_price) / 2.0
    }

    #[inline]
    pub fn spread_bps(&self) -> f64 {
        if self.bid_price > 0.0 {
            ((self.ask_price - self.bid_price) / self.bid_price) * 10_000.0
        } else {
            0.0
        }
    }

    /// True when every numeric field is finite. Quotes failing this are kept
    /// in the book for diagnostics but excluded from pairing.
    #[inline]
    pub fn has_finite_fields(&self) -> bool {
        self.bid_price.is_finite()
            && self.ask_price.is_finite()
            && self.bid_size.is_finite()
            && self.ask_size.is_finite()
    }

    #[inline]
    pub fn book_key(&self) -> BookKey {
        (self.venue, self.raw_symbol.clone())
    }
}

/// Freshness bands derived from the producer wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Freshness {
    /// Under 1 second old.
    Live,
    /// 1 to 5 seconds old.
    Slow,
    /// 5 seconds or older. Kept in the book, ignored by detection.
    Stale,
}

impl Freshness {
    #[inline]
    pub fn from_age_ms(age_ms: i64) -> Self {
        if age_ms < 1_000 {
            Freshness::Live
        } else if age_ms < 5_000 {
            Freshness::Slow
        } else {
            Freshness::Stale
        }
    }

    /// Live and Slow quotes participate in detection.
    #[inline]
    pub fn is_usable(self) -> bool {
        !matches!(self, Freshness::Stale)
    }

    pub fn label(self) -> &'static str {
        match self {
            Freshness::Live => "LIVE",
            Freshness::Slow => "SLOW",
            Freshness::Stale => "STALE",
        }
    }
}

/// Latest-quote table key: the venue plus its native symbol string.
pub type BookKey = (Venue, String);

/// Latest quote per `(venue, raw_symbol)`. Owned by the detection thread,
/// never locked, never shared mutably. Entries are overwritten in place and
/// live for the lifetime of the process.
pub type MarketBook = HashMap<BookKey, Quote>;

/// A detected cross-venue arbitrage opportunity.
#[derive(Debug, Clone, Serialize)]
pub struct Opportunity {
    /// Canonical base-asset tag both quotes normalized to.
    pub symbol: String,
    pub buy_venue: Venue,
    pub sell_venue: Venue,
    /// Ask at the buy venue.
    pub buy_price: f64,
    /// Bid at the sell venue.
    pub sell_price: f64,
    pub profit_bps: f64,
    /// Size executable on both legs at top of book.
    pub max_size: f64,
    /// Wall clock at emission, epoch milliseconds.
    pub wall_ms: i64,
}

impl Opportunity {
    #[inline]
    pub fn profit_percentage(&self) -> f64 {
        self.profit_bps / 100.0
    }
}

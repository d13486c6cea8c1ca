//! Symbol normalization across venue notations.
//!
//! Every monitored market is quoted in a USD-family stablecoin, so arbitrage
//! is meaningful only on the base asset. Each venue spells the same pair
//! differently (`BTCUSDT`, `BTC-USD`, `BTC/USD`); normalization reduces all
//! of them to the bare base-asset tag, which is the pairing key for
//! cross-venue comparison.

/// Reduce a venue-native symbol to its canonical base-asset tag.
///
/// Separator rules run before the quote-currency suffix strips so that a
/// pair notation can never leave a dangling separator behind; the result is
/// idempotent. Unknown notations pass through uppercased.
pub fn canonical_symbol(raw: &str) -> String {
    let upper = raw.to_ascii_uppercase();

    if let Some(idx) = upper.find('-') {
        return upper[..idx].to_string();
    }
    if let Some(idx) = upper.find('/') {
        return upper[..idx].to_string();
    }
    if upper.len() > 4 && upper.ends_with("USDT") {
        return upper[..upper.len() - 4].to_string();
    }
    if upper.len() > 3 && upper.ends_with("USD") {
        return upper[..upper.len() - 3].to_string();
    }

    upper
}

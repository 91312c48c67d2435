//! Kline (candlestick) wire frames and the normalized [`Candle`] record.

use rust_decimal::Decimal;
use serde::Deserialize;

use super::StreamKey;

/// Envelope of the combined-stream endpoint: `{"stream": ..., "data": ...}`.
#[derive(Debug, Clone, Deserialize)]
pub struct CombinedStreamFrame {
    pub stream: String,
    pub data: KlineEvent,
}

/// A `kline` event pushed on a `<symbol>@kline_<interval>` stream.
#[derive(Debug, Clone, Deserialize)]
pub struct KlineEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: KlineData,
}

/// The bar itself. Prices and volume arrive as decimal strings.
#[derive(Debug, Clone, Deserialize)]
pub struct KlineData {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "T")]
    pub close_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o")]
    pub open: Decimal,
    #[serde(rename = "c")]
    pub close: Decimal,
    #[serde(rename = "h")]
    pub high: Decimal,
    #[serde(rename = "l")]
    pub low: Decimal,
    #[serde(rename = "v")]
    pub volume: Decimal,
    /// Whether this bar is final.
    #[serde(rename = "x")]
    pub is_closed: bool,
}

/// A single OHLCV bar for one symbol/interval.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub symbol: String,
    pub interval: String,
    pub open: Decimal,
    pub close: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub volume: Decimal,
    /// Close time in milliseconds since the Unix epoch.
    pub close_time: i64,
    pub is_closed: bool,
}

impl Candle {
    /// Returns the stream this candle belongs to.
    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(self.symbol.as_str(), self.interval.as_str())
    }

    /// Percent change from open to close, rounded to `decimals` places.
    ///
    /// A zero open price yields zero instead of dividing.
    pub fn percent_change(&self, decimals: u32) -> Decimal {
        if self.open.is_zero() {
            return Decimal::ZERO;
        }
        (self.close - self.open)
            .checked_div(self.open)
            .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
            .map(|pct| pct.round_dp(decimals))
            .unwrap_or(Decimal::ZERO)
    }
}

impl From<KlineData> for Candle {
    fn from(k: KlineData) -> Self {
        Self {
            symbol: k.symbol.to_uppercase(),
            interval: k.interval,
            open: k.open,
            close: k.close,
            high: k.high,
            low: k.low,
            volume: k.volume,
            close_time: k.close_time,
            is_closed: k.is_closed,
        }
    }
}

//! Shared domain models.
//!
//! Contains the subscription records (presets, stream keys), the candle
//! and kline wire types, alert events, gas samples, and the health report
//! returned by every long-running component.

pub mod alert;
pub mod candle;
pub mod gas;

use std::collections::BTreeSet;
use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use alert::{AlertEvent, AlertKind, CandleAlert, Direction, GasCrossingAlert, Priority};
pub use candle::Candle;
pub use gas::GasPriceSample;

/// Identifier of an end user (the delivery channel's chat id).
pub type UserId = i64;

/// Identifier of a [`Preset`], assigned by storage.
pub type PresetId = i64;

/// Kline intervals the market-data source is subscribed to.
pub const SUPPORTED_INTERVALS: [&str; 6] = ["1m", "5m", "15m", "30m", "1h", "4h"];

/// Returns `true` if `interval` is one of [`SUPPORTED_INTERVALS`].
pub fn is_supported_interval(interval: &str) -> bool {
    SUPPORTED_INTERVALS.contains(&interval)
}

/// Composite key identifying one kline stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    /// Upper-case exchange symbol, e.g. `BTCUSDT`.
    pub symbol: String,
    /// Kline interval, e.g. `1m`.
    pub interval: String,
}

impl StreamKey {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into().to_uppercase(),
            interval: interval.into(),
        }
    }

    /// Returns the wire-format stream name, e.g. `btcusdt@kline_1m`.
    pub fn stream_name(&self) -> String {
        format!("{}@kline_{}", self.symbol.to_lowercase(), self.interval)
    }

    /// Parses a wire-format stream name back into a key.
    pub fn from_stream_name(name: &str) -> Option<Self> {
        let (symbol, interval) = name.split_once("@kline_")?;
        if symbol.is_empty() || interval.is_empty() {
            return None;
        }
        Some(Self::new(symbol, interval))
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.symbol, self.interval)
    }
}

/// A user-owned rule: watch these symbols on these intervals and alert when
/// a closed candle moves by at least `threshold_percent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub id: PresetId,
    pub owner_user_id: UserId,
    pub name: String,
    pub symbols: BTreeSet<String>,
    pub intervals: BTreeSet<String>,
    pub threshold_percent: Decimal,
    pub active: bool,
}

impl Preset {
    /// Every (symbol, interval) pair this preset watches.
    pub fn stream_keys(&self) -> impl Iterator<Item = StreamKey> + '_ {
        self.symbols.iter().flat_map(move |symbol| {
            self.intervals
                .iter()
                .map(move |interval| StreamKey::new(symbol.as_str(), interval.as_str()))
        })
    }
}

/// Fields of a preset before storage assigns it an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPreset {
    pub owner_user_id: UserId,
    pub name: String,
    pub symbols: BTreeSet<String>,
    pub intervals: BTreeSet<String>,
    pub threshold_percent: Decimal,
}

impl NewPreset {
    /// Attaches a storage-assigned id, producing an active [`Preset`].
    pub fn with_id(self, id: PresetId) -> Preset {
        Preset {
            id,
            owner_user_id: self.owner_user_id,
            name: self.name,
            symbols: self.symbols.into_iter().map(|s| s.to_uppercase()).collect(),
            intervals: self.intervals,
            threshold_percent: self.threshold_percent,
            active: true,
        }
    }
}

/// A point-in-time health snapshot of one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub issues: Vec<String>,
}

impl HealthReport {
    /// Builds a report that is healthy iff `issues` is empty.
    pub fn from_issues(issues: Vec<String>) -> Self {
        Self {
            healthy: issues.is_empty(),
            issues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn stream_name_round_trips_through_key() {
        let key = StreamKey::new("btcusdt", "1m");
        assert_eq!(key.symbol, "BTCUSDT");
        assert_eq!(key.stream_name(), "btcusdt@kline_1m");
        assert_eq!(StreamKey::from_stream_name("btcusdt@kline_1m"), Some(key));
    }

    #[test]
    fn from_stream_name_rejects_other_channels() {
        assert!(StreamKey::from_stream_name("btcusdt@aggTrade").is_none());
        assert!(StreamKey::from_stream_name("@kline_1m").is_none());
    }

    #[test]
    fn preset_stream_keys_is_cartesian_product() {
        let preset = NewPreset {
            owner_user_id: 7,
            name: "majors".to_string(),
            symbols: ["btcusdt", "ETHUSDT"].into_iter().map(String::from).collect(),
            intervals: ["1m", "1h"].into_iter().map(String::from).collect(),
            threshold_percent: dec!(2),
        }
        .with_id(1);

        let keys: Vec<StreamKey> = preset.stream_keys().collect();
        assert_eq!(keys.len(), 4);
        assert!(keys.contains(&StreamKey::new("BTCUSDT", "1h")));
        assert!(keys.contains(&StreamKey::new("ETHUSDT", "1m")));
        assert!(preset.active);
    }

    #[test]
    fn supported_intervals() {
        assert!(is_supported_interval("15m"));
        assert!(!is_supported_interval("1d"));
    }
}

//! Alert events produced by the candle processor and the gas monitor.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;

use super::{PresetId, UserId};

/// Delivery priority; higher values are sent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Priority(pub u8);

impl Priority {
    pub const LOW: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(50);
    pub const HIGH: Priority = Priority(150);
    pub const URGENT: Priority = Priority(255);

    /// Candle alert priority: ten points per percent moved, capped at 100.
    pub fn for_percent_change(percent_change: Decimal) -> Self {
        let scaled = (percent_change.abs() * Decimal::TEN)
            .trunc()
            .to_u8()
            .unwrap_or(u8::MAX)
            .min(100);
        Priority(scaled)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// Which way a value moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// Direction of a signed change; zero counts as up.
    pub fn of(change: Decimal) -> Self {
        if change.is_sign_negative() && !change.is_zero() {
            Self::Down
        } else {
            Self::Up
        }
    }
}

/// Payload of a percent-change-per-candle alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandleAlert {
    pub preset_id: PresetId,
    pub symbol: String,
    pub interval: String,
    /// Rounded percent change that triggered the alert.
    pub percent_change: Decimal,
    pub close_price: Decimal,
    pub direction: Direction,
}

/// Payload of a gwei-threshold-crossing alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GasCrossingAlert {
    pub threshold_gwei: Decimal,
    pub previous_gwei: Decimal,
    pub current_gwei: Decimal,
    pub direction: Direction,
}

/// Typed alert payload, decided at creation time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertKind {
    Candle(CandleAlert),
    GasCrossing(GasCrossingAlert),
}

/// One alert for one user, waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub user_id: UserId,
    pub kind: AlertKind,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

impl AlertEvent {
    pub fn candle(user_id: UserId, alert: CandleAlert) -> Self {
        Self {
            user_id,
            priority: Priority::for_percent_change(alert.percent_change),
            kind: AlertKind::Candle(alert),
            created_at: Utc::now(),
        }
    }

    pub fn gas_crossing(user_id: UserId, alert: GasCrossingAlert) -> Self {
        Self {
            user_id,
            priority: Priority::HIGH,
            kind: AlertKind::GasCrossing(alert),
            created_at: Utc::now(),
        }
    }
}

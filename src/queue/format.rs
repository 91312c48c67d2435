//! Rendering of alert batches into Bot API HTML.
//!
//! Each payload variant has its own formatter; the variant is fixed when
//! the alert is created, never inferred from text.

use std::fmt::Write as _;

use rust_decimal::Decimal;

use crate::models::{AlertEvent, AlertKind, CandleAlert, Direction, GasCrossingAlert};

/// Renders a percent change with an explicit sign and two decimals.
fn signed_percent(change: Decimal) -> String {
    if change.is_sign_negative() && !change.is_zero() {
        format!("{change:.2}%")
    } else {
        format!("+{:.2}%", change.abs())
    }
}

fn arrow(direction: Direction) -> &'static str {
    match direction {
        Direction::Up => "📈",
        Direction::Down => "📉",
    }
}

/// Candle alerts grouped by symbol in first-seen order. Queue order is
/// kept within each group but not across groups.
fn format_candle_section(out: &mut String, alerts: &[&CandleAlert]) {
    let mut groups: Vec<(&str, Vec<&CandleAlert>)> = Vec::new();
    for &alert in alerts {
        match groups.iter_mut().find(|(symbol, _)| *symbol == alert.symbol) {
            Some((_, group)) => group.push(alert),
            None => groups.push((alert.symbol.as_str(), vec![alert])),
        }
    }

    out.push_str("🚨 <b>Crypto Alerts</b> 🚨\n");
    for (symbol, group) in groups {
        let _ = write!(out, "\n<b>{symbol}</b>:");
        for alert in group {
            let _ = write!(
                out,
                "\n{} {}: {} (${:.4})",
                arrow(alert.direction),
                alert.interval,
                signed_percent(alert.percent_change),
                alert.close_price
            );
        }
    }
}

fn format_gas_crossing(out: &mut String, alert: &GasCrossingAlert) {
    let verb = match alert.direction {
        Direction::Up => "rose above",
        Direction::Down => "dropped below",
    };
    let _ = write!(
        out,
        "⛽ <b>Gas Alert</b> ⛽\n\nGas price {verb} <b>{} Gwei</b>\nNow: {} Gwei (was {} Gwei)",
        alert.threshold_gwei.normalize(),
        alert.current_gwei.normalize(),
        alert.previous_gwei.normalize()
    );
}

/// Renders one user's batch: candle alerts first, then each gas crossing,
/// then a timestamp footer taken from the newest alert.
///
/// Candle alerts are grouped under their symbol, with symbols in the order
/// they first appear. Within a symbol, alerts keep their queue order, so a
/// later alert for an earlier symbol renders ahead of alerts for symbols
/// first seen in between.
pub fn format_alert_batch(alerts: &[AlertEvent]) -> String {
    let candles: Vec<&CandleAlert> = alerts
        .iter()
        .filter_map(|a| match &a.kind {
            AlertKind::Candle(c) => Some(c),
            AlertKind::GasCrossing(_) => None,
        })
        .collect();

    let mut out = String::new();
    if !candles.is_empty() {
        format_candle_section(&mut out, &candles);
    }
    for alert in alerts {
        if let AlertKind::GasCrossing(gas) = &alert.kind {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            format_gas_crossing(&mut out, gas);
        }
    }

    if let Some(newest) = alerts.iter().map(|a| a.created_at).max() {
        let _ = write!(out, "\n\n⏰ {}", newest.format("%H:%M:%S"));
    }
    out
}

//! Inbound frame parsing.

use crate::Result;
use crate::error::KlaxonError;
use crate::models::candle::{CombinedStreamFrame, KlineEvent};
use crate::models::{Candle, StreamKey};

/// What one text frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A final bar, ready for matching.
    Closed(Candle),
    /// An in-progress bar; dropped by the caller.
    Open(StreamKey),
    /// Anything else (subscription acks, other event types).
    Ignored,
}

/// Parses a text frame from either the combined-stream endpoint
/// (`{"stream": ..., "data": {...}}`) or a raw single-stream endpoint.
///
/// # Errors
///
/// Returns [`KlaxonError::MalformedMessage`] if the frame is not JSON or
/// a kline event is missing fields.
pub fn parse_frame(text: &str) -> Result<Frame> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| KlaxonError::MalformedMessage(e.to_string()))?;

    let is_combined = value.get("stream").is_some() && value.get("data").is_some();
    let event = if is_combined {
        &value["data"]
    } else {
        &value
    };

    if event.get("e").and_then(|e| e.as_str()) != Some("kline") {
        return Ok(Frame::Ignored);
    }

    let kline = if is_combined {
        let frame: CombinedStreamFrame = serde_json::from_value(value)
            .map_err(|e| KlaxonError::MalformedMessage(format!("bad kline frame: {e}")))?;
        frame.data.kline
    } else {
        let event: KlineEvent = serde_json::from_value(value)
            .map_err(|e| KlaxonError::MalformedMessage(format!("bad kline event: {e}")))?;
        event.kline
    };

    let candle = Candle::from(kline);
    if candle.is_closed {
        Ok(Frame::Closed(candle))
    } else {
        Ok(Frame::Open(candle.stream_key()))
    }
}

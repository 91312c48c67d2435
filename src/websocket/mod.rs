//! Market-data WebSocket client.
//!
//! This module is organized by concern:
//! - [`handler`] - Parsing inbound frames into candles
//! - [`connection`] - One supervised connection per group of streams
//! - [`manager`] - The [`StreamManager`] owning every connection group

mod connection;
mod handler;
mod manager;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::{SplitSink, SplitStream};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};
use tracing::info;
use tungstenite::Message;

use crate::Result;
use crate::error::KlaxonError;
use crate::models::{Candle, StreamKey};

pub use connection::{ConnectionSettings, GroupState};
pub use handler::{Frame, parse_frame};
pub use manager::{StreamManager, StreamStatsSnapshot, cold_start_streams, partition_streams};

/// Write half of a market-data connection.
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Read half of a market-data connection.
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Destination for closed candles.
///
/// Implementations must not block: a full downstream queue sheds the
/// candle and returns `false`.
pub trait CandleSink: Send + Sync {
    fn submit(&self, candle: Candle) -> bool;
}

impl CandleSink for mpsc::Sender<Candle> {
    fn submit(&self, candle: Candle) -> bool {
        self.try_send(candle).is_ok()
    }
}

/// Builds the combined-stream URL carrying every stream of one group.
pub fn stream_url(base_url: &str, streams: &[StreamKey]) -> String {
    let names: Vec<String> = streams.iter().map(StreamKey::stream_name).collect();
    format!("{}?streams={}", base_url.trim_end_matches('/'), names.join("/"))
}

/// Establishes a WebSocket connection to the given URL.
///
/// # Errors
///
/// Returns [`KlaxonError::InvalidStream`] if the server rejects the
/// request with a client error that retrying cannot fix, and
/// [`KlaxonError::WebSocket`] for every other connect or TLS failure.
pub async fn connect(
    url: &str,
    tls_config: Arc<rustls::ClientConfig>,
    timeout: Duration,
) -> Result<(WsWriter, WsReader)> {
    let connecting = connect_async_tls_with_config(
        url,
        None,
        false,
        Some(Connector::Rustls(tls_config)),
    );
    let (ws_stream, _) = match tokio::time::timeout(timeout, connecting).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(tungstenite::Error::Http(response)))
            if is_non_retryable_status(response.status().as_u16()) =>
        {
            return Err(KlaxonError::InvalidStream(format!(
                "server answered HTTP {}",
                response.status()
            )));
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(tungstenite::Error::Io(std::io::ErrorKind::TimedOut.into()).into()),
    };
    info!("WebSocket handshake completed");

    Ok(ws_stream.split())
}

/// Client errors mean the URL (i.e. the stream names) is wrong; throttling
/// and request timeouts are the exceptions worth retrying.
fn is_non_retryable_status(status: u16) -> bool {
    (400..500).contains(&status) && status != 408 && status != 429
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_joins_stream_names() {
        let streams = vec![StreamKey::new("BTCUSDT", "1m"), StreamKey::new("ETHUSDT", "4h")];
        assert_eq!(
            stream_url("wss://fstream.binance.com/stream/", &streams),
            "wss://fstream.binance.com/stream?streams=btcusdt@kline_1m/ethusdt@kline_4h"
        );
    }

    #[test]
    fn classifies_http_statuses() {
        assert!(is_non_retryable_status(404));
        assert!(is_non_retryable_status(400));
        assert!(!is_non_retryable_status(429));
        assert!(!is_non_retryable_status(503));
    }

    #[test]
    fn channel_sink_sheds_when_full() {
        let (tx, _rx) = mpsc::channel(1);
        let candle = Candle {
            symbol: "BTCUSDT".to_string(),
            interval: "1m".to_string(),
            open: 1.into(),
            close: 1.into(),
            high: 1.into(),
            low: 1.into(),
            volume: 1.into(),
            close_time: 0,
            is_closed: true,
        };
        assert!(tx.submit(candle.clone()));
        assert!(!tx.submit(candle));
    }
}

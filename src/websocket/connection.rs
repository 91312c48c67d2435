//! Supervised lifecycle of one connection group.
//!
//! A [`ConnectionGroup`] owns a fixed list of streams, encoded in its URL.
//! It connects, reads until the connection drops or it is cancelled, and
//! reconnects with exponential backoff. Consecutive failures beyond the
//! retry budget, or a rejected stream list, mark the group failed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tungstenite::Message as WsMessage;

use super::handler::{Frame, parse_frame};
use super::{CandleSink, WsReader, WsWriter, connect, stream_url};
use crate::error::KlaxonError;
use crate::models::StreamKey;
use crate::rate_limiter::RateLimiter;

/// Initial backoff duration between reconnection attempts.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Maximum backoff duration between reconnection attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Time allowed for a polite close frame on shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Where a connection group is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Connecting,
    Connected,
    Backoff,
    /// Gave up: invalid streams or retry budget exhausted.
    Failed,
    Stopped,
}

/// Timing and retry knobs shared by every group.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    /// Longest silence tolerated before the connection is considered stalled.
    pub receive_timeout: Duration,
    /// Consecutive failed attempts before the group is marked failed.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            receive_timeout: Duration::from_secs(30),
            max_retries: 10,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }
}

/// Counters shared by every group of one manager.
#[derive(Debug, Default)]
pub(super) struct StreamStats {
    pub active_connections: AtomicUsize,
    pub failed_groups: AtomicUsize,
    pub messages_received: AtomicU64,
    pub candles_forwarded: AtomicU64,
    pub open_candles_dropped: AtomicU64,
    pub candles_shed: AtomicU64,
    pub parse_errors: AtomicU64,
    pub reconnects: AtomicU64,
    pub last_message_at: Mutex<Option<Instant>>,
}

impl StreamStats {
    pub fn last_message_age(&self, now: Instant) -> Option<Duration> {
        self.last_message_at
            .lock()
            .map(|at| now.saturating_duration_since(at))
    }

    fn touch(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        *self.last_message_at.lock() = Some(Instant::now());
    }
}

/// Why the reader loop exited.
enum ConnectionOutcome {
    /// The group was cancelled.
    Stopped,
    /// The connection dropped, errored or stalled.
    Lost { frames: u64 },
}

/// One supervised connection carrying a fixed set of streams.
pub(super) struct ConnectionGroup {
    pub id: usize,
    pub streams: Vec<StreamKey>,
    pub base_url: String,
    pub tls_config: Arc<rustls::ClientConfig>,
    pub sink: Arc<dyn CandleSink>,
    pub open_limiter: Arc<RateLimiter>,
    pub stats: Arc<StreamStats>,
    pub state: Arc<Mutex<GroupState>>,
    pub cancel: CancellationToken,
    pub settings: ConnectionSettings,
}

impl ConnectionGroup {
    fn set_state(&self, state: GroupState) {
        *self.state.lock() = state;
    }

    fn fail(&self) {
        self.set_state(GroupState::Failed);
        self.stats.failed_groups.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs the connect/read/backoff loop until cancelled or failed.
    pub async fn run(self) {
        let url = stream_url(&self.base_url, &self.streams);
        let mut backoff = self.settings.initial_backoff;
        let mut failures: u32 = 0;

        loop {
            self.set_state(GroupState::Connecting);

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = self.open_limiter.acquire() => {}
            }

            info!(group = self.id, streams = self.streams.len(), "Connecting to market data");
            let connected = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = connect(&url, self.tls_config.clone(), self.settings.connect_timeout) => result,
            };

            match connected {
                Ok((write, read)) => {
                    self.set_state(GroupState::Connected);
                    self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
                    info!(group = self.id, "Market data connected");

                    let outcome = self.read_loop(write, read).await;
                    self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);

                    match outcome {
                        ConnectionOutcome::Stopped => break,
                        ConnectionOutcome::Lost { frames } => {
                            // Only a session that actually delivered data resets the budget.
                            if frames > 0 {
                                failures = 0;
                                backoff = self.settings.initial_backoff;
                            } else {
                                failures += 1;
                            }
                        }
                    }
                }
                Err(KlaxonError::InvalidStream(reason)) => {
                    error!(group = self.id, %reason, "Stream list rejected, giving up on group");
                    self.fail();
                    return;
                }
                Err(e) => {
                    warn!(group = self.id, "Connection failed: {e}");
                    failures += 1;
                }
            }

            if failures > self.settings.max_retries {
                error!(
                    group = self.id,
                    attempts = failures,
                    "Retry budget exhausted, marking group failed"
                );
                self.fail();
                return;
            }

            self.set_state(GroupState::Backoff);
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            info!(
                group = self.id,
                backoff_secs = backoff.as_secs_f64(),
                "Backing off before reconnect"
            );
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.settings.max_backoff);
        }

        self.set_state(GroupState::Stopped);
        info!(group = self.id, "Connection group stopped");
    }

    /// Reads frames until disconnection, stall, or cancellation.
    async fn read_loop(&self, mut write: WsWriter, mut read: WsReader) -> ConnectionOutcome {
        let mut frames: u64 = 0;

        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, write.close()).await;
                    return ConnectionOutcome::Stopped;
                }
                next = tokio::time::timeout(self.settings.receive_timeout, read.next()) => next,
            };

            match next {
                Ok(Some(Ok(WsMessage::Text(text)))) => {
                    frames += 1;
                    self.handle_text(&text);
                }
                Ok(Some(Ok(WsMessage::Close(frame)))) => {
                    info!(group = self.id, ?frame, "Server closed the connection");
                    return ConnectionOutcome::Lost { frames };
                }
                Ok(Some(Ok(_))) => {
                    // Ping/Pong/Binary still prove the peer is alive.
                    frames += 1;
                    self.stats.touch();
                }
                Ok(Some(Err(e))) => {
                    warn!(group = self.id, "WebSocket error: {e}");
                    return ConnectionOutcome::Lost { frames };
                }
                Ok(None) => {
                    warn!(group = self.id, "WebSocket stream ended");
                    return ConnectionOutcome::Lost { frames };
                }
                Err(_) => {
                    warn!(
                        group = self.id,
                        timeout_secs = self.settings.receive_timeout.as_secs(),
                        "No frame received, treating connection as stalled"
                    );
                    return ConnectionOutcome::Lost { frames };
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        self.stats.touch();
        match parse_frame(text) {
            Ok(Frame::Closed(candle)) => {
                if self.sink.submit(candle) {
                    self.stats.candles_forwarded.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.candles_shed.fetch_add(1, Ordering::Relaxed);
                    debug!(group = self.id, "Candle sink full, candle shed");
                }
            }
            Ok(Frame::Open(_)) => {
                self.stats.open_candles_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Frame::Ignored) => {}
            Err(e) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                warn!(group = self.id, "Skipping frame: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Candle;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn kline(symbol: &str, closed: bool) -> String {
        format!(
            r#"{{"stream":"{lower}@kline_1m","data":{{"e":"kline","E":1,"s":"{symbol}","k":{{"t":0,"T":59999,"s":"{symbol}","i":"1m","o":"100","c":"103","h":"104","l":"99","v":"1","x":{closed}}}}}}}"#,
            lower = symbol.to_lowercase(),
        )
    }

    fn group(
        base_url: String,
        sink: Arc<dyn CandleSink>,
        settings: ConnectionSettings,
    ) -> (ConnectionGroup, Arc<StreamStats>, Arc<Mutex<GroupState>>) {
        let stats = Arc::new(StreamStats::default());
        let state = Arc::new(Mutex::new(GroupState::Connecting));
        let tls = crate::tls::build_tls_config(None).unwrap();
        let group = ConnectionGroup {
            id: 0,
            streams: vec![StreamKey::new("BTCUSDT", "1m")],
            base_url,
            tls_config: Arc::new(tls),
            sink,
            open_limiter: Arc::new(RateLimiter::sliding(5, Duration::from_secs(1))),
            stats: stats.clone(),
            state: state.clone(),
            cancel: CancellationToken::new(),
            settings,
        };
        (group, stats, state)
    }

    #[tokio::test]
    async fn forwards_only_closed_candles() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(WsMessage::text(kline("BTCUSDT", false))).await.unwrap();
            ws.send(WsMessage::text("{garbage")).await.unwrap();
            ws.send(WsMessage::text(kline("BTCUSDT", true))).await.unwrap();
            // Keep the socket open until the client goes away.
            while ws.next().await.is_some() {}
        });

        let (tx, mut rx) = mpsc::channel::<Candle>(8);
        let (group, stats, state) = group(
            format!("ws://{addr}/stream"),
            Arc::new(tx),
            ConnectionSettings::default(),
        );
        let cancel = group.cancel.clone();
        let task = tokio::spawn(group.run());

        let candle = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(candle.symbol, "BTCUSDT");
        assert!(candle.is_closed);
        assert_eq!(*state.lock(), GroupState::Connected);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 1);
        assert_eq!(stats.open_candles_dropped.load(Ordering::Relaxed), 1);
        assert_eq!(stats.parse_errors.load(Ordering::Relaxed), 1);
        assert_eq!(stats.candles_forwarded.load(Ordering::Relaxed), 1);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(*state.lock(), GroupState::Stopped);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejected_stream_list_fails_without_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let (mut tcp, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut tcp, &mut buf).await;
            tcp.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let (tx, _rx) = mpsc::channel::<Candle>(1);
        let (group, stats, state) = group(
            format!("ws://{addr}/stream"),
            Arc::new(tx),
            ConnectionSettings::default(),
        );
        tokio::time::timeout(Duration::from_secs(5), group.run())
            .await
            .unwrap();
        assert_eq!(*state.lock(), GroupState::Failed);
        assert_eq!(stats.failed_groups.load(Ordering::Relaxed), 1);
        assert_eq!(stats.reconnects.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        // Bind then drop to get a port nobody listens on.
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();

        let settings = ConnectionSettings {
            max_retries: 2,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(10),
            ..ConnectionSettings::default()
        };
        let (tx, _rx) = mpsc::channel::<Candle>(1);
        let (group, stats, state) = group(format!("ws://{addr}/stream"), Arc::new(tx), settings);

        tokio::time::timeout(Duration::from_secs(5), group.run())
            .await
            .unwrap();
        assert_eq!(*state.lock(), GroupState::Failed);
        assert_eq!(stats.reconnects.load(Ordering::Relaxed), 2);
    }
}

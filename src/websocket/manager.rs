//! The [`StreamManager`]: partitions streams into connection groups and
//! supervises one [`ConnectionGroup`] task per group.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::CandleSink;
use super::connection::{ConnectionGroup, ConnectionSettings, GroupState, StreamStats};
use crate::Result;
use crate::config::BinanceConfig;
use crate::error::KlaxonError;
use crate::models::{HealthReport, SUPPORTED_INTERVALS, StreamKey};
use crate::rate_limiter::RateLimiter;

/// Connection opens allowed per second across all groups.
const CONNECTION_OPENS_PER_SECOND: usize = 5;

/// A connection silent for longer than this is unhealthy.
const STALE_MESSAGE_THRESHOLD: Duration = Duration::from_secs(60);

/// How long `stop()` waits for a group before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Splits streams into groups of at most `max_per_group`, in order.
pub fn partition_streams<'a>(
    streams: impl IntoIterator<Item = &'a StreamKey>,
    max_per_group: usize,
) -> Vec<Vec<StreamKey>> {
    let streams: Vec<StreamKey> = streams.into_iter().cloned().collect();
    streams
        .chunks(max_per_group.max(1))
        .map(<[StreamKey]>::to_vec)
        .collect()
}

/// Every supported interval for every symbol, for use before any preset
/// exists.
pub fn cold_start_streams(symbols: &[String]) -> BTreeSet<StreamKey> {
    symbols
        .iter()
        .flat_map(|symbol| {
            SUPPORTED_INTERVALS
                .iter()
                .map(move |interval| StreamKey::new(symbol.as_str(), *interval))
        })
        .collect()
}

/// Point-in-time counters for the whole connection pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStatsSnapshot {
    pub running: bool,
    pub groups: usize,
    pub total_streams: usize,
    pub active_connections: usize,
    pub failed_groups: usize,
    pub messages_received: u64,
    pub candles_forwarded: u64,
    pub open_candles_dropped: u64,
    pub candles_shed: u64,
    pub parse_errors: u64,
    pub reconnects: u64,
    pub last_message_age: Option<Duration>,
}

struct GroupHandle {
    streams: Vec<StreamKey>,
    state: Arc<Mutex<GroupState>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ManagerState {
    running: bool,
    root: CancellationToken,
    groups: Vec<GroupHandle>,
    next_group_id: usize,
}

/// Owns the set of market-data connections.
pub struct StreamManager {
    config: BinanceConfig,
    tls_config: Arc<rustls::ClientConfig>,
    sink: Arc<dyn CandleSink>,
    settings: ConnectionSettings,
    open_limiter: Arc<RateLimiter>,
    stats: Arc<StreamStats>,
    state: Mutex<ManagerState>,
}

impl StreamManager {
    pub fn new(
        config: BinanceConfig,
        tls_config: Arc<rustls::ClientConfig>,
        sink: Arc<dyn CandleSink>,
    ) -> Self {
        Self::with_settings(config, tls_config, sink, ConnectionSettings::default())
    }

    pub fn with_settings(
        config: BinanceConfig,
        tls_config: Arc<rustls::ClientConfig>,
        sink: Arc<dyn CandleSink>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            config,
            tls_config,
            sink,
            settings,
            open_limiter: Arc::new(RateLimiter::sliding(
                CONNECTION_OPENS_PER_SECOND,
                Duration::from_secs(1),
            )),
            stats: Arc::new(StreamStats::default()),
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Opens one connection group per partition of `required`.
    ///
    /// # Errors
    ///
    /// Returns [`KlaxonError::Lifecycle`] if the manager is already running.
    pub fn start(&self, required: &BTreeSet<StreamKey>) -> Result<()> {
        let mut state = self.state.lock();
        if state.running {
            return Err(KlaxonError::Lifecycle(
                "stream manager is already running".to_string(),
            ));
        }
        state.running = true;
        state.root = CancellationToken::new();

        if required.is_empty() {
            warn!("Stream manager started with no streams");
        }
        for streams in partition_streams(required, self.config.max_streams_per_connection) {
            let handle = self.spawn_group(&mut state, streams);
            state.groups.push(handle);
        }
        info!(
            streams = required.len(),
            groups = state.groups.len(),
            "Stream manager started"
        );
        Ok(())
    }

    /// Cancels every group and waits for them to finish, aborting any
    /// that outlive the grace period.
    pub async fn stop(&self) {
        let (root, groups) = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            (state.root.clone(), std::mem::take(&mut state.groups))
        };

        root.cancel();
        join_groups(groups).await;
        info!("Stream manager stopped");
    }

    /// Replaces the subscribed stream set.
    ///
    /// Only groups carrying a removed stream are restarted; their
    /// surviving streams are regrouped together with the added ones.
    ///
    /// # Errors
    ///
    /// Returns [`KlaxonError::Lifecycle`] if the manager is not running.
    pub async fn update_streams(&self, required: &BTreeSet<StreamKey>) -> Result<()> {
        let retired = {
            let mut state = self.state.lock();
            if !state.running {
                return Err(KlaxonError::Lifecycle(
                    "stream manager is not running".to_string(),
                ));
            }

            let current: BTreeSet<StreamKey> = state
                .groups
                .iter()
                .flat_map(|g| g.streams.iter().cloned())
                .collect();
            let removed: BTreeSet<&StreamKey> = current.difference(required).collect();
            let added: BTreeSet<&StreamKey> = required.difference(&current).collect();
            if removed.is_empty() && added.is_empty() {
                return Ok(());
            }

            let (retired, kept): (Vec<GroupHandle>, Vec<GroupHandle>) =
                std::mem::take(&mut state.groups)
                    .into_iter()
                    .partition(|g| g.streams.iter().any(|s| removed.contains(s)));
            state.groups = kept;

            let pending: BTreeSet<StreamKey> = retired
                .iter()
                .flat_map(|g| g.streams.iter())
                .filter(|s| required.contains(*s))
                .chain(added.iter().copied())
                .cloned()
                .collect();
            for streams in partition_streams(&pending, self.config.max_streams_per_connection) {
                let handle = self.spawn_group(&mut state, streams);
                state.groups.push(handle);
            }

            info!(
                added = added.len(),
                removed = removed.len(),
                restarted_groups = retired.len(),
                groups = state.groups.len(),
                "Updated stream set"
            );
            retired
        };

        for group in &retired {
            group.cancel.cancel();
        }
        join_groups(retired).await;
        Ok(())
    }

    fn spawn_group(&self, state: &mut ManagerState, streams: Vec<StreamKey>) -> GroupHandle {
        let id = state.next_group_id;
        state.next_group_id += 1;

        let cancel = state.root.child_token();
        let group_state = Arc::new(Mutex::new(GroupState::Connecting));
        let group = ConnectionGroup {
            id,
            streams: streams.clone(),
            base_url: self.config.websocket_url.clone(),
            tls_config: self.tls_config.clone(),
            sink: self.sink.clone(),
            open_limiter: self.open_limiter.clone(),
            stats: self.stats.clone(),
            state: group_state.clone(),
            cancel: cancel.clone(),
            settings: self.settings,
        };
        GroupHandle {
            streams,
            state: group_state,
            cancel,
            task: tokio::spawn(group.run()),
        }
    }

    /// The streams of each live group, in group order.
    pub fn group_streams(&self) -> Vec<Vec<StreamKey>> {
        self.state
            .lock()
            .groups
            .iter()
            .map(|g| g.streams.clone())
            .collect()
    }

    pub fn group_states(&self) -> Vec<GroupState> {
        self.state
            .lock()
            .groups
            .iter()
            .map(|g| *g.state.lock())
            .collect()
    }

    pub fn get_stats(&self) -> StreamStatsSnapshot {
        let (running, groups, total_streams) = {
            let state = self.state.lock();
            (
                state.running,
                state.groups.len(),
                state.groups.iter().map(|g| g.streams.len()).sum(),
            )
        };
        let stats = &self.stats;
        StreamStatsSnapshot {
            running,
            groups,
            total_streams,
            active_connections: stats.active_connections.load(Ordering::Relaxed),
            failed_groups: stats.failed_groups.load(Ordering::Relaxed),
            messages_received: stats.messages_received.load(Ordering::Relaxed),
            candles_forwarded: stats.candles_forwarded.load(Ordering::Relaxed),
            open_candles_dropped: stats.open_candles_dropped.load(Ordering::Relaxed),
            candles_shed: stats.candles_shed.load(Ordering::Relaxed),
            parse_errors: stats.parse_errors.load(Ordering::Relaxed),
            reconnects: stats.reconnects.load(Ordering::Relaxed),
            last_message_age: stats.last_message_age(Instant::now()),
        }
    }

    /// Healthy while at least one connection is up and data arrived recently.
    pub fn health_check(&self) -> HealthReport {
        let mut issues = Vec::new();
        if self.stats.active_connections.load(Ordering::Relaxed) == 0 {
            issues.push("no active market data connections".to_string());
        }
        match self.stats.last_message_age(Instant::now()) {
            None => issues.push("no market data received yet".to_string()),
            Some(age) if age >= STALE_MESSAGE_THRESHOLD => {
                issues.push(format!("last market data {}s ago", age.as_secs()));
            }
            Some(_) => {}
        }
        HealthReport::from_issues(issues)
    }
}

async fn join_groups(groups: Vec<GroupHandle>) {
    let deadline = Instant::now() + STOP_GRACE;
    for mut group in groups {
        if tokio::time::timeout_at(deadline, &mut group.task)
            .await
            .is_err()
        {
            warn!("Connection group did not stop in time, aborting");
            group.task.abort();
        }
    }
}

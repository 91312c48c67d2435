//! Candle processing worker pool.
//!
//! Candles are sharded across workers by stream, so every candle of one
//! `(symbol, interval)` is handled by the same worker in arrival order.
//! Each worker queue is bounded; when it is full the incoming candle is
//! shed rather than blocking the connection that produced it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::cache::SubscriptionCache;
use crate::dedup::{DedupKey, DedupScope, DedupTable};
use crate::error::KlaxonError;
use crate::models::{AlertEvent, Candle, CandleAlert, Direction, HealthReport};
use crate::queue::AlertSink;
use crate::websocket::CandleSink;

/// How long `stop()` lets workers drain before abandoning their queues.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Processor tuning.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub workers: usize,
    /// Total candle queue capacity, split evenly across workers.
    pub queue_capacity: usize,
    pub dedup_window: Duration,
    pub dedup_max_entries: usize,
    pub dedup_scope: DedupScope,
    /// Decimal places the percent change is rounded to before matching.
    pub percent_decimals: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 10_000,
            dedup_window: Duration::from_secs(60),
            dedup_max_entries: 10_000,
            dedup_scope: DedupScope::PerChange,
            percent_decimals: 2,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
    alerts_emitted: AtomicU64,
    duplicates_suppressed: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time processor counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub running: bool,
    pub workers: usize,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub candles_received: u64,
    pub candles_dropped: u64,
    pub candles_processed: u64,
    pub alerts_emitted: u64,
    pub duplicates_suppressed: u64,
    pub processing_errors: u64,
    pub dedup_entries: usize,
}

/// State shared by every worker.
struct Matcher {
    config: ProcessorConfig,
    cache: Arc<SubscriptionCache>,
    alerts: Arc<dyn AlertSink>,
    dedup: DedupTable,
    counters: Counters,
}

impl Matcher {
    /// Matches one closed candle against its subscribers and emits at most
    /// one alert per user. Returns the number of alerts accepted downstream.
    fn process(&self, candle: &Candle) -> Result<usize> {
        if !candle.is_closed {
            return Err(KlaxonError::MalformedMessage(format!(
                "candle {}@{} is not closed",
                candle.symbol, candle.interval
            )));
        }
        if candle.symbol.is_empty() || candle.interval.is_empty() {
            return Err(KlaxonError::MalformedMessage(
                "candle without symbol or interval".to_string(),
            ));
        }

        let percent_change = candle.percent_change(self.config.percent_decimals);
        let magnitude = percent_change.abs();
        let stream = candle.stream_key();

        let mut produced = 0;
        let mut accepted = 0;
        for (user, presets) in self.cache.get_subscribers(&candle.symbol, &candle.interval) {
            let Some(hit) = presets.iter().find(|p| p.threshold_percent <= magnitude) else {
                continue;
            };

            let key = DedupKey::new(self.config.dedup_scope, user, stream.clone(), percent_change);
            if self.dedup.is_duplicate(&key) {
                self.counters
                    .duplicates_suppressed
                    .fetch_add(1, Ordering::Relaxed);
                debug!(user, %stream, %percent_change, "Duplicate alert suppressed");
                continue;
            }

            let alert = AlertEvent::candle(
                user,
                CandleAlert {
                    preset_id: hit.preset_id,
                    symbol: candle.symbol.clone(),
                    interval: candle.interval.clone(),
                    percent_change,
                    close_price: candle.close,
                    direction: Direction::of(percent_change),
                },
            );
            produced += 1;
            // Only accepted alerts enter the dedup window.
            if self.alerts.enqueue_alerts(vec![alert]) == 1 {
                self.dedup.record(key);
                accepted += 1;
            }
        }

        if accepted < produced {
            warn!(
                %stream,
                dropped = produced - accepted,
                "Outbound queue rejected alerts"
            );
        }
        self.counters
            .alerts_emitted
            .fetch_add(accepted as u64, Ordering::Relaxed);
        Ok(accepted)
    }
}

/// The candle worker pool.
pub struct CandleProcessor {
    matcher: Arc<Matcher>,
    senders: RwLock<Vec<mpsc::Sender<Candle>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
}

impl CandleProcessor {
    pub fn new(
        config: ProcessorConfig,
        cache: Arc<SubscriptionCache>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let dedup = DedupTable::new(config.dedup_window, config.dedup_max_entries);
        Self {
            matcher: Arc::new(Matcher {
                config,
                cache,
                alerts,
                dedup,
                counters: Counters::default(),
            }),
            senders: RwLock::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.matcher.config
    }

    pub fn is_running(&self) -> bool {
        !self.senders.read().is_empty()
    }

    /// Spawns the worker pool.
    ///
    /// # Errors
    ///
    /// Returns [`KlaxonError::Lifecycle`] if the pool is already running.
    pub fn start(&self) -> Result<()> {
        let mut senders = self.senders.write();
        if !senders.is_empty() {
            return Err(KlaxonError::Lifecycle(
                "candle processor is already running".to_string(),
            ));
        }

        let config = &self.matcher.config;
        let workers = config.workers.max(1);
        let per_worker = (config.queue_capacity / workers).max(1);
        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();

        let mut handles = self.workers.lock();
        for id in 0..workers {
            let (tx, rx) = mpsc::channel(per_worker);
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(
                id,
                self.matcher.clone(),
                rx,
                cancel.clone(),
            )));
        }
        info!(workers, queue_per_worker = per_worker, "Candle processor started");
        Ok(())
    }

    /// Stops accepting candles, lets workers drain within a grace period,
    /// then abandons whatever is left.
    pub async fn stop(&self) {
        // Dropping the senders closes the queues; workers exit once drained.
        self.senders.write().clear();
        let handles = std::mem::take(&mut *self.workers.lock());
        if handles.is_empty() {
            return;
        }

        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        let cancel = self.cancel.lock().clone();
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                cancel.cancel();
                warn!("Candle worker did not drain in time, abandoning its queue");
                handle.abort();
            }
        }
        info!("Candle processor stopped");
    }

    /// Queues a closed candle for matching.
    ///
    /// Returns `false` if the candle was shed because the worker's queue is
    /// full or the pool is not running.
    pub fn add_candle(&self, candle: Candle) -> bool {
        let counters = &self.matcher.counters;
        counters.received.fetch_add(1, Ordering::Relaxed);

        let senders = self.senders.read();
        if senders.is_empty() {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Candle processor not running, candle dropped");
            return false;
        }

        let mut hasher = DefaultHasher::new();
        candle.symbol.hash(&mut hasher);
        candle.interval.hash(&mut hasher);
        let shard = (hasher.finish() % senders.len() as u64) as usize;

        match senders[shard].try_send(candle) {
            Ok(()) => true,
            Err(TrySendError::Full(candle)) => {
                let dropped = counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    symbol = %candle.symbol,
                    interval = %candle.interval,
                    worker = shard,
                    dropped,
                    "Candle queue full, dropping candle"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Processes one candle synchronously on the caller's task.
    ///
    /// # Errors
    ///
    /// Returns [`KlaxonError::MalformedMessage`] for open or unnamed candles.
    pub fn process_candle(&self, candle: &Candle) -> Result<usize> {
        self.matcher.process(candle)
    }

    /// Drops dedup history for a user, e.g. after deactivation.
    pub fn forget_user(&self, user: crate::models::UserId) {
        self.matcher.dedup.forget_user(user);
    }

    pub fn get_stats(&self) -> ProcessorStats {
        let senders = self.senders.read();
        let queue_depth = senders
            .iter()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .sum();
        let queue_capacity = senders.iter().map(mpsc::Sender::max_capacity).sum();
        let counters = &self.matcher.counters;
        ProcessorStats {
            running: !senders.is_empty(),
            workers: senders.len(),
            queue_depth,
            queue_capacity,
            candles_received: counters.received.load(Ordering::Relaxed),
            candles_dropped: counters.dropped.load(Ordering::Relaxed),
            candles_processed: counters.processed.load(Ordering::Relaxed),
            alerts_emitted: counters.alerts_emitted.load(Ordering::Relaxed),
            duplicates_suppressed: counters.duplicates_suppressed.load(Ordering::Relaxed),
            processing_errors: counters.errors.load(Ordering::Relaxed),
            dedup_entries: self.matcher.dedup.len(),
        }
    }

    pub fn health_check(&self) -> HealthReport {
        let stats = self.get_stats();
        let mut issues = Vec::new();
        if !stats.running {
            issues.push("candle processor is not running".to_string());
        }
        let dead = self
            .workers
            .lock()
            .iter()
            .filter(|h| h.is_finished())
            .count();
        if stats.running && dead > 0 {
            issues.push(format!("{dead} candle worker(s) exited"));
        }
        if stats.queue_capacity > 0 && stats.queue_depth * 10 >= stats.queue_capacity * 9 {
            issues.push(format!(
                "candle queue at {}/{}",
                stats.queue_depth, stats.queue_capacity
            ));
        }
        HealthReport::from_issues(issues)
    }
}

impl CandleSink for CandleProcessor {
    fn submit(&self, candle: Candle) -> bool {
        self.add_candle(candle)
    }
}

async fn run_worker(
    id: usize,
    matcher: Arc<Matcher>,
    mut rx: mpsc::Receiver<Candle>,
    cancel: CancellationToken,
) {
    debug!(worker = id, "Candle worker started");
    loop {
        let candle = tokio::select! {
            () = cancel.cancelled() => break,
            candle = rx.recv() => match candle {
                Some(candle) => candle,
                None => break,
            },
        };

        matcher.counters.processed.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = matcher.process(&candle) {
            matcher.counters.errors.fetch_add(1, Ordering::Relaxed);
            error!(
                worker = id,
                symbol = %candle.symbol,
                interval = %candle.interval,
                "Failed to process candle: {e}"
            );
        }
    }
    debug!(worker = id, "Candle worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertKind, NewPreset, UserId};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn candle(symbol: &str, open: Decimal, close: Decimal) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            interval: "1m".to_string(),
            open,
            close,
            high: open.max(close),
            low: open.min(close),
            volume: dec!(10),
            close_time: 1_700_000_059_999,
            is_closed: true,
        }
    }

    fn preset(id: i64, owner: UserId, symbol: &str, threshold: Decimal) -> crate::models::Preset {
        NewPreset {
            owner_user_id: owner,
            name: format!("preset-{id}"),
            symbols: [symbol.to_string()].into(),
            intervals: ["1m".to_string()].into(),
            threshold_percent: threshold,
        }
        .with_id(id)
    }

    fn processor(
        config: ProcessorConfig,
    ) -> (
        CandleProcessor,
        Arc<SubscriptionCache>,
        mpsc::UnboundedReceiver<AlertEvent>,
    ) {
        let cache = Arc::new(SubscriptionCache::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let processor = CandleProcessor::new(config, cache.clone(), Arc::new(tx));
        (processor, cache, rx)
    }

    #[test]
    fn first_matching_preset_wins() {
        let (processor, cache, mut rx) = processor(ProcessorConfig::default());
        cache.add_preset(preset(1, 42, "BTCUSDT", dec!(5)));
        cache.add_preset(preset(2, 42, "BTCUSDT", dec!(2)));
        cache.add_preset(preset(3, 42, "BTCUSDT", dec!(1)));

        let emitted = processor
            .process_candle(&candle("BTCUSDT", dec!(100), dec!(103)))
            .unwrap();
        assert_eq!(emitted, 1);

        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.user_id, 42);
        let AlertKind::Candle(payload) = alert.kind else {
            panic!("expected candle alert");
        };
        assert_eq!(payload.preset_id, 2);
        assert_eq!(payload.percent_change, dec!(3));
        assert_eq!(payload.direction, Direction::Up);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn below_threshold_emits_nothing() {
        let (processor, cache, mut rx) = processor(ProcessorConfig::default());
        cache.add_preset(preset(1, 7, "ETHUSDT", dec!(2)));

        let emitted = processor
            .process_candle(&candle("ETHUSDT", dec!(200), dec!(197)))
            .unwrap();
        assert_eq!(emitted, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn downward_moves_match_on_magnitude() {
        let (processor, cache, mut rx) = processor(ProcessorConfig::default());
        cache.add_preset(preset(1, 7, "ETHUSDT", dec!(1)));

        processor
            .process_candle(&candle("ETHUSDT", dec!(200), dec!(197)))
            .unwrap();
        let AlertKind::Candle(payload) = rx.try_recv().unwrap().kind else {
            panic!("expected candle alert");
        };
        assert_eq!(payload.percent_change, dec!(-1.5));
        assert_eq!(payload.direction, Direction::Down);
    }

    #[test]
    fn duplicate_candle_is_suppressed() {
        let (processor, cache, mut rx) = processor(ProcessorConfig::default());
        cache.add_preset(preset(1, 1, "BTCUSDT", dec!(2)));
        cache.add_preset(preset(2, 2, "BTCUSDT", dec!(2)));

        let c = candle("BTCUSDT", dec!(100), dec!(103));
        assert_eq!(processor.process_candle(&c).unwrap(), 2);
        assert_eq!(processor.process_candle(&c).unwrap(), 0);
        assert_eq!(processor.get_stats().duplicates_suppressed, 2);

        let users: Vec<UserId> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|a| a.user_id)
            .collect();
        assert_eq!(users, vec![1, 2]);
    }

    /// Rejects the first `rejects` enqueue calls, then forwards.
    struct SheddingSink {
        rejects: std::sync::atomic::AtomicUsize,
        tx: mpsc::UnboundedSender<AlertEvent>,
    }

    impl AlertSink for SheddingSink {
        fn enqueue_alerts(&self, alerts: Vec<AlertEvent>) -> usize {
            let shed = self
                .rejects
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok();
            if shed { 0 } else { self.tx.enqueue_alerts(alerts) }
        }
    }

    #[test]
    fn shed_alert_is_retried_on_next_candle() {
        let cache = Arc::new(SubscriptionCache::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = SheddingSink {
            rejects: std::sync::atomic::AtomicUsize::new(1),
            tx,
        };
        let processor = CandleProcessor::new(ProcessorConfig::default(), cache.clone(), Arc::new(sink));
        cache.add_preset(preset(1, 9, "BTCUSDT", dec!(2)));

        let c = candle("BTCUSDT", dec!(100), dec!(103));
        assert_eq!(processor.process_candle(&c).unwrap(), 0);
        assert!(rx.try_recv().is_err());

        assert_eq!(processor.process_candle(&c).unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap().user_id, 9);

        let stats = processor.get_stats();
        assert_eq!(stats.alerts_emitted, 1);
        assert_eq!(stats.duplicates_suppressed, 0);
        assert_eq!(stats.dedup_entries, 1);
    }

    #[test]
    fn inactive_presets_are_skipped() {
        let (processor, cache, _rx) = processor(ProcessorConfig::default());
        cache.add_preset(preset(1, 1, "BTCUSDT", dec!(2)));
        cache.set_active(1, false);

        let emitted = processor
            .process_candle(&candle("BTCUSDT", dec!(100), dec!(110)))
            .unwrap();
        assert_eq!(emitted, 0);
    }

    #[test]
    fn open_candle_is_an_error() {
        let (processor, _cache, _rx) = processor(ProcessorConfig::default());
        let mut c = candle("BTCUSDT", dec!(100), dec!(103));
        c.is_closed = false;
        assert!(matches!(
            processor.process_candle(&c),
            Err(KlaxonError::MalformedMessage(_))
        ));
    }

    #[test]
    fn zero_open_does_not_fire() {
        let (processor, cache, _rx) = processor(ProcessorConfig::default());
        cache.add_preset(preset(1, 1, "BTCUSDT", dec!(0.5)));
        assert_eq!(
            processor
                .process_candle(&candle("BTCUSDT", Decimal::ZERO, dec!(5)))
                .unwrap(),
            0
        );
    }

    #[test]
    fn candles_are_dropped_when_not_running() {
        let (processor, _cache, _rx) = processor(ProcessorConfig::default());
        assert!(!processor.add_candle(candle("BTCUSDT", dec!(1), dec!(2))));
        assert_eq!(processor.get_stats().candles_dropped, 1);
        assert!(!processor.health_check().healthy);
    }

    #[tokio::test]
    async fn workers_deliver_alerts() {
        let (processor, cache, mut rx) = processor(ProcessorConfig::default());
        cache.add_preset(preset(1, 9, "SOLUSDT", dec!(2)));
        processor.start().unwrap();
        assert!(matches!(processor.start(), Err(KlaxonError::Lifecycle(_))));

        assert!(processor.add_candle(candle("SOLUSDT", dec!(50), dec!(52))));
        let alert = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.user_id, 9);

        processor.stop().await;
        let stats = processor.get_stats();
        assert!(!stats.running);
        assert_eq!(stats.candles_processed, 1);
        assert_eq!(stats.alerts_emitted, 1);
    }

    #[tokio::test]
    async fn full_queue_sheds_incoming_candle() {
        let config = ProcessorConfig {
            workers: 1,
            queue_capacity: 1,
            ..ProcessorConfig::default()
        };
        let (processor, _cache, _rx) = processor(config);
        processor.start().unwrap();

        // The worker cannot run until this task yields.
        assert!(processor.add_candle(candle("BTCUSDT", dec!(1), dec!(2))));
        assert!(!processor.add_candle(candle("BTCUSDT", dec!(1), dec!(2))));
        assert_eq!(processor.get_stats().candles_dropped, 1);

        processor.stop().await;
    }

    #[tokio::test]
    async fn bad_candle_does_not_kill_worker() {
        let (processor, cache, mut rx) = processor(ProcessorConfig {
            workers: 1,
            ..ProcessorConfig::default()
        });
        cache.add_preset(preset(1, 3, "BTCUSDT", dec!(1)));
        processor.start().unwrap();

        let mut open = candle("BTCUSDT", dec!(100), dec!(103));
        open.is_closed = false;
        processor.add_candle(open);
        processor.add_candle(candle("BTCUSDT", dec!(100), dec!(103)));

        let alert = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.user_id, 3);
        assert_eq!(processor.get_stats().processing_errors, 1);
        assert!(processor.health_check().healthy);
        processor.stop().await;
    }
}

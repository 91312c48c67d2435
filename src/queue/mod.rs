//! Outbound delivery queue.
//!
//! Two lanes feed one rate-limited sender:
//! - plain messages (front-end responses), ordered by priority then FIFO
//! - per-user alert batches, oldest pending user first, capped at
//!   `max_alerts_per_message` alerts per message
//!
//! A scheduler task sends one item per tick. A user whose pending alerts
//! reach the per-message cap is flushed immediately instead of waiting for
//! the tick. Every send must pass the [`DeliveryLimiter`] first.

pub mod delivery;
pub mod format;

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::error::KlaxonError;
use crate::models::{AlertEvent, HealthReport, Priority, UserId};
use crate::rate_limiter::{DeliveryLimiter, DeliveryLimits, Throttle};

pub use delivery::{DeliveryClient, SendOutcome, TelegramClient, classify_response};
pub use format::format_alert_batch;

/// Ticks between sweeps of idle per-chat and per-user windows.
const PRUNE_EVERY_TICKS: u64 = 60;

/// Destination for alert events.
pub trait AlertSink: Send + Sync {
    /// Accepts as many alerts as possible and returns how many were taken.
    fn enqueue_alerts(&self, alerts: Vec<AlertEvent>) -> usize;
}

impl AlertSink for mpsc::UnboundedSender<AlertEvent> {
    fn enqueue_alerts(&self, alerts: Vec<AlertEvent>) -> usize {
        alerts
            .into_iter()
            .take_while(|alert| self.send(alert.clone()).is_ok())
            .count()
    }
}

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub tick_interval: Duration,
    pub max_alerts_per_message: usize,
    /// Total pending items (messages plus individual alerts).
    pub capacity: usize,
    pub limits: DeliveryLimits,
    /// Upper bound on the flush performed by `stop()`.
    pub stop_grace: Duration,
    /// Delivery attempts before a transiently failing message is dropped.
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            max_alerts_per_message: 10,
            capacity: 10_000,
            limits: DeliveryLimits::default(),
            stop_grace: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

/// A rendered message handed to the delivery client.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub user_id: UserId,
    pub text: String,
    pub priority: Priority,
    /// Number of alerts rendered into `text`; zero for plain messages.
    pub alert_count: usize,
    pub attempts: u32,
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub running: bool,
    pub pending_messages: usize,
    pub pending_alerts: usize,
    pub pending_users: usize,
    pub messages_sent: u64,
    pub alerts_delivered: u64,
    pub transient_failures: u64,
    pub permanent_failures: u64,
    pub dropped: u64,
    pub shed: u64,
    pub blocked_users: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection {
    Any,
    FullBatches,
}

#[derive(Debug, Clone, Copy)]
enum Candidate {
    Retry(usize),
    Plain((Reverse<Priority>, u64)),
    Batch(UserId),
}

#[derive(Debug)]
struct QueuedAlert {
    seq: u64,
    event: AlertEvent,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Messages that failed transiently; always tried first.
    retries: VecDeque<OutboundMessage>,
    plain: BTreeMap<(Reverse<Priority>, u64), OutboundMessage>,
    alerts: HashMap<UserId, VecDeque<QueuedAlert>>,
    /// `(seq of the user's oldest pending alert, user)`.
    alert_order: BTreeSet<(u64, UserId)>,
    pending_alerts: usize,
    blocked: HashSet<UserId>,
    next_seq: u64,
}

impl QueueState {
    fn len(&self) -> usize {
        self.retries.len() + self.plain.len() + self.pending_alerts
    }

    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn pending_for(&self, user: UserId) -> usize {
        self.alerts.get(&user).map_or(0, VecDeque::len)
    }

    /// Takes up to `cap` of the user's oldest alerts as one message.
    fn take_batch(&mut self, user: UserId, cap: usize) -> Option<OutboundMessage> {
        let pending = self.alerts.get_mut(&user)?;
        let front_seq = pending.front()?.seq;
        let take = pending.len().min(cap);
        let events: Vec<AlertEvent> = pending.drain(..take).map(|q| q.event).collect();
        let next_front = pending.front().map(|q| q.seq);

        self.alert_order.remove(&(front_seq, user));
        match next_front {
            Some(seq) => {
                self.alert_order.insert((seq, user));
            }
            None => {
                self.alerts.remove(&user);
            }
        }
        self.pending_alerts -= events.len();

        let priority = events
            .iter()
            .map(|e| e.priority)
            .max()
            .unwrap_or_default();
        Some(OutboundMessage {
            user_id: user,
            text: format_alert_batch(&events),
            priority,
            alert_count: events.len(),
            attempts: 0,
        })
    }

    fn take(&mut self, candidate: Candidate, cap: usize) -> Option<OutboundMessage> {
        match candidate {
            Candidate::Retry(index) => self.retries.remove(index),
            Candidate::Plain(key) => self.plain.remove(&key),
            Candidate::Batch(user) => self.take_batch(user, cap),
        }
    }

    /// Drops everything pending for `user`, returning the item count.
    fn clear_user(&mut self, user: UserId) -> usize {
        let mut cleared = 0;
        if let Some(pending) = self.alerts.remove(&user) {
            if let Some(front) = pending.front() {
                self.alert_order.remove(&(front.seq, user));
            }
            self.pending_alerts -= pending.len();
            cleared += pending.len();
        }
        let before = self.plain.len() + self.retries.len();
        self.plain.retain(|_, m| m.user_id != user);
        self.retries.retain(|m| m.user_id != user);
        cleared + before - (self.plain.len() + self.retries.len())
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    alerts_delivered: AtomicU64,
    transient_failures: AtomicU64,
    permanent_failures: AtomicU64,
    dropped: AtomicU64,
    shed: AtomicU64,
}

struct Shared {
    config: QueueConfig,
    client: Arc<dyn DeliveryClient>,
    limiter: DeliveryLimiter,
    state: Mutex<QueueState>,
    counters: Counters,
    flush: Notify,
    deactivations: mpsc::UnboundedSender<UserId>,
}

impl Shared {
    fn cap(&self) -> usize {
        self.config.max_alerts_per_message.max(1)
    }

    /// Picks the first item, in lane order, that every rate layer admits,
    /// and removes it from the queue. Returns `None` when nothing is
    /// admissible right now.
    fn take_next(&self, selection: Selection, now: Instant) -> Option<OutboundMessage> {
        let cap = self.cap();
        let mut state = self.state.lock();
        let any = selection == Selection::Any;

        let retries = state
            .retries
            .iter()
            .enumerate()
            .filter(|_| any)
            .map(|(i, m)| (Candidate::Retry(i), m.user_id));
        let plain = state
            .plain
            .iter()
            .filter(|_| any)
            .map(|(key, m)| (Candidate::Plain(*key), m.user_id));
        let batches = state
            .alert_order
            .iter()
            .filter(|(_, user)| any || state.pending_for(*user) >= cap)
            .map(|&(_, user)| (Candidate::Batch(user), user));

        let mut throttled: HashSet<UserId> = HashSet::new();
        let mut chosen = None;
        for (candidate, user) in retries.chain(plain).chain(batches) {
            if throttled.contains(&user) {
                continue;
            }
            match self.limiter.try_acquire_at(user, user, now) {
                Ok(()) => {
                    chosen = Some(candidate);
                    break;
                }
                Err(Throttle::Global(_)) => break,
                Err(_) => {
                    throttled.insert(user);
                }
            }
        }

        chosen.and_then(|candidate| state.take(candidate, cap))
    }

    async fn dispatch(&self, mut message: OutboundMessage) {
        message.attempts += 1;
        let outcome = self
            .client
            .send(message.user_id, &message.text, message.priority)
            .await;

        match outcome {
            SendOutcome::Delivered => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .alerts_delivered
                    .fetch_add(message.alert_count as u64, Ordering::Relaxed);
            }
            SendOutcome::Transient(reason) => {
                self.counters
                    .transient_failures
                    .fetch_add(1, Ordering::Relaxed);
                if message.attempts >= self.config.max_attempts {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        user_id = message.user_id,
                        attempts = message.attempts,
                        %reason,
                        "Delivery keeps failing, dropping message"
                    );
                } else {
                    warn!(
                        user_id = message.user_id,
                        attempts = message.attempts,
                        %reason,
                        "Delivery failed, re-queued"
                    );
                    self.state.lock().retries.push_front(message);
                }
            }
            SendOutcome::Rejected(reason) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(user_id = message.user_id, %reason, "Message rejected, dropping");
            }
            SendOutcome::Permanent(reason) => {
                self.counters
                    .permanent_failures
                    .fetch_add(1, Ordering::Relaxed);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(user_id = message.user_id, %reason, "Recipient unreachable");
                self.block_user(message.user_id);
            }
        }
    }

    /// Stops deliveries to `user` and signals the deactivation path once.
    fn block_user(&self, user: UserId) {
        let newly_blocked = {
            let mut state = self.state.lock();
            let cleared = state.clear_user(user);
            if cleared > 0 {
                self.counters
                    .dropped
                    .fetch_add(cleared as u64, Ordering::Relaxed);
            }
            state.blocked.insert(user)
        };
        if newly_blocked && self.deactivations.send(user).is_err() {
            debug!(user_id = user, "No deactivation listener");
        }
    }

    async fn send_one(&self) -> bool {
        match self.take_next(Selection::Any, Instant::now()) {
            Some(message) => {
                self.dispatch(message).await;
                true
            }
            None => false,
        }
    }

    async fn flush_full_batches(&self) {
        while let Some(message) = self.take_next(Selection::FullBatches, Instant::now()) {
            self.dispatch(message).await;
        }
    }
}

/// The outbound delivery queue.
pub struct OutboundQueue {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
}

impl OutboundQueue {
    /// Creates a stopped queue. User ids found to be permanently
    /// unreachable are published on `deactivations`.
    pub fn new(
        config: QueueConfig,
        client: Arc<dyn DeliveryClient>,
        deactivations: mpsc::UnboundedSender<UserId>,
    ) -> Self {
        let limiter = DeliveryLimiter::new(config.limits);
        Self {
            shared: Arc::new(Shared {
                config,
                client,
                limiter,
                state: Mutex::new(QueueState::default()),
                counters: Counters::default(),
                flush: Notify::new(),
                deactivations,
            }),
            task: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Queues a plain message. Returns `false` if the queue is full or the
    /// user is blocked.
    pub fn enqueue_message(&self, user: UserId, content: impl Into<String>, priority: Priority) -> bool {
        let mut state = self.shared.state.lock();
        if state.blocked.contains(&user) {
            debug!(user_id = user, "Skipping message for blocked user");
            return false;
        }
        if state.len() >= self.shared.config.capacity {
            self.shared.counters.shed.fetch_add(1, Ordering::Relaxed);
            warn!(user_id = user, "Outbound queue full, message shed");
            return false;
        }

        let seq = state.seq();
        state.plain.insert(
            (Reverse(priority), seq),
            OutboundMessage {
                user_id: user,
                text: content.into(),
                priority,
                alert_count: 0,
                attempts: 0,
            },
        );
        true
    }

    /// Drops every pending item for `user`.
    pub fn clear_user(&self, user: UserId) -> usize {
        self.shared.state.lock().clear_user(user)
    }

    /// Allows deliveries to a previously blocked user again.
    pub fn unblock_user(&self, user: UserId) -> bool {
        self.shared.state.lock().blocked.remove(&user)
    }

    pub fn is_blocked(&self, user: UserId) -> bool {
        self.shared.state.lock().blocked.contains(&user)
    }

    /// Alerts waiting for `user`.
    pub fn pending_alerts_for(&self, user: UserId) -> usize {
        self.shared.state.lock().pending_for(user)
    }

    /// Spawns the scheduler task.
    ///
    /// # Errors
    ///
    /// Returns [`KlaxonError::Lifecycle`] if the scheduler is already running.
    pub fn start(&self) -> Result<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(KlaxonError::Lifecycle(
                "outbound queue is already running".to_string(),
            ));
        }
        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();
        *task = Some(tokio::spawn(run_scheduler(self.shared.clone(), cancel)));
        info!(
            tick_ms = self.shared.config.tick_interval.as_millis() as u64,
            "Outbound queue started"
        );
        Ok(())
    }

    /// Stops the scheduler, then makes one best-effort pass over what is
    /// still queued, limited by the budget available right now and by
    /// `stop_grace`. Returns the number of messages sent during the flush.
    pub async fn stop(&self) -> usize {
        self.cancel.lock().cancel();
        let task = self.task.lock().take();
        if let Some(mut task) = task
            && tokio::time::timeout(self.shared.config.stop_grace, &mut task)
                .await
                .is_err()
        {
            warn!("Outbound scheduler did not stop in time, aborting");
            task.abort();
        }

        let shared = self.shared.clone();
        let flushed = tokio::time::timeout(self.shared.config.stop_grace, async move {
            let mut flushed = 0;
            while shared.send_one().await {
                flushed += 1;
            }
            flushed
        })
        .await
        .unwrap_or_else(|_| {
            warn!("Outbound flush hit the grace period");
            0
        });

        let left = self.shared.state.lock().len();
        if left > 0 {
            warn!(flushed, left, "Outbound queue stopped with undelivered items");
        } else {
            info!(flushed, "Outbound queue stopped");
        }
        flushed
    }

    pub fn get_stats(&self) -> QueueStats {
        let state = self.shared.state.lock();
        let counters = &self.shared.counters;
        QueueStats {
            running: self.task.lock().is_some(),
            pending_messages: state.plain.len() + state.retries.len(),
            pending_alerts: state.pending_alerts,
            pending_users: state.alerts.len(),
            messages_sent: counters.sent.load(Ordering::Relaxed),
            alerts_delivered: counters.alerts_delivered.load(Ordering::Relaxed),
            transient_failures: counters.transient_failures.load(Ordering::Relaxed),
            permanent_failures: counters.permanent_failures.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            shed: counters.shed.load(Ordering::Relaxed),
            blocked_users: state.blocked.len(),
        }
    }

    pub fn health_check(&self) -> HealthReport {
        let stats = self.get_stats();
        let mut issues = Vec::new();
        if !stats.running {
            issues.push("outbound queue is not running".to_string());
        }
        let pending = stats.pending_messages + stats.pending_alerts;
        let capacity = self.shared.config.capacity;
        if pending * 10 >= capacity * 9 {
            issues.push(format!("outbound queue at {pending}/{capacity}"));
        }
        HealthReport::from_issues(issues)
    }
}

impl AlertSink for OutboundQueue {
    fn enqueue_alerts(&self, alerts: Vec<AlertEvent>) -> usize {
        let cap = self.shared.cap();
        let mut accepted = 0;
        let mut flush = false;
        {
            let mut state = self.shared.state.lock();
            for event in alerts {
                let user = event.user_id;
                if state.blocked.contains(&user) {
                    continue;
                }
                if state.len() >= self.shared.config.capacity {
                    self.shared.counters.shed.fetch_add(1, Ordering::Relaxed);
                    warn!(user_id = user, "Outbound queue full, alert shed");
                    continue;
                }

                let seq = state.seq();
                let pending = state.alerts.entry(user).or_default();
                let was_empty = pending.is_empty();
                pending.push_back(QueuedAlert { seq, event });
                let count = pending.len();
                if was_empty {
                    state.alert_order.insert((seq, user));
                }
                state.pending_alerts += 1;
                flush |= count >= cap;
                accepted += 1;
            }
        }
        if flush {
            self.shared.flush.notify_one();
        }
        accepted
    }
}

async fn run_scheduler(shared: Arc<Shared>, cancel: CancellationToken) {
    let tick = shared.config.tick_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks: u64 = 0;
    let idle = shared
        .config
        .limits
        .per_chat_period
        .max(shared.config.limits.per_user_period);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                shared.send_one().await;
                shared.flush_full_batches().await;
                ticks += 1;
                if ticks % PRUNE_EVERY_TICKS == 0 {
                    shared.limiter.prune_idle(idle, Instant::now());
                }
            }
            () = shared.flush.notified() => shared.flush_full_batches().await,
        }
    }
    debug!("Outbound scheduler exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CandleAlert, Direction};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[derive(Default)]
    struct RecordingClient {
        sent: Mutex<Vec<(UserId, String, Instant)>>,
        script: Mutex<VecDeque<SendOutcome>>,
    }

    impl RecordingClient {
        fn scripted(outcomes: impl IntoIterator<Item = SendOutcome>) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                script: Mutex::new(outcomes.into_iter().collect()),
            }
        }

        fn users(&self) -> Vec<UserId> {
            self.sent.lock().iter().map(|(u, _, _)| *u).collect()
        }

        fn texts(&self) -> Vec<String> {
            self.sent.lock().iter().map(|(_, t, _)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl DeliveryClient for RecordingClient {
        async fn send(&self, user_id: UserId, text: &str, _priority: Priority) -> SendOutcome {
            self.sent
                .lock()
                .push((user_id, text.to_string(), Instant::now()));
            self.script
                .lock()
                .pop_front()
                .unwrap_or(SendOutcome::Delivered)
        }
    }

    fn relaxed_limits() -> DeliveryLimits {
        DeliveryLimits {
            global_max: 1000,
            global_period: Duration::from_secs(1),
            per_chat_max: 1000,
            per_chat_period: Duration::from_secs(1),
            per_user_max: 1000,
            per_user_period: Duration::from_secs(60),
        }
    }

    fn queue_with(
        config: QueueConfig,
        client: Arc<RecordingClient>,
    ) -> (OutboundQueue, mpsc::UnboundedReceiver<UserId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OutboundQueue::new(config, client, tx), rx)
    }

    fn alert(user: UserId, symbol: &str, pct: Decimal) -> AlertEvent {
        AlertEvent::candle(
            user,
            CandleAlert {
                preset_id: 1,
                symbol: symbol.to_string(),
                interval: "1m".to_string(),
                percent_change: pct,
                close_price: dec!(100),
                direction: Direction::of(pct),
            },
        )
    }

    #[tokio::test]
    async fn plain_messages_go_first_by_priority_then_fifo() {
        let client = Arc::new(RecordingClient::default());
        let config = QueueConfig {
            limits: relaxed_limits(),
            ..QueueConfig::default()
        };
        let (queue, _rx) = queue_with(config, client.clone());

        queue.enqueue_alerts(vec![alert(1, "BTCUSDT", dec!(3))]);
        assert!(queue.enqueue_message(2, "low", Priority::LOW));
        assert!(queue.enqueue_message(3, "first normal", Priority::NORMAL));
        assert!(queue.enqueue_message(4, "second normal", Priority::NORMAL));

        for _ in 0..4 {
            assert!(queue.shared.send_one().await);
        }
        assert!(!queue.shared.send_one().await);
        assert_eq!(client.users(), vec![3, 4, 2, 1]);
    }

    #[tokio::test]
    async fn batches_are_capped_and_overflow_waits() {
        let client = Arc::new(RecordingClient::default());
        let config = QueueConfig {
            limits: relaxed_limits(),
            max_alerts_per_message: 2,
            ..QueueConfig::default()
        };
        let (queue, _rx) = queue_with(config, client.clone());

        let accepted = queue.enqueue_alerts(vec![
            alert(1, "AUSDT", dec!(2)),
            alert(1, "BUSDT", dec!(2)),
            alert(1, "CUSDT", dec!(2)),
        ]);
        assert_eq!(accepted, 3);

        assert!(queue.shared.send_one().await);
        assert_eq!(queue.pending_alerts_for(1), 1);
        let first = &client.texts()[0];
        assert!(first.contains("AUSDT") && first.contains("BUSDT"));
        assert!(!first.contains("CUSDT"));

        assert!(queue.shared.send_one().await);
        assert_eq!(queue.pending_alerts_for(1), 0);
        assert_eq!(queue.get_stats().alerts_delivered, 3);
    }

    #[tokio::test]
    async fn oldest_pending_user_is_served_first() {
        let client = Arc::new(RecordingClient::default());
        let config = QueueConfig {
            limits: relaxed_limits(),
            max_alerts_per_message: 1,
            ..QueueConfig::default()
        };
        let (queue, _rx) = queue_with(config, client.clone());

        queue.enqueue_alerts(vec![
            alert(5, "AUSDT", dec!(2)),
            alert(6, "AUSDT", dec!(2)),
            alert(5, "BUSDT", dec!(2)),
        ]);
        while queue.shared.send_one().await {}
        assert_eq!(client.users(), vec![5, 6, 5]);
    }

    #[tokio::test]
    async fn per_chat_throttle_skips_to_next_user() {
        let client = Arc::new(RecordingClient::default());
        let config = QueueConfig {
            limits: DeliveryLimits {
                per_chat_max: 1,
                ..relaxed_limits()
            },
            ..QueueConfig::default()
        };
        let (queue, _rx) = queue_with(config, client.clone());

        queue.enqueue_message(1, "a", Priority::NORMAL);
        queue.enqueue_message(1, "b", Priority::NORMAL);
        queue.enqueue_message(2, "c", Priority::NORMAL);
        while queue.shared.send_one().await {}
        assert_eq!(client.texts(), vec!["a", "c"]);
        assert_eq!(queue.get_stats().pending_messages, 1);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_first() {
        let client = Arc::new(RecordingClient::scripted([SendOutcome::Transient(
            "timeout".to_string(),
        )]));
        let config = QueueConfig {
            limits: relaxed_limits(),
            ..QueueConfig::default()
        };
        let (queue, _rx) = queue_with(config, client.clone());

        queue.enqueue_message(1, "one", Priority::NORMAL);
        queue.enqueue_message(2, "two", Priority::NORMAL);
        while queue.shared.send_one().await {}

        assert_eq!(client.texts(), vec!["one", "one", "two"]);
        let stats = queue.get_stats();
        assert_eq!(stats.transient_failures, 1);
        assert_eq!(stats.messages_sent, 2);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let client = Arc::new(RecordingClient::scripted(
            std::iter::repeat_n(SendOutcome::Transient("down".to_string()), 10),
        ));
        let config = QueueConfig {
            limits: relaxed_limits(),
            max_attempts: 3,
            ..QueueConfig::default()
        };
        let (queue, _rx) = queue_with(config, client.clone());

        queue.enqueue_message(1, "doomed", Priority::NORMAL);
        while queue.shared.send_one().await {}
        assert_eq!(client.texts().len(), 3);
        assert_eq!(queue.get_stats().dropped, 1);
    }

    #[tokio::test]
    async fn permanent_failure_blocks_user_and_signals_once() {
        let client = Arc::new(RecordingClient::scripted([SendOutcome::Permanent(
            "bot was blocked by the user".to_string(),
        )]));
        let config = QueueConfig {
            limits: relaxed_limits(),
            max_alerts_per_message: 1,
            ..QueueConfig::default()
        };
        let (queue, mut rx) = queue_with(config, client.clone());

        queue.enqueue_alerts(vec![alert(9, "AUSDT", dec!(2)), alert(9, "BUSDT", dec!(2))]);
        while queue.shared.send_one().await {}

        assert_eq!(client.texts().len(), 1);
        assert_eq!(rx.try_recv().unwrap(), 9);
        assert!(rx.try_recv().is_err());
        assert!(queue.is_blocked(9));
        assert_eq!(queue.pending_alerts_for(9), 0);
        assert_eq!(queue.enqueue_alerts(vec![alert(9, "CUSDT", dec!(2))]), 0);
        assert!(!queue.enqueue_message(9, "hello?", Priority::NORMAL));

        assert!(queue.unblock_user(9));
        assert!(queue.enqueue_message(9, "welcome back", Priority::NORMAL));
    }

    #[tokio::test]
    async fn capacity_sheds_excess() {
        let client = Arc::new(RecordingClient::default());
        let config = QueueConfig {
            capacity: 2,
            ..QueueConfig::default()
        };
        let (queue, _rx) = queue_with(config, client);

        assert_eq!(
            queue.enqueue_alerts(vec![
                alert(1, "AUSDT", dec!(2)),
                alert(2, "AUSDT", dec!(2)),
                alert(3, "AUSDT", dec!(2)),
            ]),
            2
        );
        assert!(!queue.enqueue_message(4, "x", Priority::URGENT));
        assert_eq!(queue.get_stats().shed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_is_flushed_without_waiting_for_tick() {
        let client = Arc::new(RecordingClient::default());
        let config = QueueConfig {
            limits: relaxed_limits(),
            tick_interval: Duration::from_secs(3600),
            max_alerts_per_message: 3,
            ..QueueConfig::default()
        };
        let (queue, _rx) = queue_with(config, client.clone());
        queue.start().unwrap();

        queue.enqueue_alerts(vec![alert(1, "AUSDT", dec!(2)), alert(1, "BUSDT", dec!(2))]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(client.texts().is_empty());

        queue.enqueue_alerts(vec![alert(1, "CUSDT", dec!(2))]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.texts().len(), 1);
        assert_eq!(queue.pending_alerts_for(1), 0);

        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sends_never_exceed_global_window() {
        let client = Arc::new(RecordingClient::default());
        let config = QueueConfig {
            limits: DeliveryLimits {
                global_max: 5,
                global_period: Duration::from_secs(1),
                ..relaxed_limits()
            },
            tick_interval: Duration::from_millis(100),
            max_alerts_per_message: 1,
            ..QueueConfig::default()
        };
        let (queue, _rx) = queue_with(config, client.clone());
        queue.start().unwrap();

        let alerts: Vec<AlertEvent> = (0..100).map(|u| alert(u, "BTCUSDT", dec!(3))).collect();
        assert_eq!(queue.enqueue_alerts(alerts), 100);
        tokio::time::sleep(Duration::from_secs(10)).await;
        queue.stop().await;

        let times: Vec<Instant> = client.sent.lock().iter().map(|(_, _, t)| *t).collect();
        assert!(times.len() >= 45, "only {} sends", times.len());
        for (i, start) in times.iter().enumerate() {
            let in_window = times[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < Duration::from_secs(1))
                .count();
            assert!(in_window <= 5, "{in_window} sends within one second");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flushes_within_remaining_budget() {
        let client = Arc::new(RecordingClient::default());
        let config = QueueConfig {
            limits: DeliveryLimits {
                global_max: 2,
                global_period: Duration::from_secs(60),
                ..relaxed_limits()
            },
            ..QueueConfig::default()
        };
        let (queue, _rx) = queue_with(config, client.clone());
        queue.start().unwrap();

        for user in 1..=3 {
            queue.enqueue_message(user, "bye", Priority::NORMAL);
        }
        let started = Instant::now();
        assert_eq!(queue.stop().await, 2);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(queue.get_stats().pending_messages, 1);
        assert!(!queue.is_running());
    }
}

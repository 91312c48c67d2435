//! Gas price monitoring and one-shot threshold alerts.
//!
//! The monitor polls a [`FeeOracle`] and keeps the previous and current
//! price. A threshold fires when it lies strictly between the two, and is
//! then removed everywhere: the user has to arm it again.

pub mod oracle;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::Bound::Excluded;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Result;
use crate::cache::SubscriptionCache;
use crate::error::KlaxonError;
use crate::models::{AlertEvent, Direction, GasCrossingAlert, GasPriceSample, HealthReport, UserId};
use crate::queue::AlertSink;
use crate::storage::Storage;

pub use oracle::{EtherscanOracle, FeeOracle, parse_gas_oracle};

/// Gas monitor tuning.
#[derive(Debug, Clone)]
pub struct GasMonitorConfig {
    pub poll_interval: Duration,
    /// Oracle timeout; kept below the poll interval.
    pub fetch_timeout: Duration,
    /// Samples kept for [`GasMonitor::history`].
    pub history_size: usize,
    /// Fraction of failed checks above which the monitor is unhealthy.
    pub max_error_rate: f64,
}

impl Default for GasMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(10),
            history_size: 1440,
            max_error_rate: 0.5,
        }
    }
}

/// Armed thresholds grouped by value.
#[derive(Debug, Default)]
pub struct ThresholdBook {
    levels: BTreeMap<Decimal, BTreeSet<UserId>>,
    by_user: HashMap<UserId, Decimal>,
}

impl ThresholdBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms (or moves) a user's threshold, returning the previous value.
    pub fn insert(&mut self, user: UserId, gwei: Decimal) -> Option<Decimal> {
        let previous = self.remove(user);
        self.levels.entry(gwei).or_default().insert(user);
        self.by_user.insert(user, gwei);
        previous
    }

    pub fn remove(&mut self, user: UserId) -> Option<Decimal> {
        let gwei = self.by_user.remove(&user)?;
        if let Some(users) = self.levels.get_mut(&gwei) {
            users.remove(&user);
            if users.is_empty() {
                self.levels.remove(&gwei);
            }
        }
        Some(gwei)
    }

    pub fn get(&self, user: UserId) -> Option<Decimal> {
        self.by_user.get(&user).copied()
    }

    /// Levels strictly between `a` and `b`, in either order.
    pub fn crossed(&self, a: Decimal, b: Decimal) -> Vec<(Decimal, Vec<UserId>)> {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        if lo >= hi {
            return Vec::new();
        }
        self.levels
            .range((Excluded(lo), Excluded(hi)))
            .map(|(gwei, users)| (*gwei, users.iter().copied().collect()))
            .collect()
    }

    /// Like [`crossed`](Self::crossed), but disarms what it returns.
    pub fn take_crossed(&mut self, a: Decimal, b: Decimal) -> Vec<(Decimal, Vec<UserId>)> {
        let crossed = self.crossed(a, b);
        for (gwei, users) in &crossed {
            self.levels.remove(gwei);
            for user in users {
                self.by_user.remove(user);
            }
        }
        crossed
    }

    /// Number of armed users.
    pub fn len(&self) -> usize {
        self.by_user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_user.is_empty()
    }

    /// Number of distinct threshold values.
    pub fn levels(&self) -> usize {
        self.levels.len()
    }

    pub fn clear(&mut self) {
        self.levels.clear();
        self.by_user.clear();
    }
}

/// What one successful check did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasCheck {
    pub price_gwei: Decimal,
    pub previous_gwei: Option<Decimal>,
    pub crossed_levels: usize,
    pub alerts: usize,
}

/// Point-in-time monitor counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GasStats {
    pub running: bool,
    pub current_gwei: Option<Decimal>,
    pub previous_gwei: Option<Decimal>,
    pub checks: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub alerts_emitted: u64,
    pub thresholds: usize,
    pub threshold_levels: usize,
    pub last_success_age: Option<Duration>,
}

#[derive(Debug, Default)]
struct PriceState {
    previous: Option<Decimal>,
    current: Option<Decimal>,
    last_success: Option<Instant>,
    history: VecDeque<GasPriceSample>,
}

#[derive(Debug, Default)]
struct Counters {
    checks: AtomicU64,
    errors: AtomicU64,
    alerts: AtomicU64,
}

struct Shared {
    config: GasMonitorConfig,
    oracle: Arc<dyn FeeOracle>,
    cache: Arc<SubscriptionCache>,
    storage: Arc<dyn Storage>,
    alerts: Arc<dyn AlertSink>,
    book: RwLock<ThresholdBook>,
    prices: Mutex<PriceState>,
    counters: Counters,
    started_at: Mutex<Option<Instant>>,
}

impl Shared {
    async fn check_once(&self) -> Result<GasCheck> {
        self.counters.checks.fetch_add(1, Ordering::Relaxed);
        let fetched = match tokio::time::timeout(
            self.config.fetch_timeout,
            self.oracle.current_gwei(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(KlaxonError::Oracle(format!(
                "no answer within {}s",
                self.config.fetch_timeout.as_secs()
            ))),
        };
        let price = match fetched {
            Ok(price) => price,
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!("Gas price check failed: {e}");
                return Err(e);
            }
        };

        let previous = {
            let mut prices = self.prices.lock();
            let previous = prices.current;
            prices.previous = previous;
            prices.current = Some(price);
            prices.last_success = Some(Instant::now());
            prices.history.push_back(GasPriceSample {
                timestamp: Utc::now(),
                price_gwei: price,
            });
            while prices.history.len() > self.config.history_size {
                prices.history.pop_front();
            }
            previous
        };

        let Some(previous) = previous else {
            info!(gwei = %price, "First gas price sample");
            return Ok(GasCheck {
                price_gwei: price,
                previous_gwei: None,
                crossed_levels: 0,
                alerts: 0,
            });
        };

        let crossed = self.book.write().take_crossed(previous, price);
        if crossed.is_empty() {
            return Ok(GasCheck {
                price_gwei: price,
                previous_gwei: Some(previous),
                crossed_levels: 0,
                alerts: 0,
            });
        }

        let direction = Direction::of(price - previous);
        let mut alerts = Vec::new();
        for (threshold, users) in &crossed {
            info!(
                threshold = %threshold,
                from = %previous,
                to = %price,
                users = users.len(),
                "Gas threshold crossed"
            );
            for &user in users {
                alerts.push(AlertEvent::gas_crossing(
                    user,
                    GasCrossingAlert {
                        threshold_gwei: *threshold,
                        previous_gwei: previous,
                        current_gwei: price,
                        direction,
                    },
                ));
                self.disarm(user, *threshold).await;
            }
        }

        let produced = alerts.len();
        let accepted = self.alerts.enqueue_alerts(alerts);
        if accepted < produced {
            warn!(dropped = produced - accepted, "Outbound queue rejected gas alerts");
        }
        self.counters
            .alerts
            .fetch_add(accepted as u64, Ordering::Relaxed);

        Ok(GasCheck {
            price_gwei: price,
            previous_gwei: Some(previous),
            crossed_levels: crossed.len(),
            alerts: accepted,
        })
    }

    /// Removes a fired threshold from the cache and storage, unless the
    /// user has re-armed a different value in the meantime.
    async fn disarm(&self, user: UserId, threshold: Decimal) {
        self.cache.remove_gas_threshold_if(user, threshold);
        if let Err(e) = self.storage.delete_gas_threshold_if(user, threshold).await {
            error!(user_id = user, "Failed to delete fired gas threshold: {e}");
        }
    }
}

/// Polls the fee oracle and fires one-shot crossing alerts.
pub struct GasMonitor {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
}

impl GasMonitor {
    pub fn new(
        config: GasMonitorConfig,
        oracle: Arc<dyn FeeOracle>,
        cache: Arc<SubscriptionCache>,
        storage: Arc<dyn Storage>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                oracle,
                cache,
                storage,
                alerts,
                book: RwLock::new(ThresholdBook::new()),
                prices: Mutex::new(PriceState::default()),
                counters: Counters::default(),
                started_at: Mutex::new(None),
            }),
            task: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Re-reads every threshold from the cache into the grouping.
    pub fn reload_thresholds(&self) -> usize {
        let thresholds = self.shared.cache.all_gas_thresholds();
        let mut book = self.shared.book.write();
        book.clear();
        for (user, gwei) in thresholds {
            book.insert(user, gwei);
        }
        book.len()
    }

    /// Loads thresholds from the cache and spawns the polling task.
    ///
    /// # Errors
    ///
    /// Returns [`KlaxonError::Lifecycle`] if the monitor is already running.
    pub fn start(&self) -> Result<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(KlaxonError::Lifecycle(
                "gas monitor is already running".to_string(),
            ));
        }
        let armed = self.reload_thresholds();

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();
        *self.shared.started_at.lock() = Some(Instant::now());
        *task = Some(tokio::spawn(run_monitor(self.shared.clone(), cancel)));
        info!(
            thresholds = armed,
            interval_secs = self.shared.config.poll_interval.as_secs(),
            "Gas monitor started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        self.cancel.lock().cancel();
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(self.shared.config.fetch_timeout, &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
            info!("Gas monitor stopped");
        }
    }

    /// Arms a one-shot threshold for `user`, replacing any previous one.
    pub fn add_threshold(&self, user: UserId, gwei: Decimal) -> Option<Decimal> {
        self.shared.cache.set_gas_threshold(user, gwei);
        self.shared.book.write().insert(user, gwei)
    }

    pub fn remove_threshold(&self, user: UserId) -> Option<Decimal> {
        self.shared.cache.remove_gas_threshold(user);
        self.shared.book.write().remove(user)
    }

    pub fn threshold(&self, user: UserId) -> Option<Decimal> {
        self.shared.book.read().get(user)
    }

    /// Runs one poll immediately.
    ///
    /// # Errors
    ///
    /// Returns the oracle error; price state is left untouched.
    pub async fn check_once(&self) -> Result<GasCheck> {
        self.shared.check_once().await
    }

    pub fn current_price(&self) -> Option<Decimal> {
        self.shared.prices.lock().current
    }

    /// Samples taken at or after `since`, oldest first.
    pub fn history(&self, since: DateTime<Utc>) -> Vec<GasPriceSample> {
        self.shared
            .prices
            .lock()
            .history
            .iter()
            .filter(|s| s.timestamp >= since)
            .copied()
            .collect()
    }

    pub fn get_stats(&self) -> GasStats {
        let counters = &self.shared.counters;
        let checks = counters.checks.load(Ordering::Relaxed);
        let errors = counters.errors.load(Ordering::Relaxed);
        let (current, previous, last_success) = {
            let prices = self.shared.prices.lock();
            (prices.current, prices.previous, prices.last_success)
        };
        let book = self.shared.book.read();
        GasStats {
            running: self.is_running(),
            current_gwei: current,
            previous_gwei: previous,
            checks,
            errors,
            error_rate: if checks == 0 {
                0.0
            } else {
                errors as f64 / checks as f64
            },
            alerts_emitted: counters.alerts.load(Ordering::Relaxed),
            thresholds: book.len(),
            threshold_levels: book.levels(),
            last_success_age: last_success.map(|at| Instant::now().saturating_duration_since(at)),
        }
    }

    pub fn health_check(&self) -> HealthReport {
        let stats = self.get_stats();
        let stale_after = self.shared.config.poll_interval * 2;
        let mut issues = Vec::new();

        let since_success = stats.last_success_age.or_else(|| {
            self.shared
                .started_at
                .lock()
                .map(|at| Instant::now().saturating_duration_since(at))
        });
        match since_success {
            Some(age) if age > stale_after => {
                issues.push(format!("no successful gas check for {}s", age.as_secs()));
            }
            None => issues.push("gas monitor has not started".to_string()),
            Some(_) => {}
        }
        if stats.current_gwei.is_none() {
            issues.push("no current gas price".to_string());
        }
        if stats.checks > 0 && stats.error_rate > self.shared.config.max_error_rate {
            issues.push(format!(
                "gas oracle error rate {:.0}%",
                stats.error_rate * 100.0
            ));
        }
        HealthReport::from_issues(issues)
    }
}

async fn run_monitor(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // Errors are already counted and logged.
        let _ = tokio::select! {
            () = cancel.cancelled() => break,
            result = shared.check_once() => result,
        };
    }
}

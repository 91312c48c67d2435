//! Time-windowed suppression of repeated alerts.
//!
//! Callers record a key only once its alert is accepted downstream.
//! Expired entries are overwritten when the key fires again; once the
//! table grows past its size bound, a sweep drops every expired entry and,
//! if that is not enough, the oldest ones.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::time::Instant;

use crate::models::{StreamKey, UserId};

/// Which events count as "the same alert".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupScope {
    /// Same user, stream and rounded percent change.
    #[default]
    PerChange,
    /// Same user and stream, whatever the change.
    PerStream,
}

/// Composite dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub user_id: UserId,
    pub stream: StreamKey,
    pub percent_change: Option<Decimal>,
}

impl DedupKey {
    pub fn new(scope: DedupScope, user_id: UserId, stream: StreamKey, percent_change: Decimal) -> Self {
        Self {
            user_id,
            stream,
            percent_change: match scope {
                // Normalize so 3.0 and 3.00 collide.
                DedupScope::PerChange => Some(percent_change.normalize()),
                DedupScope::PerStream => None,
            },
        }
    }
}

/// Bounded map of recently fired alerts.
#[derive(Debug)]
pub struct DedupTable {
    window: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<DedupKey, Instant>>,
}

impl DedupTable {
    pub fn new(window: Duration, max_entries: usize) -> Self {
        Self {
            window,
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if `key` fired within the window.
    pub fn is_duplicate(&self, key: &DedupKey) -> bool {
        self.is_duplicate_at(key, Instant::now())
    }

    pub fn is_duplicate_at(&self, key: &DedupKey, now: Instant) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|fired_at| now.saturating_duration_since(*fired_at) < self.window)
    }

    /// Marks `key` as fired now.
    pub fn record(&self, key: DedupKey) {
        self.record_at(key, Instant::now());
    }

    pub fn record_at(&self, key: DedupKey, now: Instant) {
        let mut entries = self.entries.lock();
        entries.insert(key, now);
        if entries.len() > self.max_entries {
            self.sweep(&mut entries, now);
        }
    }

    fn sweep(&self, entries: &mut HashMap<DedupKey, Instant>, now: Instant) {
        entries.retain(|_, fired_at| now.saturating_duration_since(*fired_at) < self.window);

        let excess = entries.len().saturating_sub(self.max_entries);
        if excess > 0 {
            let mut by_age: Vec<(DedupKey, Instant)> =
                entries.iter().map(|(k, t)| (k.clone(), *t)).collect();
            by_age.sort_by_key(|(_, t)| *t);
            for (key, _) in by_age.into_iter().take(excess) {
                entries.remove(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Forgets every entry for one user.
    pub fn forget_user(&self, user: UserId) {
        self.entries.lock().retain(|key, _| key.user_id != user);
    }
}

//! In-memory subscription cache.
//!
//! [`SubscriptionCache`] is the authoritative index consulted on the hot
//! ingestion path. Presets and the `StreamKey -> user -> presets` index
//! live under one lock so readers never see a half-inserted preset. Gas
//! thresholds and front-end session state each have their own lock, so
//! the three namespaces never contend with each other.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use crate::Result;
use crate::models::{Preset, PresetId, StreamKey, UserId};
use crate::storage::Storage;

/// One matching preset returned by [`SubscriptionCache::get_subscribers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribedPreset {
    pub preset_id: PresetId,
    pub threshold_percent: Decimal,
}

/// Subscribers of one stream, keyed by user. Each user's presets are in
/// ascending id order.
pub type Subscribers = BTreeMap<UserId, Vec<SubscribedPreset>>;

/// Counts exposed for health and metrics collectors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub presets: usize,
    pub active_presets: usize,
    pub indexed_streams: usize,
    pub subscribed_users: usize,
    pub gas_thresholds: usize,
}

#[derive(Debug, Default)]
struct SubscriptionState {
    presets: HashMap<PresetId, Preset>,
    by_owner: HashMap<UserId, BTreeSet<PresetId>>,
    index: HashMap<StreamKey, BTreeMap<UserId, Vec<PresetId>>>,
}

impl SubscriptionState {
    fn index_preset(&mut self, preset: &Preset) {
        for key in preset.stream_keys() {
            let ids = self
                .index
                .entry(key)
                .or_default()
                .entry(preset.owner_user_id)
                .or_default();
            if let Err(pos) = ids.binary_search(&preset.id) {
                ids.insert(pos, preset.id);
            }
        }
    }

    /// Removes the preset from every index leaf and prunes empty containers.
    fn unindex_preset(&mut self, preset: &Preset) {
        for key in preset.stream_keys() {
            let Some(users) = self.index.get_mut(&key) else {
                continue;
            };
            if let Some(ids) = users.get_mut(&preset.owner_user_id) {
                ids.retain(|id| *id != preset.id);
                if ids.is_empty() {
                    users.remove(&preset.owner_user_id);
                }
            }
            if users.is_empty() {
                self.index.remove(&key);
            }
        }
    }

    fn insert(&mut self, preset: Preset) {
        if let Some(old) = self.presets.remove(&preset.id) {
            self.unindex_preset(&old);
            self.unlink_owner(old.owner_user_id, old.id);
        }
        if preset.active {
            self.index_preset(&preset);
        }
        self.by_owner
            .entry(preset.owner_user_id)
            .or_default()
            .insert(preset.id);
        self.presets.insert(preset.id, preset);
    }

    fn unlink_owner(&mut self, owner: UserId, id: PresetId) {
        if let Some(ids) = self.by_owner.get_mut(&owner) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_owner.remove(&owner);
            }
        }
    }

    fn remove(&mut self, id: PresetId) -> Option<Preset> {
        let preset = self.presets.remove(&id)?;
        self.unindex_preset(&preset);
        self.unlink_owner(preset.owner_user_id, id);
        Some(preset)
    }

    fn set_active(&mut self, id: PresetId, active: bool) -> bool {
        let Some(preset) = self.presets.get(&id).cloned() else {
            return false;
        };
        if preset.active == active {
            return true;
        }
        if active {
            self.index_preset(&preset);
        } else {
            self.unindex_preset(&preset);
        }
        if let Some(stored) = self.presets.get_mut(&id) {
            stored.active = active;
        }
        true
    }
}

/// Concurrent index of presets, gas thresholds, and session state.
#[derive(Debug, Default)]
pub struct SubscriptionCache {
    subscriptions: RwLock<SubscriptionState>,
    gas_thresholds: RwLock<HashMap<UserId, Decimal>>,
    sessions: Mutex<HashMap<UserId, String>>,
}

impl SubscriptionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the cache contents with the active presets and gas
    /// thresholds held by `storage`.
    ///
    /// Running it twice yields the same state; anything the cache held that
    /// storage no longer reports is dropped.
    ///
    /// # Errors
    ///
    /// Returns the storage error if either load fails; the cache is left
    /// untouched in that case.
    pub async fn load_from_storage(&self, storage: &dyn Storage) -> Result<()> {
        let presets = storage.load_active_presets().await?;
        let thresholds = storage.load_gas_thresholds().await?;

        let preset_count = presets.len();
        let threshold_count = thresholds.len();

        {
            let mut state = self.subscriptions.write();
            *state = SubscriptionState::default();
            for preset in presets {
                state.insert(preset);
            }
        }
        {
            let mut gas = self.gas_thresholds.write();
            *gas = thresholds.into_iter().collect();
        }

        info!(
            presets = preset_count,
            gas_thresholds = threshold_count,
            "Loaded subscriptions from storage"
        );
        Ok(())
    }

    /// Inserts or replaces a preset. Active presets are indexed under every
    /// (symbol, interval) pair they watch.
    pub fn add_preset(&self, preset: Preset) {
        debug!(preset_id = preset.id, user_id = preset.owner_user_id, "Caching preset");
        self.subscriptions.write().insert(preset);
    }

    /// Removes a preset entirely, returning it if it was cached.
    pub fn remove_preset(&self, id: PresetId) -> Option<Preset> {
        self.subscriptions.write().remove(id)
    }

    /// Activates or deactivates a cached preset. Deactivated presets keep
    /// their record but leave the subscriber index.
    ///
    /// Returns `false` if the preset is unknown.
    pub fn set_active(&self, id: PresetId, active: bool) -> bool {
        self.subscriptions.write().set_active(id, active)
    }

    /// Deactivates every preset owned by `user`, returning their ids.
    pub fn deactivate_user(&self, user: UserId) -> Vec<PresetId> {
        let mut state = self.subscriptions.write();
        let ids: Vec<PresetId> = state
            .by_owner
            .get(&user)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        let mut deactivated = Vec::new();
        for id in ids {
            if state.presets.get(&id).is_some_and(|p| p.active) {
                state.set_active(id, false);
                deactivated.push(id);
            }
        }
        deactivated
    }

    pub fn preset(&self, id: PresetId) -> Option<Preset> {
        self.subscriptions.read().presets.get(&id).cloned()
    }

    /// All cached presets of one user, in id order.
    pub fn presets_for_user(&self, user: UserId) -> Vec<Preset> {
        let state = self.subscriptions.read();
        state
            .by_owner
            .get(&user)
            .into_iter()
            .flatten()
            .filter_map(|id| state.presets.get(id).cloned())
            .collect()
    }

    /// Active presets subscribed to this exact stream, grouped by user.
    pub fn get_subscribers(&self, symbol: &str, interval: &str) -> Subscribers {
        let key = StreamKey::new(symbol, interval);
        let state = self.subscriptions.read();
        let Some(users) = state.index.get(&key) else {
            return Subscribers::new();
        };

        users
            .iter()
            .filter_map(|(user, ids)| {
                let presets: Vec<SubscribedPreset> = ids
                    .iter()
                    .filter_map(|id| state.presets.get(id))
                    .filter(|p| p.active)
                    .map(|p| SubscribedPreset {
                        preset_id: p.id,
                        threshold_percent: p.threshold_percent,
                    })
                    .collect();
                (!presets.is_empty()).then_some((*user, presets))
            })
            .collect()
    }

    /// Every stream with at least one active subscriber.
    pub fn required_streams(&self) -> BTreeSet<StreamKey> {
        self.subscriptions.read().index.keys().cloned().collect()
    }

    /// Sets (or overwrites) a user's gas threshold, returning the old value.
    pub fn set_gas_threshold(&self, user: UserId, gwei: Decimal) -> Option<Decimal> {
        self.gas_thresholds.write().insert(user, gwei)
    }

    pub fn remove_gas_threshold(&self, user: UserId) -> Option<Decimal> {
        self.gas_thresholds.write().remove(&user)
    }

    /// Removes the user's threshold only while it still equals `expected`.
    pub fn remove_gas_threshold_if(&self, user: UserId, expected: Decimal) -> bool {
        let mut thresholds = self.gas_thresholds.write();
        if thresholds.get(&user) == Some(&expected) {
            thresholds.remove(&user);
            true
        } else {
            false
        }
    }

    pub fn gas_threshold(&self, user: UserId) -> Option<Decimal> {
        self.gas_thresholds.read().get(&user).copied()
    }

    /// Every armed gas threshold, ordered by user.
    pub fn all_gas_thresholds(&self) -> Vec<(UserId, Decimal)> {
        let mut all: Vec<(UserId, Decimal)> = self
            .gas_thresholds
            .read()
            .iter()
            .map(|(user, gwei)| (*user, *gwei))
            .collect();
        all.sort_by_key(|(user, _)| *user);
        all
    }

    pub fn set_user_state(&self, user: UserId, state: impl Into<String>) {
        self.sessions.lock().insert(user, state.into());
    }

    pub fn user_state(&self, user: UserId) -> Option<String> {
        self.sessions.lock().get(&user).cloned()
    }

    pub fn clear_user_state(&self, user: UserId) {
        self.sessions.lock().remove(&user);
    }

    pub fn get_stats(&self) -> CacheStats {
        let (presets, active_presets, indexed_streams, subscribed_users) = {
            let state = self.subscriptions.read();
            let users: BTreeSet<UserId> = state
                .index
                .values()
                .flat_map(|users| users.keys().copied())
                .collect();
            (
                state.presets.len(),
                state.presets.values().filter(|p| p.active).count(),
                state.index.len(),
                users.len(),
            )
        };
        CacheStats {
            presets,
            active_presets,
            indexed_streams,
            subscribed_users,
            gas_thresholds: self.gas_thresholds.read().len(),
        }
    }

    #[cfg(test)]
    fn index_snapshot(&self) -> Vec<(StreamKey, UserId, Vec<PresetId>)> {
        let state = self.subscriptions.read();
        let mut rows: Vec<_> = state
            .index
            .iter()
            .flat_map(|(key, users)| {
                users
                    .iter()
                    .map(move |(user, ids)| (key.clone(), *user, ids.clone()))
            })
            .collect();
        rows.sort();
        rows
    }
}

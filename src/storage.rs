//! Persistence collaborator for presets and gas thresholds.
//!
//! The pipeline only needs the [`Storage`] trait. Two implementations ship
//! with the crate: [`MemoryStorage`] for tests and ephemeral runs, and
//! [`JsonFileStorage`], which rewrites a JSON document after every mutation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Result;
use crate::error::KlaxonError;
use crate::models::{NewPreset, Preset, PresetId, UserId};

/// Operations the pipeline needs from persistent storage.
#[async_trait]
pub trait Storage: Send + Sync {
    /// All presets with `active = true`.
    async fn load_active_presets(&self) -> Result<Vec<Preset>>;

    /// Every armed gas threshold.
    async fn load_gas_thresholds(&self) -> Result<Vec<(UserId, Decimal)>>;

    /// Persists a new preset and returns it with its assigned id.
    async fn create_preset(&self, preset: NewPreset) -> Result<Preset>;

    /// Presets owned by `user`, active or not.
    async fn user_presets(&self, user: UserId) -> Result<Vec<Preset>>;

    /// Returns `false` if the preset does not exist.
    async fn set_preset_active(&self, id: PresetId, active: bool) -> Result<bool>;

    /// Deletes a preset if it belongs to `owner`. Returns `false` otherwise.
    async fn delete_preset(&self, id: PresetId, owner: UserId) -> Result<bool>;

    /// Sets or overwrites the user's gas threshold.
    async fn set_gas_threshold(&self, user: UserId, gwei: Decimal) -> Result<()>;

    /// Returns `false` if the user had no threshold.
    async fn delete_gas_threshold(&self, user: UserId) -> Result<bool>;

    /// Deletes the user's threshold only while it still equals `expected`.
    async fn delete_gas_threshold_if(&self, user: UserId, expected: Decimal) -> Result<bool>;
}

/// The full persisted document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredData {
    next_preset_id: PresetId,
    presets: BTreeMap<PresetId, Preset>,
    gas_thresholds: BTreeMap<UserId, Decimal>,
}

impl StoredData {
    fn active_presets(&self) -> Vec<Preset> {
        self.presets.values().filter(|p| p.active).cloned().collect()
    }

    fn gas_thresholds(&self) -> Vec<(UserId, Decimal)> {
        self.gas_thresholds.iter().map(|(u, g)| (*u, *g)).collect()
    }

    fn create_preset(&mut self, preset: NewPreset) -> Preset {
        self.next_preset_id += 1;
        let preset = preset.with_id(self.next_preset_id);
        self.presets.insert(preset.id, preset.clone());
        preset
    }

    fn user_presets(&self, user: UserId) -> Vec<Preset> {
        self.presets
            .values()
            .filter(|p| p.owner_user_id == user)
            .cloned()
            .collect()
    }

    fn set_preset_active(&mut self, id: PresetId, active: bool) -> bool {
        match self.presets.get_mut(&id) {
            Some(preset) => {
                preset.active = active;
                true
            }
            None => false,
        }
    }

    fn remove_gas_threshold_if(&mut self, user: UserId, expected: Decimal) -> bool {
        if self.gas_thresholds.get(&user) == Some(&expected) {
            self.gas_thresholds.remove(&user);
            true
        } else {
            false
        }
    }

    fn delete_preset(&mut self, id: PresetId, owner: UserId) -> bool {
        if self.presets.get(&id).is_some_and(|p| p.owner_user_id == owner) {
            self.presets.remove(&id);
            true
        } else {
            false
        }
    }
}

/// Volatile storage backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: Mutex<StoredData>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load_active_presets(&self) -> Result<Vec<Preset>> {
        Ok(self.data.lock().active_presets())
    }

    async fn load_gas_thresholds(&self) -> Result<Vec<(UserId, Decimal)>> {
        Ok(self.data.lock().gas_thresholds())
    }

    async fn create_preset(&self, preset: NewPreset) -> Result<Preset> {
        Ok(self.data.lock().create_preset(preset))
    }

    async fn user_presets(&self, user: UserId) -> Result<Vec<Preset>> {
        Ok(self.data.lock().user_presets(user))
    }

    async fn set_preset_active(&self, id: PresetId, active: bool) -> Result<bool> {
        Ok(self.data.lock().set_preset_active(id, active))
    }

    async fn delete_preset(&self, id: PresetId, owner: UserId) -> Result<bool> {
        Ok(self.data.lock().delete_preset(id, owner))
    }

    async fn set_gas_threshold(&self, user: UserId, gwei: Decimal) -> Result<()> {
        self.data.lock().gas_thresholds.insert(user, gwei);
        Ok(())
    }

    async fn delete_gas_threshold(&self, user: UserId) -> Result<bool> {
        Ok(self.data.lock().gas_thresholds.remove(&user).is_some())
    }

    async fn delete_gas_threshold_if(&self, user: UserId, expected: Decimal) -> Result<bool> {
        Ok(self.data.lock().remove_gas_threshold_if(user, expected))
    }
}

/// Storage persisted as a single JSON document.
///
/// Writes go to a sibling temporary file which is then renamed over the
/// target, so a crash mid-write leaves the previous document intact.
#[derive(Debug)]
pub struct JsonFileStorage {
    path: PathBuf,
    data: tokio::sync::Mutex<StoredData>,
}

impl JsonFileStorage {
    /// Opens the document at `path`, starting empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`KlaxonError::Storage`] if the file exists but cannot be
    /// read or parsed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                KlaxonError::Storage(format!("failed to parse {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Storage file not found, starting empty");
                StoredData::default()
            }
            Err(e) => {
                return Err(KlaxonError::Storage(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };
        Ok(Self {
            path,
            data: tokio::sync::Mutex::new(data),
        })
    }

    async fn persist(&self, data: &StoredData) -> Result<()> {
        let json = serde_json::to_vec_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "Persisted storage document");
        Ok(())
    }
}

#[async_trait]
impl Storage for JsonFileStorage {
    async fn load_active_presets(&self) -> Result<Vec<Preset>> {
        Ok(self.data.lock().await.active_presets())
    }

    async fn load_gas_thresholds(&self) -> Result<Vec<(UserId, Decimal)>> {
        Ok(self.data.lock().await.gas_thresholds())
    }

    async fn create_preset(&self, preset: NewPreset) -> Result<Preset> {
        let mut data = self.data.lock().await;
        let preset = data.create_preset(preset);
        self.persist(&data).await?;
        Ok(preset)
    }

    async fn user_presets(&self, user: UserId) -> Result<Vec<Preset>> {
        Ok(self.data.lock().await.user_presets(user))
    }

    async fn set_preset_active(&self, id: PresetId, active: bool) -> Result<bool> {
        let mut data = self.data.lock().await;
        let found = data.set_preset_active(id, active);
        if found {
            self.persist(&data).await?;
        }
        Ok(found)
    }

    async fn delete_preset(&self, id: PresetId, owner: UserId) -> Result<bool> {
        let mut data = self.data.lock().await;
        let deleted = data.delete_preset(id, owner);
        if deleted {
            self.persist(&data).await?;
        }
        Ok(deleted)
    }

    async fn set_gas_threshold(&self, user: UserId, gwei: Decimal) -> Result<()> {
        let mut data = self.data.lock().await;
        data.gas_thresholds.insert(user, gwei);
        self.persist(&data).await
    }

    async fn delete_gas_threshold(&self, user: UserId) -> Result<bool> {
        let mut data = self.data.lock().await;
        let deleted = data.gas_thresholds.remove(&user).is_some();
        if deleted {
            self.persist(&data).await?;
        }
        Ok(deleted)
    }

    async fn delete_gas_threshold_if(&self, user: UserId, expected: Decimal) -> Result<bool> {
        let mut data = self.data.lock().await;
        let deleted = data.remove_gas_threshold_if(user, expected);
        if deleted {
            self.persist(&data).await?;
        }
        Ok(deleted)
    }
}

//! Pipeline orchestration.
//!
//! [`Pipeline`] owns every component, starts and stops them in order, and
//! exposes the mutation entry points a front-end calls when a user edits
//! presets or gas alerts. Each mutation writes storage first, then the
//! cache, then brings the stream set in line.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Result;
use crate::cache::{CacheStats, SubscriptionCache};
use crate::config::{AppConfig, BinanceConfig};
use crate::error::KlaxonError;
use crate::exchange::fetch_tradable_symbols;
use crate::gas::{EtherscanOracle, FeeOracle, GasMonitor, GasMonitorConfig, GasStats};
use crate::models::{
    HealthReport, NewPreset, Preset, PresetId, Priority, StreamKey, UserId, is_supported_interval,
};
use crate::processor::{CandleProcessor, ProcessorConfig, ProcessorStats};
use crate::queue::{DeliveryClient, OutboundQueue, QueueConfig, QueueStats, TelegramClient};
use crate::storage::{JsonFileStorage, MemoryStorage, Storage};
use crate::tls;
use crate::websocket::{ConnectionSettings, StreamManager, StreamStatsSnapshot, cold_start_streams};

/// Tunables of every component.
#[derive(Debug, Clone, Default)]
pub struct PipelineSettings {
    pub binance: BinanceConfig,
    pub connection: ConnectionSettings,
    pub processor: ProcessorConfig,
    pub gas: GasMonitorConfig,
    pub queue: QueueConfig,
}

/// External collaborators the pipeline talks to.
pub struct Collaborators {
    pub storage: Arc<dyn Storage>,
    pub delivery: Arc<dyn DeliveryClient>,
    pub oracle: Arc<dyn FeeOracle>,
    pub tls_config: Arc<rustls::ClientConfig>,
    pub http: reqwest::Client,
}

/// Health of every component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineHealth {
    pub healthy: bool,
    pub components: BTreeMap<&'static str, HealthReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStats {
    pub running: bool,
    pub cache: CacheStats,
    pub streams: StreamStatsSnapshot,
    pub processor: ProcessorStats,
    pub gas: GasStats,
    pub queue: QueueStats,
}

/// Components shared with the deactivation task.
struct Core {
    storage: Arc<dyn Storage>,
    cache: Arc<SubscriptionCache>,
    queue: Arc<OutboundQueue>,
    processor: Arc<CandleProcessor>,
    gas: Arc<GasMonitor>,
    streams: StreamManager,
}

impl Core {
    /// Resubscribes to whatever the cache requires now. An empty set keeps
    /// the current streams (cold-start subscriptions stay up).
    async fn refresh_streams(&self) -> Result<()> {
        if !self.streams.is_running() {
            return Ok(());
        }
        let required = self.cache.required_streams();
        if required.is_empty() {
            return Ok(());
        }
        self.streams.update_streams(&required).await
    }

    /// Handles a permanently unreachable user.
    async fn deactivate_user(&self, user: UserId) {
        let dropped = self.queue.clear_user(user);
        let presets = self.cache.deactivate_user(user);
        self.processor.forget_user(user);
        for id in &presets {
            if let Err(e) = self.storage.set_preset_active(*id, false).await {
                error!(user_id = user, preset_id = id, "Failed to persist deactivation: {e}");
            }
        }
        warn!(
            user_id = user,
            presets = presets.len(),
            dropped,
            "Deactivated unreachable user"
        );
        if let Err(e) = self.refresh_streams().await {
            warn!("Failed to update streams after deactivation: {e}");
        }
    }
}

struct Lifecycle {
    running: bool,
    cancel: CancellationToken,
    deactivations: Option<mpsc::UnboundedReceiver<UserId>>,
    consumer: Option<JoinHandle<mpsc::UnboundedReceiver<UserId>>>,
}

/// The whole alert pipeline.
pub struct Pipeline {
    core: Arc<Core>,
    binance: BinanceConfig,
    http: reqwest::Client,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl Pipeline {
    /// Builds the production pipeline from the loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if TLS, an HTTP client, or the storage document
    /// cannot be set up.
    pub async fn new(config: AppConfig) -> Result<Self> {
        let tls_config = tls::build_tls_config(config.extra_ca_pem.as_deref())?;
        let http = tls::http_client(tls_config.clone())?;

        let storage: Arc<dyn Storage> = match &config.storage_path {
            Some(path) => Arc::new(JsonFileStorage::open(path).await?),
            None => {
                warn!("KLAXON_STORAGE_PATH not set, subscriptions will not persist");
                Arc::new(MemoryStorage::new())
            }
        };
        let delivery = Arc::new(TelegramClient::new(&config.telegram, tls_config.clone())?);
        let oracle = Arc::new(EtherscanOracle::new(
            &config.etherscan,
            tls_config.clone(),
            config.gas.fetch_timeout,
        )?);

        Ok(Self::with_components(
            PipelineSettings {
                binance: config.binance,
                connection: ConnectionSettings::default(),
                processor: config.processor,
                gas: config.gas,
                queue: config.queue,
            },
            Collaborators {
                storage,
                delivery,
                oracle,
                tls_config: Arc::new(tls_config),
                http,
            },
        ))
    }

    /// Wires the components around the given collaborators.
    pub fn with_components(settings: PipelineSettings, collaborators: Collaborators) -> Self {
        let Collaborators {
            storage,
            delivery,
            oracle,
            tls_config,
            http,
        } = collaborators;

        let cache = Arc::new(SubscriptionCache::new());
        let (deactivation_tx, deactivation_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(OutboundQueue::new(settings.queue, delivery, deactivation_tx));
        let processor = Arc::new(CandleProcessor::new(
            settings.processor,
            cache.clone(),
            queue.clone(),
        ));
        let gas = Arc::new(GasMonitor::new(
            settings.gas,
            oracle,
            cache.clone(),
            storage.clone(),
            queue.clone(),
        ));
        let streams = StreamManager::with_settings(
            settings.binance.clone(),
            tls_config,
            processor.clone(),
            settings.connection,
        );

        Self {
            core: Arc::new(Core {
                storage,
                cache,
                queue,
                processor,
                gas,
                streams,
            }),
            binance: settings.binance,
            http,
            lifecycle: tokio::sync::Mutex::new(Lifecycle {
                running: false,
                cancel: CancellationToken::new(),
                deactivations: Some(deactivation_rx),
                consumer: None,
            }),
        }
    }

    pub fn cache(&self) -> &Arc<SubscriptionCache> {
        &self.core.cache
    }

    pub fn processor(&self) -> &Arc<CandleProcessor> {
        &self.core.processor
    }

    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.core.queue
    }

    pub fn gas(&self) -> &Arc<GasMonitor> {
        &self.core.gas
    }

    pub fn streams(&self) -> &StreamManager {
        &self.core.streams
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.running
    }

    /// Loads subscriptions and starts every component, delivery side first.
    ///
    /// # Errors
    ///
    /// Returns [`KlaxonError::Lifecycle`] if already running, or the error
    /// of the first component that failed to start (the ones already
    /// started are stopped again).
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.running {
            return Err(KlaxonError::Lifecycle("pipeline is already running".to_string()));
        }

        let Some(rx) = lifecycle.deactivations.take() else {
            return Err(KlaxonError::Lifecycle(
                "deactivation channel is gone".to_string(),
            ));
        };

        let core = &self.core;
        if let Err(e) = core.cache.load_from_storage(core.storage.as_ref()).await {
            lifecycle.deactivations = Some(rx);
            return Err(e);
        }
        let mut required = core.cache.required_streams();
        if required.is_empty() {
            required = self.cold_start_streams().await;
        }

        if let Err(e) = self.start_components(&required) {
            error!("Pipeline failed to start: {e}");
            self.stop_components().await;
            lifecycle.deactivations = Some(rx);
            return Err(e);
        }

        lifecycle.cancel = CancellationToken::new();
        lifecycle.consumer = Some(tokio::spawn(run_deactivations(
            core.clone(),
            rx,
            lifecycle.cancel.clone(),
        )));
        lifecycle.running = true;

        info!(streams = required.len(), stats = ?core.cache.get_stats(), "Pipeline started");
        Ok(())
    }

    fn start_components(&self, required: &BTreeSet<StreamKey>) -> Result<()> {
        let core = &self.core;
        core.queue.start()?;
        core.processor.start()?;
        core.gas.start()?;
        core.streams.start(required)
    }

    /// Subscribes to the most liquid symbols while no preset exists, so
    /// data is flowing by the time the first user shows up.
    async fn cold_start_streams(&self) -> BTreeSet<StreamKey> {
        let limit = self.binance.cold_start_symbols;
        if limit == 0 {
            return BTreeSet::new();
        }
        match fetch_tradable_symbols(&self.http, &self.binance.api_url, limit).await {
            Ok(symbols) => {
                info!(symbols = symbols.len(), "Cold start with tradable symbols");
                cold_start_streams(&symbols)
            }
            Err(e) => {
                warn!("Cold start symbol listing failed: {e}");
                BTreeSet::new()
            }
        }
    }

    /// Stops intake first, then drains toward delivery.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.running {
            return;
        }
        lifecycle.cancel.cancel();
        if let Some(consumer) = lifecycle.consumer.take() {
            match consumer.await {
                Ok(rx) => lifecycle.deactivations = Some(rx),
                Err(e) => error!("Deactivation task failed: {e}"),
            }
        }
        self.stop_components().await;
        lifecycle.running = false;
        info!("Pipeline stopped");
    }

    async fn stop_components(&self) {
        let core = &self.core;
        core.streams.stop().await;
        core.processor.stop().await;
        core.gas.stop().await;
        let flushed = core.queue.stop().await;
        info!(flushed, "Outbound queue drained");
    }

    /// Validates and persists a new preset, then subscribes to its streams.
    ///
    /// # Errors
    ///
    /// Returns [`KlaxonError::Config`] for an invalid preset, or the storage
    /// or stream error.
    pub async fn create_preset(&self, preset: NewPreset) -> Result<Preset> {
        validate_preset(&preset)?;
        let owner = preset.owner_user_id;
        let preset = self.core.storage.create_preset(preset).await?;
        self.core.cache.add_preset(preset.clone());
        self.core.queue.unblock_user(owner);
        info!(preset_id = preset.id, user_id = owner, "Preset created");
        self.core.refresh_streams().await?;
        Ok(preset)
    }

    /// Deletes one of `owner`'s presets. Returns `false` if it does not
    /// exist or belongs to someone else.
    ///
    /// # Errors
    ///
    /// Returns the storage or stream error.
    pub async fn delete_preset(&self, owner: UserId, id: PresetId) -> Result<bool> {
        if !self.core.storage.delete_preset(id, owner).await? {
            return Ok(false);
        }
        self.core.cache.remove_preset(id);
        info!(preset_id = id, user_id = owner, "Preset deleted");
        self.core.refresh_streams().await?;
        Ok(true)
    }

    /// Toggles one of `owner`'s presets. Returns `false` if it does not
    /// exist or belongs to someone else.
    ///
    /// # Errors
    ///
    /// Returns the storage or stream error.
    pub async fn set_preset_active(&self, owner: UserId, id: PresetId, active: bool) -> Result<bool> {
        let owned = self.core.storage.user_presets(owner).await?;
        let Some(mut preset) = owned.into_iter().find(|p| p.id == id) else {
            return Ok(false);
        };
        if !self.core.storage.set_preset_active(id, active).await? {
            return Ok(false);
        }
        preset.active = active;
        self.core.cache.add_preset(preset);
        if active {
            self.core.queue.unblock_user(owner);
        }
        info!(preset_id = id, user_id = owner, active, "Preset toggled");
        self.core.refresh_streams().await?;
        Ok(true)
    }

    /// Arms a one-shot gas alert, replacing the user's previous one.
    ///
    /// # Errors
    ///
    /// Returns [`KlaxonError::Config`] for a non-positive threshold, or the
    /// storage error.
    pub async fn set_gas_alert(&self, user: UserId, gwei: Decimal) -> Result<Option<Decimal>> {
        if gwei <= Decimal::ZERO {
            return Err(KlaxonError::Config(format!(
                "gas threshold must be positive, got {gwei}"
            )));
        }
        self.core.storage.set_gas_threshold(user, gwei).await?;
        let previous = self.core.gas.add_threshold(user, gwei);
        self.core.queue.unblock_user(user);
        info!(user_id = user, gwei = %gwei, "Gas alert armed");
        Ok(previous)
    }

    /// Returns `false` if the user had no gas alert.
    ///
    /// # Errors
    ///
    /// Returns the storage error.
    pub async fn remove_gas_alert(&self, user: UserId) -> Result<bool> {
        let existed = self.core.storage.delete_gas_threshold(user).await?;
        let cached = self.core.gas.remove_threshold(user).is_some();
        Ok(existed || cached)
    }

    /// Queues a free-form message (command replies and the like).
    pub fn enqueue_message(&self, user: UserId, text: impl Into<String>, priority: Priority) -> bool {
        self.core.queue.enqueue_message(user, text, priority)
    }

    /// Rebuilds the cache and gas thresholds from storage.
    ///
    /// # Errors
    ///
    /// Returns the storage or stream error; on a storage error the cache is
    /// left as it was.
    pub async fn reload_subscriptions(&self) -> Result<()> {
        self.core
            .cache
            .load_from_storage(self.core.storage.as_ref())
            .await?;
        self.core.gas.reload_thresholds();
        self.core.refresh_streams().await
    }

    pub async fn health_check(&self) -> PipelineHealth {
        let core = &self.core;
        let mut components = BTreeMap::new();
        components.insert("streams", core.streams.health_check());
        components.insert("processor", core.processor.health_check());
        components.insert("gas", core.gas.health_check());
        components.insert("queue", core.queue.health_check());
        if !self.is_running().await {
            components.insert(
                "pipeline",
                HealthReport::from_issues(vec!["pipeline is not running".to_string()]),
            );
        }
        PipelineHealth {
            healthy: components.values().all(|r| r.healthy),
            components,
        }
    }

    pub async fn stats(&self) -> PipelineStats {
        let core = &self.core;
        PipelineStats {
            running: self.is_running().await,
            cache: core.cache.get_stats(),
            streams: core.streams.get_stats(),
            processor: core.processor.get_stats(),
            gas: core.gas.get_stats(),
            queue: core.queue.get_stats(),
        }
    }
}

fn validate_preset(preset: &NewPreset) -> Result<()> {
    if preset.threshold_percent <= Decimal::ZERO {
        return Err(KlaxonError::Config(format!(
            "threshold must be positive, got {}",
            preset.threshold_percent
        )));
    }
    if preset.symbols.is_empty() || preset.symbols.iter().any(|s| s.trim().is_empty()) {
        return Err(KlaxonError::Config("preset needs at least one symbol".to_string()));
    }
    if preset.intervals.is_empty() {
        return Err(KlaxonError::Config("preset needs at least one interval".to_string()));
    }
    if let Some(bad) = preset.intervals.iter().find(|i| !is_supported_interval(i)) {
        return Err(KlaxonError::Config(format!("unsupported interval {bad}")));
    }
    Ok(())
}

/// Consumes deactivation signals until cancelled, then hands the receiver
/// back so a restart can resume it.
async fn run_deactivations(
    core: Arc<Core>,
    mut rx: mpsc::UnboundedReceiver<UserId>,
    cancel: CancellationToken,
) -> mpsc::UnboundedReceiver<UserId> {
    loop {
        let user = tokio::select! {
            () = cancel.cancelled() => break,
            user = rx.recv() => match user {
                Some(user) => user,
                None => break,
            },
        };
        core.deactivate_user(user).await;
    }
    rx
}

//! Shared test utilities: scripted collaborators and pipeline fixtures.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use klaxon::app::{Collaborators, Pipeline, PipelineSettings};
use klaxon::config::BinanceConfig;
use klaxon::gas::FeeOracle;
use klaxon::models::{Candle, NewPreset, Priority, UserId};
use klaxon::queue::{DeliveryClient, QueueConfig, SendOutcome};
use klaxon::storage::{MemoryStorage, Storage};
use klaxon::{KlaxonError, Result};
use parking_lot::Mutex;
use rust_decimal::Decimal;

/// Binance USDⓈ-M futures combined-stream endpoint.
pub const BINANCE_WS_URL: &str = "wss://fstream.binance.com/stream";

pub const BINANCE_API_URL: &str = "https://fapi.binance.com";

/// Nothing listens here; stream groups just cycle through backoff.
pub const UNREACHABLE_WS_URL: &str = "ws://127.0.0.1:9/stream";

pub fn test_tls_config() -> Arc<rustls::ClientConfig> {
    Arc::new(klaxon::tls::build_tls_config(None).expect("failed to build TLS config"))
}

/// Records every message; users in `blocked` get a permanent failure.
#[derive(Default)]
pub struct RecordingClient {
    sent: Mutex<Vec<(UserId, String)>>,
    blocked: Mutex<HashSet<UserId>>,
}

impl RecordingClient {
    pub fn block(&self, user: UserId) {
        self.blocked.lock().insert(user);
    }

    pub fn sent(&self) -> Vec<(UserId, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DeliveryClient for RecordingClient {
    async fn send(&self, user_id: UserId, text: &str, _priority: Priority) -> SendOutcome {
        if self.blocked.lock().contains(&user_id) {
            return SendOutcome::Permanent("Forbidden: bot was blocked by the user".to_string());
        }
        self.sent.lock().push((user_id, text.to_string()));
        SendOutcome::Delivered
    }
}

/// Returns scripted prices in order; `None` or an empty script fails.
#[derive(Default)]
pub struct ScriptedOracle {
    prices: Mutex<VecDeque<Option<Decimal>>>,
}

impl ScriptedOracle {
    pub fn new(prices: impl IntoIterator<Item = Option<Decimal>>) -> Self {
        Self {
            prices: Mutex::new(prices.into_iter().collect()),
        }
    }
}

#[async_trait]
impl FeeOracle for ScriptedOracle {
    async fn current_gwei(&self) -> Result<Decimal> {
        self.prices
            .lock()
            .pop_front()
            .flatten()
            .ok_or_else(|| KlaxonError::Oracle("scripted failure".to_string()))
    }
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub storage: Arc<dyn Storage>,
    pub client: Arc<RecordingClient>,
}

/// A pipeline wired to in-process collaborators, with a fast queue tick
/// and no cold-start symbol listing.
pub fn harness(storage: Arc<dyn Storage>, oracle: ScriptedOracle) -> Harness {
    let client = Arc::new(RecordingClient::default());
    let settings = PipelineSettings {
        binance: BinanceConfig {
            websocket_url: UNREACHABLE_WS_URL.to_string(),
            cold_start_symbols: 0,
            ..BinanceConfig::default()
        },
        queue: QueueConfig {
            tick_interval: Duration::from_millis(20),
            ..QueueConfig::default()
        },
        ..PipelineSettings::default()
    };
    let tls_config = test_tls_config();
    let http = klaxon::tls::http_client((*tls_config).clone()).expect("failed to build HTTP client");
    let pipeline = Pipeline::with_components(
        settings,
        Collaborators {
            storage: storage.clone(),
            delivery: client.clone(),
            oracle: Arc::new(oracle),
            tls_config,
            http,
        },
    );
    Harness {
        pipeline,
        storage,
        client,
    }
}

pub fn memory_harness() -> Harness {
    harness(Arc::new(MemoryStorage::new()), ScriptedOracle::default())
}

pub fn new_preset(owner: UserId, symbols: &[&str], intervals: &[&str], threshold: Decimal) -> NewPreset {
    NewPreset {
        owner_user_id: owner,
        name: format!("preset-{owner}"),
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        intervals: intervals.iter().map(|s| s.to_string()).collect(),
        threshold_percent: threshold,
    }
}

pub fn closed_candle(symbol: &str, interval: &str, open: Decimal, close: Decimal) -> Candle {
    Candle {
        symbol: symbol.to_string(),
        interval: interval.to_string(),
        open,
        close,
        high: open.max(close),
        low: open.min(close),
        volume: Decimal::ONE,
        close_time: 1_700_000_059_999,
        is_closed: true,
    }
}

/// Polls `condition` every 10 ms until it holds or five seconds pass.
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

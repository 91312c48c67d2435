//! Application configuration loaded from environment variables.
//!
//! Secrets **must** be provided via environment variables (or the OS
//! keychain, see [`crate::credentials`]):
//! - `TELEGRAM_BOT_TOKEN` (token of the delivery bot)
//! - `ETHERSCAN_API_KEY` (key for the gas fee oracle)
//!
//! Everything else has a default and can be overridden:
//! `BINANCE_WS_URL`, `BINANCE_API_URL`, `MAX_STREAMS_PER_CONNECTION`,
//! `COLD_START_SYMBOLS`, `TELEGRAM_API_URL`, `ETHERSCAN_API_URL`,
//! `GAS_CHECK_INTERVAL_SECS`, `KLAXON_STORAGE_PATH`, `KLAXON_EXTRA_CA_PEM`,
//! `PROCESSOR_WORKERS`, `CANDLE_QUEUE_SIZE`, `DEDUP_WINDOW_SECS`,
//! `TELEGRAM_RATE_LIMIT`, `USER_RATE_LIMIT`, `ALERT_BATCH_SIZE`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use zeroize::Zeroizing;

use crate::error::KlaxonError;
use crate::gas::GasMonitorConfig;
use crate::processor::ProcessorConfig;
use crate::queue::QueueConfig;

/// Default combined-stream WebSocket endpoint (USDⓈ-M futures).
const DEFAULT_BINANCE_WS_URL: &str = "wss://fstream.binance.com/stream";

/// Default REST endpoint used to list tradable symbols.
const DEFAULT_BINANCE_API_URL: &str = "https://fapi.binance.com";

const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";

const DEFAULT_ETHERSCAN_API_URL: &str = "https://api.etherscan.io/api";

/// Exchange-imposed cap on streams per combined connection.
const DEFAULT_MAX_STREAMS_PER_CONNECTION: usize = 1024;

/// Symbols subscribed at cold start, before any preset exists.
const DEFAULT_COLD_START_SYMBOLS: usize = 400;

/// Top-level application configuration.
#[derive(Debug)]
pub struct AppConfig {
    pub binance: BinanceConfig,
    pub telegram: TelegramConfig,
    pub etherscan: EtherscanConfig,
    /// JSON storage document; in-memory storage when unset.
    pub storage_path: Option<PathBuf>,
    /// Extra PEM bundle of root certificates to trust.
    pub extra_ca_pem: Option<PathBuf>,
    pub processor: ProcessorConfig,
    pub gas: GasMonitorConfig,
    pub queue: QueueConfig,
}

/// Market-data source settings.
#[derive(Debug, Clone)]
pub struct BinanceConfig {
    pub websocket_url: String,
    pub api_url: String,
    pub max_streams_per_connection: usize,
    pub cold_start_symbols: usize,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            websocket_url: DEFAULT_BINANCE_WS_URL.to_string(),
            api_url: DEFAULT_BINANCE_API_URL.to_string(),
            max_streams_per_connection: DEFAULT_MAX_STREAMS_PER_CONNECTION,
            cold_start_symbols: DEFAULT_COLD_START_SYMBOLS,
        }
    }
}

/// Delivery channel settings.
pub struct TelegramConfig {
    pub bot_token: Zeroizing<String>,
    pub api_url: String,
}

impl fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &"<redacted>")
            .field("api_url", &self.api_url)
            .finish()
    }
}

/// Fee oracle settings.
pub struct EtherscanConfig {
    pub api_key: Zeroizing<String>,
    pub api_url: String,
}

impl fmt::Debug for EtherscanConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtherscanConfig")
            .field("api_key", &"<redacted>")
            .field("api_url", &self.api_url)
            .finish()
    }
}

/// Loads the application configuration from environment variables.
///
/// # Errors
///
/// Returns [`KlaxonError::Config`] if a required secret is missing or a
/// numeric override cannot be parsed.
pub fn fetch_config() -> crate::Result<AppConfig> {
    config_from(|name| std::env::var(name).ok())
}

/// Builds the configuration from an arbitrary variable lookup.
///
/// Empty values are treated as absent.
pub fn config_from<F>(lookup: F) -> crate::Result<AppConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |name: &str| lookup(name).filter(|s| !s.is_empty());

    let bot_token = var("TELEGRAM_BOT_TOKEN")
        .ok_or_else(|| KlaxonError::Config("TELEGRAM_BOT_TOKEN is missing".to_string()))?;
    let api_key = var("ETHERSCAN_API_KEY")
        .ok_or_else(|| KlaxonError::Config("ETHERSCAN_API_KEY is missing".to_string()))?;

    let binance_defaults = BinanceConfig::default();
    let binance = BinanceConfig {
        websocket_url: var("BINANCE_WS_URL").unwrap_or(binance_defaults.websocket_url),
        api_url: var("BINANCE_API_URL").unwrap_or(binance_defaults.api_url),
        max_streams_per_connection: parse_or(
            &var,
            "MAX_STREAMS_PER_CONNECTION",
            binance_defaults.max_streams_per_connection,
        )?,
        cold_start_symbols: parse_or(
            &var,
            "COLD_START_SYMBOLS",
            binance_defaults.cold_start_symbols,
        )?,
    };
    if binance.max_streams_per_connection == 0 {
        return Err(KlaxonError::Config(
            "MAX_STREAMS_PER_CONNECTION must be positive".to_string(),
        ));
    }

    let mut processor = ProcessorConfig::default();
    processor.workers = parse_or(&var, "PROCESSOR_WORKERS", processor.workers)?.max(1);
    processor.queue_capacity = parse_or(&var, "CANDLE_QUEUE_SIZE", processor.queue_capacity)?;
    processor.dedup_window = Duration::from_secs(parse_or(
        &var,
        "DEDUP_WINDOW_SECS",
        processor.dedup_window.as_secs(),
    )?);

    let mut gas = GasMonitorConfig::default();
    gas.poll_interval = Duration::from_secs(parse_or(
        &var,
        "GAS_CHECK_INTERVAL_SECS",
        gas.poll_interval.as_secs(),
    )?);
    if gas.poll_interval.is_zero() {
        return Err(KlaxonError::Config(
            "GAS_CHECK_INTERVAL_SECS must be positive".to_string(),
        ));
    }
    // Keep the oracle timeout below the poll interval.
    gas.fetch_timeout = gas.fetch_timeout.min(gas.poll_interval / 2);

    let mut queue = QueueConfig::default();
    queue.limits.global_max = parse_or(&var, "TELEGRAM_RATE_LIMIT", queue.limits.global_max)?;
    queue.limits.per_user_max = parse_or(&var, "USER_RATE_LIMIT", queue.limits.per_user_max)?;
    queue.max_alerts_per_message =
        parse_or(&var, "ALERT_BATCH_SIZE", queue.max_alerts_per_message)?.max(1);

    Ok(AppConfig {
        binance,
        telegram: TelegramConfig {
            bot_token: Zeroizing::new(bot_token),
            api_url: var("TELEGRAM_API_URL").unwrap_or_else(|| DEFAULT_TELEGRAM_API_URL.to_string()),
        },
        etherscan: EtherscanConfig {
            api_key: Zeroizing::new(api_key),
            api_url: var("ETHERSCAN_API_URL")
                .unwrap_or_else(|| DEFAULT_ETHERSCAN_API_URL.to_string()),
        },
        storage_path: var("KLAXON_STORAGE_PATH").map(PathBuf::from),
        extra_ca_pem: var("KLAXON_EXTRA_CA_PEM").map(PathBuf::from),
        processor,
        gas,
        queue,
    })
}

/// Parses `name` if set, otherwise returns `default`.
fn parse_or<T, F>(var: &F, name: &str, default: T) -> crate::Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| KlaxonError::Config(format!("{name}={raw:?} is invalid: {e}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> crate::Result<AppConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config_from(|name| map.get(name).cloned())
    }

    const SECRETS: [(&str, &str); 2] = [
        ("TELEGRAM_BOT_TOKEN", "123:abc"),
        ("ETHERSCAN_API_KEY", "etherscan-key"),
    ];

    #[test]
    fn defaults_with_only_secrets() {
        let config = load(&SECRETS).unwrap();
        assert_eq!(config.binance.websocket_url, DEFAULT_BINANCE_WS_URL);
        assert_eq!(config.binance.max_streams_per_connection, 1024);
        assert_eq!(config.telegram.bot_token.as_str(), "123:abc");
        assert_eq!(config.etherscan.api_url, DEFAULT_ETHERSCAN_API_URL);
        assert!(config.storage_path.is_none());
        assert_eq!(config.gas.poll_interval, Duration::from_secs(60));
        assert!(config.gas.fetch_timeout < config.gas.poll_interval);
    }

    #[test]
    fn rejects_missing_bot_token() {
        let err = load(&[("ETHERSCAN_API_KEY", "k")]).unwrap_err();
        assert!(err.to_string().contains("TELEGRAM_BOT_TOKEN is missing"));
    }

    #[test]
    fn rejects_missing_etherscan_key() {
        let err = load(&[("TELEGRAM_BOT_TOKEN", "t")]).unwrap_err();
        assert!(err.to_string().contains("ETHERSCAN_API_KEY is missing"));
    }

    #[test]
    fn empty_values_treated_as_absent() {
        let mut vars = SECRETS.to_vec();
        vars.push(("BINANCE_WS_URL", ""));
        vars.push(("KLAXON_STORAGE_PATH", ""));
        let config = load(&vars).unwrap();
        assert_eq!(config.binance.websocket_url, DEFAULT_BINANCE_WS_URL);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn numeric_overrides_apply() {
        let mut vars = SECRETS.to_vec();
        vars.extend([
            ("MAX_STREAMS_PER_CONNECTION", "200"),
            ("PROCESSOR_WORKERS", "8"),
            ("DEDUP_WINDOW_SECS", "30"),
            ("GAS_CHECK_INTERVAL_SECS", "12"),
            ("TELEGRAM_RATE_LIMIT", "25"),
            ("ALERT_BATCH_SIZE", "5"),
        ]);
        let config = load(&vars).unwrap();
        assert_eq!(config.binance.max_streams_per_connection, 200);
        assert_eq!(config.processor.workers, 8);
        assert_eq!(config.processor.dedup_window, Duration::from_secs(30));
        assert_eq!(config.gas.poll_interval, Duration::from_secs(12));
        assert_eq!(config.gas.fetch_timeout, Duration::from_secs(6));
        assert_eq!(config.queue.limits.global_max, 25);
        assert_eq!(config.queue.max_alerts_per_message, 5);
    }

    #[test]
    fn invalid_number_is_config_error() {
        let mut vars = SECRETS.to_vec();
        vars.push(("CANDLE_QUEUE_SIZE", "lots"));
        let err = load(&vars).unwrap_err();
        assert!(matches!(err, KlaxonError::Config(_)));
        assert!(err.to_string().contains("CANDLE_QUEUE_SIZE"));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = load(&SECRETS).unwrap();
        let printed = format!("{config:?}");
        assert!(!printed.contains("123:abc"));
        assert!(!printed.contains("etherscan-key"));
    }
}

//! Crypto alert pipeline.
//!
//! Watches Binance kline streams for the (symbol, interval) pairs users
//! subscribed to through presets, matches closed candles against each
//! preset's percent threshold, tracks the Ethereum gas price against
//! one-shot gwei thresholds, and delivers the resulting alerts through a
//! rate-limited Telegram queue.

pub mod app;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod dedup;
pub mod error;
pub mod exchange;
pub mod gas;
pub mod models;
pub mod processor;
pub mod queue;
pub mod rate_limiter;
pub mod storage;
pub mod tls;
pub mod websocket;

pub use app::Pipeline;
pub use error::{KlaxonError, Result};

//! Gas price samples and the fee oracle's wire format.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One observation of the network's gas price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GasPriceSample {
    pub timestamp: DateTime<Utc>,
    pub price_gwei: Decimal,
}

/// Response of the `gastracker/gasoracle` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct GasOracleResponse {
    pub status: String,
    pub message: String,
    pub result: serde_json::Value,
}

/// The `result` object of a successful [`GasOracleResponse`].
#[derive(Debug, Clone, Deserialize)]
pub struct GasOracleResult {
    #[serde(rename = "SafeGasPrice")]
    pub safe_gas_price: Decimal,
    #[serde(rename = "ProposeGasPrice")]
    pub propose_gas_price: Decimal,
    #[serde(rename = "FastGasPrice")]
    pub fast_gas_price: Decimal,
}

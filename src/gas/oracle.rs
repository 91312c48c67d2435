//! Fee oracle collaborator and the Etherscan gas tracker client.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::debug;
use zeroize::Zeroizing;

use crate::Result;
use crate::config::EtherscanConfig;
use crate::error::KlaxonError;
use crate::models::gas::{GasOracleResponse, GasOracleResult};

/// Returns the network's current gas price.
#[async_trait]
pub trait FeeOracle: Send + Sync {
    async fn current_gwei(&self) -> Result<Decimal>;
}

/// Extracts the safe gas price from a gas-oracle response.
///
/// # Errors
///
/// Returns [`KlaxonError::Oracle`] if the API reported an error or the
/// price is not positive.
pub fn parse_gas_oracle(response: GasOracleResponse) -> Result<Decimal> {
    if response.status != "1" {
        return Err(KlaxonError::Oracle(format!(
            "{}: {}",
            response.message, response.result
        )));
    }
    let result: GasOracleResult = serde_json::from_value(response.result)
        .map_err(|e| KlaxonError::Oracle(format!("unexpected gas oracle result: {e}")))?;
    if result.safe_gas_price <= Decimal::ZERO {
        return Err(KlaxonError::Oracle(format!(
            "non-positive gas price {}",
            result.safe_gas_price
        )));
    }
    Ok(result.safe_gas_price)
}

/// `gastracker/gasoracle` client.
pub struct EtherscanOracle {
    http: reqwest::Client,
    api_url: String,
    api_key: Zeroizing<String>,
}

impl fmt::Debug for EtherscanOracle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtherscanOracle")
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}

impl EtherscanOracle {
    /// Builds the client with its own request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`KlaxonError::Tls`] if the HTTP client cannot be built.
    pub fn new(
        config: &EtherscanConfig,
        tls_config: rustls::ClientConfig,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .use_preconfigured_tls(tls_config)
            .timeout(timeout)
            .build()
            .map_err(|e| KlaxonError::Tls(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl FeeOracle for EtherscanOracle {
    async fn current_gwei(&self) -> Result<Decimal> {
        // The query string carries the API key, so errors are stripped of
        // their URL before they reach a log line.
        let response: GasOracleResponse = self
            .http
            .get(&self.api_url)
            .query(&[
                ("module", "gastracker"),
                ("action", "gasoracle"),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| KlaxonError::Oracle(e.without_url().to_string()))?
            .json()
            .await
            .map_err(|e| KlaxonError::Oracle(e.without_url().to_string()))?;

        let price = parse_gas_oracle(response)?;
        debug!(gwei = %price, "Fetched gas price");
        Ok(price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn response(json: &str) -> GasOracleResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn reads_safe_gas_price() {
        let body = response(
            r#"{"status":"1","message":"OK","result":{"LastBlock":"19000000","SafeGasPrice":"18.5","ProposeGasPrice":"19","FastGasPrice":"21","suggestBaseFee":"17.9","gasUsedRatio":"0.4"}}"#,
        );
        assert_eq!(parse_gas_oracle(body).unwrap(), dec!(18.5));
    }

    #[test]
    fn api_error_is_reported() {
        let body = response(r#"{"status":"0","message":"NOTOK","result":"Invalid API Key"}"#);
        let err = parse_gas_oracle(body).unwrap_err();
        assert!(matches!(err, KlaxonError::Oracle(_)));
        assert!(err.to_string().contains("Invalid API Key"));
    }

    #[test]
    fn zero_price_is_rejected() {
        let body = response(
            r#"{"status":"1","message":"OK","result":{"SafeGasPrice":"0","ProposeGasPrice":"0","FastGasPrice":"0"}}"#,
        );
        assert!(parse_gas_oracle(body).is_err());
    }
}

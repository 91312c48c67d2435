//! REST helpers for the market-data source.

use serde::Deserialize;
use tracing::info;

use crate::Result;

/// Response of `GET /fapi/v1/exchangeInfo` (only the fields we use).
#[derive(Debug, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

/// One listed contract.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    pub status: String,
    #[serde(default)]
    pub contract_type: Option<String>,
    #[serde(default)]
    pub quote_asset: Option<String>,
}

impl SymbolInfo {
    /// USDT-margined perpetuals that are currently trading.
    pub fn is_tradable_usdt_perpetual(&self) -> bool {
        self.status == "TRADING"
            && self.contract_type.as_deref().unwrap_or("PERPETUAL") == "PERPETUAL"
            && self
                .quote_asset
                .as_deref()
                .map_or_else(|| self.symbol.ends_with("USDT"), |q| q == "USDT")
    }
}

/// Extracts tradable symbols from an exchange-info document, keeping at
/// most `limit` in listing order.
pub fn tradable_symbols(info: &ExchangeInfo, limit: usize) -> Vec<String> {
    info.symbols
        .iter()
        .filter(|s| s.is_tradable_usdt_perpetual())
        .map(|s| s.symbol.clone())
        .take(limit)
        .collect()
}

/// Lists tradable symbols from the exchange's REST endpoint.
///
/// # Errors
///
/// Returns a [`KlaxonError`](crate::KlaxonError) if the request fails or
/// the body cannot be parsed.
pub async fn fetch_tradable_symbols(
    client: &reqwest::Client,
    api_url: &str,
    limit: usize,
) -> Result<Vec<String>> {
    let url = format!("{}/fapi/v1/exchangeInfo", api_url.trim_end_matches('/'));
    let info: ExchangeInfo = client
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let symbols = tradable_symbols(&info, limit);
    info!(count = symbols.len(), "Retrieved tradable symbols");
    Ok(symbols)
}

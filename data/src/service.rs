//! Typed client for the external symbol / market-data HTTP service.
//!
//! Every endpoint wraps its payload in the [`BaseReturn`] envelope
//! (`status: "OK" | "NOTOK"`). Calls retry up to [`SERVICE_MAX_ATTEMPTS`]
//! before surfacing the last error.

use crate::{error::DataError, ticker::lenient};
use arara_markets::{BaseAsset, ExchangeId, QuoteAsset, SymbolSpec};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use smol_str::SmolStr;
use std::time::Duration;
use tracing::warn;

/// Attempts per service call before the error is surfaced.
pub const SERVICE_MAX_ATTEMPTS: u32 = 5;

/// Delay between attempts.
pub const SERVICE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Response envelope used by every service endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BaseReturn<T> {
    pub status: ServiceStatus,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, rename = "timeProfile")]
    pub time_profile: Option<TimeProfile>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum ServiceStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "NOTOK")]
    NotOk,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeProfile {
    #[serde(default)]
    pub exchange_request_end_time: Option<i64>,
}

/// The two service reads the engine depends on. Kept narrow so tests and the
/// symbol cache can substitute fakes.
#[async_trait]
pub trait MarketApi: Send + Sync + 'static {
    async fn symbol(&self, symbol: &str, exchange: ExchangeId) -> Result<SymbolSpec, DataError>;

    async fn latest_price(&self, symbol: &str, exchange: ExchangeId)
        -> Result<Decimal, DataError>;
}

/// Reqwest-backed [`MarketApi`] implementation.
#[derive(Debug, Clone)]
pub struct MarketService {
    http: reqwest::Client,
    base_url: String,
}

impl MarketService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// All symbols listed on a venue.
    pub async fn all_symbols(&self, exchange: ExchangeId) -> Result<Vec<SymbolSpec>, DataError> {
        let payloads: Vec<SymbolPayload> = self
            .get("exchange/all", &[("exchange", exchange.as_str())])
            .await?;
        Ok(payloads.into_iter().map(SymbolPayload::into_spec).collect())
    }

    /// Raw candle data, passed through untyped (reference surface).
    pub async fn candles(
        &self,
        query: &[(&str, &str)],
    ) -> Result<serde_json::Value, DataError> {
        self.get("candles", query).await
    }

    /// Raw recent trades, passed through untyped (reference surface).
    pub async fn trades(&self, query: &[(&str, &str)]) -> Result<serde_json::Value, DataError> {
        self.get("trades", query).await
    }

    /// Raw multi-symbol prices, passed through untyped (reference surface).
    pub async fn prices(&self, query: &[(&str, &str)]) -> Result<serde_json::Value, DataError> {
        self.get("prices", query).await
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, DataError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let mut last_error = DataError::Transport("no attempt made".to_string());

        for attempt in 1..=SERVICE_MAX_ATTEMPTS {
            match self.attempt::<T>(&url, query).await {
                Ok(data) => return Ok(data),
                Err(error) => {
                    warn!(%url, attempt, %error, "market-data service call failed");
                    last_error = error;
                    if attempt < SERVICE_MAX_ATTEMPTS {
                        tokio::time::sleep(SERVICE_RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn attempt<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, DataError> {
        let envelope: BaseReturn<T> = self
            .http
            .get(url)
            .query(query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match envelope.status {
            ServiceStatus::Ok => envelope
                .data
                .ok_or_else(|| DataError::MissingData(url.to_string())),
            ServiceStatus::NotOk => Err(DataError::Service(
                envelope.reason.unwrap_or_else(|| "no reason".to_string()),
            )),
        }
    }
}

#[async_trait]
impl MarketApi for MarketService {
    async fn symbol(&self, symbol: &str, exchange: ExchangeId) -> Result<SymbolSpec, DataError> {
        let payload: SymbolPayload = self
            .get(
                "exchange",
                &[("symbol", symbol), ("exchange", exchange.as_str())],
            )
            .await?;
        Ok(payload.into_spec())
    }

    async fn latest_price(
        &self,
        symbol: &str,
        exchange: ExchangeId,
    ) -> Result<Decimal, DataError> {
        let payload: LatestPricePayload = self
            .get(
                "latestPrice",
                &[("symbol", symbol), ("exchange", exchange.as_str())],
            )
            .await?;
        Ok(payload.price)
    }
}

/// Wire shape of a symbol record.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct SymbolPayload {
    pair: SmolStr,
    exchange: ExchangeId,
    base_asset: BaseAssetPayload,
    quote_asset: QuoteAssetPayload,
    price_asset_precision: u32,
    #[serde(default)]
    max_orders: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct BaseAssetPayload {
    name: SmolStr,
    #[serde(with = "lenient")]
    min_amount: Decimal,
    #[serde(with = "lenient")]
    step: Decimal,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct QuoteAssetPayload {
    name: SmolStr,
    #[serde(with = "lenient")]
    min_amount: Decimal,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct LatestPricePayload {
    #[serde(with = "lenient")]
    price: Decimal,
}

impl SymbolPayload {
    fn into_spec(self) -> SymbolSpec {
        SymbolSpec {
            pair: self.pair,
            exchange: self.exchange,
            base: BaseAsset {
                name: self.base_asset.name,
                min_amount: self.base_asset.min_amount,
                step: self.base_asset.step,
            },
            quote: QuoteAsset {
                name: self.quote_asset.name,
                min_amount: self.quote_asset.min_amount,
            },
            price_precision: self.price_asset_precision,
            max_orders: self.max_orders.unwrap_or(u32::MAX),
        }
    }
}

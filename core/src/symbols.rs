//! TTL cache over the external symbol service.
//!
//! Symbol parameters are immutable per retrieval; entries refresh after
//! [`SYMBOL_TTL`]. Callers receive an owned snapshot and must not hold it
//! across suspension points beyond one request.

use crate::error::EngineError;
use arara_data::{error::DataError, service::MarketApi, FnvIndexMap};
use arara_markets::{ExchangeId, SymbolSpec};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Cached symbol entries refresh after this long.
pub const SYMBOL_TTL: Duration = Duration::from_secs(3 * 60 * 60);

pub struct SymbolCache {
    api: Arc<dyn MarketApi>,
    entries: RwLock<FnvIndexMap<(String, ExchangeId), CachedSymbol>>,
}

impl fmt::Debug for SymbolCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolCache")
            .field("entries", &self.entries.read().len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct CachedSymbol {
    spec: SymbolSpec,
    fetched_at: DateTime<Utc>,
}

impl SymbolCache {
    pub fn new(api: Arc<dyn MarketApi>) -> Self {
        Self {
            api,
            entries: RwLock::new(FnvIndexMap::default()),
        }
    }

    /// Snapshot of the symbol's parameters, refreshed on miss or expiry.
    pub async fn get(
        &self,
        symbol: &str,
        exchange: ExchangeId,
    ) -> Result<SymbolSpec, EngineError> {
        let ttl = ChronoDuration::seconds(SYMBOL_TTL.as_secs() as i64);
        {
            let entries = self.entries.read();
            if let Some(cached) = entries.get(&(symbol.to_string(), exchange)) {
                if cached.fetched_at + ttl >= Utc::now() {
                    return Ok(cached.spec.clone());
                }
            }
        }

        let spec = self
            .api
            .symbol(symbol, exchange)
            .await
            .map_err(|error| match error {
                DataError::Service(_) | DataError::MissingData(_) => {
                    EngineError::SymbolNotFound(format!("{symbol}@{exchange}"))
                }
                other => EngineError::MarketData(other),
            })?;

        self.entries.write().insert(
            (symbol.to_string(), exchange),
            CachedSymbol {
                spec: spec.clone(),
                fetched_at: Utc::now(),
            },
        );
        Ok(spec)
    }
}

//! The matching and settlement engine.
//!
//! [`Engine`] owns all process-local state (the projection of open orders
//! and positions, the watch set, the price cache view, and the named-lock
//! manager) and holds handles to its collaborators: durable storage, the
//! push channel, the market-data service, and the feed subscription handle.
//!
//! Operations are spread over the submodules the way they are serialized:
//! [`create`] and [`cancel`] for the client-facing order lifecycle,
//! [`matching`] for the per-exchange tick path, [`settle`] for balance and
//! position transitions, [`liquidate`] for forced closes, and [`reconcile`]
//! for the startup rebuild.

use crate::{
    error::EngineError,
    lock::NamedLocks,
    order::Order,
    projection::Projection,
    push::{BalanceSnapshot, PushChannel, PushEvent, PushTopic},
    storage::Storage,
    symbols::SymbolCache,
    watch::WatchSet,
    UserId,
};
use arara_data::{
    feed::{FeedHandle, MarketChannel},
    intake::PriceCache,
    service::MarketApi,
};
use arara_markets::ExchangeId;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use smol_str::SmolStr;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// User account operations: leverage, hedge mode, and read queries.
pub mod account;

/// `cancel_order` and the shared expire path.
pub mod cancel;

/// `create_order`: validation, marketable-limit promotion, booking.
pub mod create;

/// Forced position closes and their synthetic market orders.
pub mod liquidate;

/// Per-exchange tick-batch scan: liquidations, then limit fills.
pub mod matching;

/// Startup reconciliation: projection rebuild, locked-balance drift
/// correction, leverage backfill.
pub mod reconcile;

/// Spot and derivatives settlement transitions.
pub mod settle;

pub use cancel::{CancelRequest, CancelTarget};
pub use create::OrderRequest;

/// The engine. Cheap to clone; all state lives behind the shared inner.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    storage: Arc<dyn Storage>,
    push: Arc<dyn PushChannel>,
    symbols: SymbolCache,
    api: Arc<dyn MarketApi>,
    prices: PriceCache,
    feed: FeedHandle,
    projection: RwLock<Projection>,
    watch: Mutex<WatchSet>,
    locks: NamedLocks,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("symbols", &self.inner.symbols)
            .field("locks", &self.inner.locks)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        storage: Arc<dyn Storage>,
        push: Arc<dyn PushChannel>,
        api: Arc<dyn MarketApi>,
        prices: PriceCache,
        feed: FeedHandle,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                storage,
                push,
                symbols: SymbolCache::new(Arc::clone(&api)),
                api,
                prices,
                feed,
                projection: RwLock::new(Projection::new()),
                watch: Mutex::new(WatchSet::new()),
                locks: NamedLocks::new(),
            }),
        }
    }

    pub(crate) fn storage(&self) -> &dyn Storage {
        self.inner.storage.as_ref()
    }

    pub(crate) fn symbols(&self) -> &SymbolCache {
        &self.inner.symbols
    }

    pub(crate) fn locks(&self) -> &NamedLocks {
        &self.inner.locks
    }

    pub(crate) fn projection(&self) -> &RwLock<Projection> {
        &self.inner.projection
    }

    /// Resolve credentials to the canonical user id.
    pub(crate) async fn authenticate(
        &self,
        key: &str,
        secret: &str,
    ) -> Result<UserId, EngineError> {
        self.inner
            .storage
            .find_user(key, secret)
            .await?
            .ok_or(EngineError::UserNotFound)
    }

    /// Latest price for the symbol: the tick-fed cache first, the
    /// latest-price endpoint as fallback (which also re-primes the cache).
    pub(crate) async fn current_price(
        &self,
        symbol: &str,
        exchange: ExchangeId,
    ) -> Result<Decimal, EngineError> {
        let channel = MarketChannel::new(symbol, exchange);
        if let Some(price) = self.inner.prices.latest(&channel) {
            return Ok(price);
        }
        match self.inner.api.latest_price(symbol, exchange).await {
            Ok(price) => {
                self.inner.prices.record(channel, price);
                Ok(price)
            }
            Err(error) => {
                warn!(%channel, %error, "latest-price lookup failed");
                Err(EngineError::PriceUnavailable(channel.to_string()))
            }
        }
    }

    /// Register a holder on a channel, opening the subscription when it is
    /// the first.
    pub(crate) fn watch_add(&self, channel: MarketChannel, holder: impl Into<SmolStr>) {
        let newly_watched = self.inner.watch.lock().add(channel.clone(), holder);
        if newly_watched {
            self.inner.feed.subscribe(channel);
        }
    }

    /// Drop a holder, closing the subscription when it was the last.
    pub(crate) fn watch_remove(&self, channel: &MarketChannel, holder: &str) {
        let now_empty = self.inner.watch.lock().remove(channel, holder);
        if now_empty {
            self.inner.feed.unsubscribe(channel.clone());
        }
    }

    /// True while at least one live order or position references the channel.
    pub fn is_watching(&self, channel: &MarketChannel) -> bool {
        self.inner.watch.lock().contains(channel)
    }

    pub fn watch_holder_count(&self, channel: &MarketChannel) -> usize {
        self.inner.watch.lock().holder_count(channel)
    }

    /// Emit an execution report. Best-effort: failures are logged, state is
    /// already durable.
    pub(crate) async fn emit_order(&self, order: &Order) {
        let data = match serde_json::to_value(order) {
            Ok(data) => data,
            Err(error) => {
                warn!(%error, "failed to encode order event");
                return;
            }
        };
        if let Err(error) = self
            .inner
            .push
            .publish(&order.user, PushTopic::Order, PushEvent::Update { data })
            .await
        {
            warn!(%error, user = %order.user, "order event delivery failed");
        }
    }

    /// Emit a full balance snapshot on `outboundAccountInfo`. Best-effort.
    pub(crate) async fn emit_balances(&self, user: &UserId) {
        let balances = match self.inner.storage.balances(user).await {
            Ok(balances) => balances,
            Err(error) => {
                warn!(%error, %user, "failed to load balances for snapshot");
                return;
            }
        };
        let snapshot: Vec<BalanceSnapshot> = balances
            .into_iter()
            .map(|(asset, balance)| BalanceSnapshot::new(asset, balance))
            .collect();
        let info = match serde_json::to_value(&snapshot) {
            Ok(info) => info,
            Err(error) => {
                warn!(%error, "failed to encode balance snapshot");
                return;
            }
        };
        if let Err(error) = self
            .inner
            .push
            .publish(user, PushTopic::OutboundAccountInfo, PushEvent::Info { info })
            .await
        {
            warn!(%error, %user, "balance snapshot delivery failed");
        }
    }
}

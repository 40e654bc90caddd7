//! Ticker intake: filtering, price caching, and per-exchange dispatch.
//!
//! Raw ticks pass three filters in order (per-exchange monotonicity, a 30 s
//! freshness bound, a content-signature dedup), then update the shared
//! [`PriceCache`] and are coalesced into one pending batch per exchange. A
//! dedicated worker task per exchange drains its batch and hands it to the
//! [`TickConsumer`], so ticks for one exchange apply in arrival order and
//! never concurrently, while exchanges proceed in parallel.

use crate::{
    feed::MarketChannel,
    ticker::{TickSignature, Ticker},
    FnvIndexMap,
};
use arara_markets::ExchangeId;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use smol_str::SmolStr;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Ticks older than this are discarded and invalidate the cached price.
pub const TICK_MAX_AGE: Duration = Duration::from_secs(30);

/// Cached latest prices expire after this long.
pub const PRICE_TTL: Duration = Duration::from_secs(60);

/// A batch of coalesced ticks for one exchange, at most one per symbol.
pub type TickBatch = FnvIndexMap<SmolStr, Ticker>;

fn chrono_duration(duration: Duration) -> ChronoDuration {
    ChronoDuration::milliseconds(duration.as_millis() as i64)
}

/// Consumes per-exchange tick batches. Implemented by the matching engine.
#[async_trait]
pub trait TickConsumer: Send + Sync + 'static {
    async fn process_ticks(&self, exchange: ExchangeId, batch: TickBatch);
}

/// Shared cache of the latest observed price per channel.
///
/// Entries expire after [`PRICE_TTL`]; stale ticks invalidate their entry
/// eagerly so a marketable-limit check never prices off a dead feed.
#[derive(Debug, Clone, Default)]
pub struct PriceCache {
    inner: Arc<RwLock<FnvIndexMap<MarketChannel, PricePoint>>>,
}

#[derive(Debug, Clone, Copy)]
struct PricePoint {
    price: Decimal,
    at: DateTime<Utc>,
}

impl PriceCache {
    pub fn record(&self, channel: MarketChannel, price: Decimal) {
        self.inner.write().insert(
            channel,
            PricePoint {
                price,
                at: Utc::now(),
            },
        );
    }

    pub fn invalidate(&self, channel: &MarketChannel) {
        self.inner.write().shift_remove(channel);
    }

    /// Latest unexpired price for the channel.
    pub fn latest(&self, channel: &MarketChannel) -> Option<Decimal> {
        let guard = self.inner.read();
        let point = guard.get(channel)?;
        (point.at + chrono_duration(PRICE_TTL) >= Utc::now()).then_some(point.price)
    }
}

/// Filters raw ticks and dispatches surviving batches to the consumer.
#[derive(Clone)]
pub struct TickerIntake {
    consumer: Arc<dyn TickConsumer>,
    prices: PriceCache,
    state: Arc<IntakeState>,
}

impl fmt::Debug for TickerIntake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickerIntake").finish_non_exhaustive()
    }
}

#[derive(Default)]
struct IntakeState {
    /// Last accepted tick time per exchange (monotonicity filter).
    last_time: Mutex<FnvIndexMap<ExchangeId, DateTime<Utc>>>,
    /// Last accepted content signature per channel (dedup filter).
    last_signature: Mutex<FnvIndexMap<MarketChannel, TickSignature>>,
    /// One pending batch + worker per exchange.
    queues: Mutex<FnvIndexMap<ExchangeId, Arc<ExchangeQueue>>>,
}

struct ExchangeQueue {
    pending: Mutex<TickBatch>,
    wake: Notify,
}

impl TickerIntake {
    /// Must be constructed inside a tokio runtime: per-exchange workers are
    /// spawned lazily from [`TickerIntake::handle`].
    pub fn new(consumer: Arc<dyn TickConsumer>, prices: PriceCache) -> Self {
        Self {
            consumer,
            prices,
            state: Arc::new(IntakeState::default()),
        }
    }

    /// Shared price cache view.
    pub fn prices(&self) -> PriceCache {
        self.prices.clone()
    }

    /// Run one tick through the filters and, if it survives, enqueue it for
    /// its exchange.
    pub fn handle(&self, ticker: Ticker) {
        let channel = MarketChannel::new(ticker.symbol.clone(), ticker.exchange);
        let tick_time = ticker.tick_time();

        // 1. Per-exchange monotonicity.
        {
            let mut last_time = self.state.last_time.lock();
            match last_time.get(&ticker.exchange) {
                Some(last) if tick_time < *last => {
                    debug!(%channel, %tick_time, "dropping out-of-order tick");
                    return;
                }
                _ => {
                    last_time.insert(ticker.exchange, tick_time);
                }
            }
        }

        // 2. Freshness.
        if tick_time + chrono_duration(TICK_MAX_AGE) < Utc::now() {
            warn!(%channel, %tick_time, "dropping stale tick, invalidating cached price");
            self.prices.invalidate(&channel);
            return;
        }

        // 3. Signature dedup.
        {
            let signature = ticker.signature();
            let mut last_signature = self.state.last_signature.lock();
            if last_signature.get(&channel) == Some(&signature) {
                debug!(%channel, "dropping duplicate tick");
                return;
            }
            last_signature.insert(channel.clone(), signature);
        }

        self.prices.record(channel, ticker.price);
        self.enqueue(ticker);
    }

    fn enqueue(&self, ticker: Ticker) {
        let exchange = ticker.exchange;
        let queue = {
            let mut queues = self.state.queues.lock();
            match queues.get(&exchange) {
                Some(queue) => Arc::clone(queue),
                None => {
                    let queue = Arc::new(ExchangeQueue {
                        pending: Mutex::new(TickBatch::default()),
                        wake: Notify::new(),
                    });
                    queues.insert(exchange, Arc::clone(&queue));
                    tokio::spawn(run_exchange_worker(
                        exchange,
                        Arc::clone(&queue),
                        Arc::clone(&self.consumer),
                    ));
                    queue
                }
            }
        };

        // Later ticks for the same symbol replace earlier ones still pending.
        queue.pending.lock().insert(ticker.symbol.clone(), ticker);
        queue.wake.notify_one();
    }
}

/// Drains one exchange's pending batch, serially, in arrival order.
async fn run_exchange_worker(
    exchange: ExchangeId,
    queue: Arc<ExchangeQueue>,
    consumer: Arc<dyn TickConsumer>,
) {
    loop {
        queue.wake.notified().await;
        loop {
            let batch = std::mem::take(&mut *queue.pending.lock());
            if batch.is_empty() {
                break;
            }
            consumer.process_ticks(exchange, batch).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    struct Collector(mpsc::UnboundedSender<(ExchangeId, TickBatch)>);

    #[async_trait]
    impl TickConsumer for Collector {
        async fn process_ticks(&self, exchange: ExchangeId, batch: TickBatch) {
            let _send = self.0.send((exchange, batch));
        }
    }

    fn tick(symbol: &str, exchange: ExchangeId, price: Decimal, offset_ms: i64) -> Ticker {
        let now = Utc::now();
        Ticker {
            symbol: SmolStr::new(symbol),
            exchange,
            best_ask: price + dec!(0.5),
            best_bid: price - dec!(0.5),
            best_ask_qnt: dec!(1),
            best_bid_qnt: dec!(1),
            price,
            time: now + ChronoDuration::milliseconds(offset_ms),
            event_time: None,
        }
    }

    fn intake() -> (TickerIntake, mpsc::UnboundedReceiver<(ExchangeId, TickBatch)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let intake = TickerIntake::new(Arc::new(Collector(tx)), PriceCache::default());
        (intake, rx)
    }

    #[tokio::test]
    async fn surviving_tick_reaches_consumer_and_price_cache() {
        let (intake, mut rx) = intake();
        intake.handle(tick("BTCUSDT", ExchangeId::Binance, dec!(50000), 0));

        let (exchange, batch) = rx.recv().await.unwrap();
        assert_eq!(exchange, ExchangeId::Binance);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch["BTCUSDT"].price, dec!(50000));

        let channel = MarketChannel::new("BTCUSDT", ExchangeId::Binance);
        assert_eq!(intake.prices().latest(&channel), Some(dec!(50000)));
    }

    #[tokio::test]
    async fn out_of_order_tick_is_dropped() {
        let (intake, mut rx) = intake();
        intake.handle(tick("BTCUSDT", ExchangeId::Binance, dec!(50000), 0));
        // Earlier tick time on the same exchange, different symbol.
        intake.handle(tick("ETHUSDT", ExchangeId::Binance, dec!(2000), -5000));

        let (_, batch) = rx.recv().await.unwrap();
        assert!(batch.contains_key("BTCUSDT"));
        assert!(!batch.contains_key("ETHUSDT"));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_tick_is_dropped_and_invalidates_price() {
        let (intake, mut rx) = intake();
        let channel = MarketChannel::new("BTCUSDT", ExchangeId::Binance);
        intake.prices().record(channel.clone(), dec!(49000));

        intake.handle(tick("BTCUSDT", ExchangeId::Binance, dec!(50000), -31_000));

        assert_eq!(intake.prices().latest(&channel), None);
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_signature_is_dropped() {
        let (intake, mut rx) = intake();
        let first = tick("BTCUSDT", ExchangeId::Binance, dec!(50000), 0);
        let mut replay = first.clone();
        replay.time = replay.time + ChronoDuration::milliseconds(100);

        intake.handle(first);
        intake.handle(replay);

        let (_, batch) = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn batch_coalesces_by_symbol() {
        let (intake, mut rx) = intake();
        // Two symbols, second update replaces the first for BTCUSDT while the
        // worker may still be parked.
        intake.handle(tick("BTCUSDT", ExchangeId::Binance, dec!(50000), 0));
        intake.handle(tick("ETHUSDT", ExchangeId::Binance, dec!(2000), 1));
        intake.handle(tick("BTCUSDT", ExchangeId::Binance, dec!(50100), 2));

        let mut prices = std::collections::HashMap::new();
        while prices.len() < 2 {
            let (_, batch) = rx.recv().await.unwrap();
            for (symbol, ticker) in batch {
                prices.insert(symbol.to_string(), ticker.price);
            }
        }
        assert_eq!(prices["ETHUSDT"], dec!(2000));
        assert_eq!(prices["BTCUSDT"], dec!(50100));
    }
}

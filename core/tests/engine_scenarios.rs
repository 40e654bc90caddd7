//! End-to-end engine scenarios over in-memory storage, push, and feed fakes.

use arara_core::{
    balance::Balance,
    engine::{
        cancel::{CancelRequest, CancelTarget},
        create::OrderRequest,
        Engine,
    },
    error::EngineError,
    order::{OrderKind, OrderStatus},
    push::{MemoryPush, PushChannel, PushTopic},
    storage::{memory::MemoryStorage, LeverageRow, Storage},
};
use arara_data::{
    error::DataError,
    feed::{
        feed_channel, FeedDriver, MarketChannel, PubSubConnection, PubSubConnector,
        FEED_RECONNECT_POLICY,
    },
    intake::{PriceCache, TickBatch, TickConsumer, TickerIntake},
    service::MarketApi,
    ticker::Ticker,
};
use arara_markets::{BaseAsset, ExchangeId, PositionSide, QuoteAsset, Side, SymbolSpec};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use smol_str::SmolStr;
use std::sync::Arc;
use std::time::Duration;

struct StaticApi;

#[async_trait]
impl MarketApi for StaticApi {
    async fn symbol(&self, symbol: &str, exchange: ExchangeId) -> Result<SymbolSpec, DataError> {
        let (base, quote) = match symbol {
            "BTCUSDT" => ("BTC", "USDT"),
            "BTCUSD" => ("BTC", "USD"),
            other => return Err(DataError::Service(format!("unknown symbol {other}"))),
        };
        Ok(SymbolSpec {
            pair: SmolStr::new(symbol),
            exchange,
            base: BaseAsset {
                name: SmolStr::new(base),
                min_amount: dec!(0.001),
                step: dec!(0.001),
            },
            quote: QuoteAsset {
                name: SmolStr::new(quote),
                min_amount: if exchange.is_inverse() { dec!(100) } else { dec!(10) },
            },
            price_precision: 2,
            max_orders: 200,
        })
    }

    async fn latest_price(
        &self,
        _symbol: &str,
        _exchange: ExchangeId,
    ) -> Result<Decimal, DataError> {
        Err(DataError::Service("no latest price".to_string()))
    }
}

struct Harness {
    engine: Engine,
    storage: Arc<MemoryStorage>,
    push: Arc<MemoryPush>,
    prices: PriceCache,
}

fn harness() -> Harness {
    let storage = Arc::new(MemoryStorage::new());
    let push = Arc::new(MemoryPush::new());
    let prices = PriceCache::default();
    let (feed, _commands) = feed_channel();
    let engine = Engine::new(
        Arc::clone(&storage) as Arc<dyn Storage>,
        Arc::clone(&push) as Arc<dyn PushChannel>,
        Arc::new(StaticApi),
        prices.clone(),
        feed,
    );
    Harness {
        engine,
        storage,
        push,
        prices,
    }
}

impl Harness {
    fn set_price(&self, symbol: &str, exchange: ExchangeId, price: Decimal) {
        self.prices.record(MarketChannel::new(symbol, exchange), price);
    }

    async fn balance(&self, user: &str, asset: &str) -> Balance {
        self.storage
            .balance(&SmolStr::new(user), asset)
            .await
            .unwrap()
    }
}

fn tick(
    symbol: &str,
    exchange: ExchangeId,
    best_bid: Decimal,
    best_ask: Decimal,
    bid_qty: Decimal,
    ask_qty: Decimal,
) -> Ticker {
    Ticker {
        symbol: SmolStr::new(symbol),
        exchange,
        best_ask,
        best_bid,
        best_ask_qnt: ask_qty,
        best_bid_qnt: bid_qty,
        price: (best_ask + best_bid) / dec!(2),
        time: Utc::now(),
        event_time: None,
    }
}

fn batch(ticker: Ticker) -> TickBatch {
    let mut batch = TickBatch::default();
    batch.insert(ticker.symbol.clone(), ticker);
    batch
}

fn request(
    key: &str,
    symbol: &str,
    exchange: ExchangeId,
    side: Side,
    kind: OrderKind,
    amount: Decimal,
    price: Option<Decimal>,
) -> OrderRequest {
    OrderRequest {
        key: key.to_string(),
        secret: format!("secret-{key}"),
        symbol: SmolStr::new(symbol),
        exchange,
        side,
        kind,
        price,
        amount,
        external_id: None,
        reduce_only: false,
        position_side: None,
    }
}

fn add_user(harness: &Harness, key: &str, user: &str) {
    harness
        .storage
        .add_user(key, &format!("secret-{key}"), user);
}

// Scenario 1/2: a spot limit buy reserves quote, then fills at the touch.
#[tokio::test]
async fn spot_limit_buy_reserves_then_fills() {
    let h = harness();
    add_user(&h, "k1", "alice");
    h.storage.deposit("alice", "USDT", dec!(10000));
    h.set_price("BTCUSDT", ExchangeId::Binance, dec!(50000));

    let order = h
        .engine
        .create_order(request(
            "k1",
            "BTCUSDT",
            ExchangeId::Binance,
            Side::Buy,
            OrderKind::Limit,
            dec!(0.1),
            Some(dec!(50000)),
        ))
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::New);
    assert_eq!(
        h.balance("alice", "USDT").await,
        Balance::new(dec!(5000), dec!(5000))
    );
    assert_eq!(h.balance("alice", "BTC").await, Balance::default());
    let channel = MarketChannel::new("BTCUSDT", ExchangeId::Binance);
    assert!(h.engine.is_watching(&channel));

    // Ask touches the limit price with enough size for the full remainder.
    h.engine
        .process_ticks(
            ExchangeId::Binance,
            batch(tick(
                "BTCUSDT",
                ExchangeId::Binance,
                dec!(49999),
                dec!(50000),
                dec!(1),
                dec!(0.2),
            )),
        )
        .await;

    let filled = h
        .storage
        .order("BTCUSDT", &order.external_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(filled.status, OrderStatus::Filled);
    assert_eq!(filled.fee, dec!(0.0001));
    assert_eq!(
        h.balance("alice", "USDT").await,
        Balance::new(dec!(5000), dec!(0))
    );
    assert_eq!(
        h.balance("alice", "BTC").await,
        Balance::new(dec!(0.0999), dec!(0))
    );
    assert!(!h.engine.is_watching(&channel));
    assert!(h.push.count(PushTopic::Order) >= 2);
}

// Spot at the exact touched price fills only up to the quoted size.
#[tokio::test]
async fn spot_partial_fill_at_touched_size() {
    let h = harness();
    add_user(&h, "k1", "alice");
    h.storage.deposit("alice", "USDT", dec!(10000));
    h.set_price("BTCUSDT", ExchangeId::Binance, dec!(50000));

    let order = h
        .engine
        .create_order(request(
            "k1",
            "BTCUSDT",
            ExchangeId::Binance,
            Side::Buy,
            OrderKind::Limit,
            dec!(0.1),
            Some(dec!(50000)),
        ))
        .await
        .unwrap();

    h.engine
        .process_ticks(
            ExchangeId::Binance,
            batch(tick(
                "BTCUSDT",
                ExchangeId::Binance,
                dec!(49999),
                dec!(50000),
                dec!(1),
                dec!(0.04),
            )),
        )
        .await;

    let partial = h
        .storage
        .order("BTCUSDT", &order.external_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(partial.status, OrderStatus::PartiallyFilled);
    assert_eq!(partial.filled_amount, dec!(0.04));
    // 0.04 * 50000 consumed from the reservation.
    assert_eq!(
        h.balance("alice", "USDT").await,
        Balance::new(dec!(5000), dec!(3000))
    );
    assert_eq!(
        h.balance("alice", "BTC").await,
        Balance::new(dec!(0.03996), dec!(0))
    );
    assert!(h
        .engine
        .is_watching(&MarketChannel::new("BTCUSDT", ExchangeId::Binance)));
}

// Scenario 3: linear market buy opens a leveraged long.
#[tokio::test]
async fn usdm_market_buy_opens_position() {
    let h = harness();
    add_user(&h, "k1", "alice");
    h.storage.deposit("alice", "USDT", dec!(1000));
    h.set_price("BTCUSDT", ExchangeId::BinanceUsdm, dec!(50000));
    h.engine
        .set_leverage(
            "k1",
            "secret-k1",
            &SmolStr::new("BTCUSDT"),
            None,
            10,
        )
        .await
        .unwrap();

    let order = h
        .engine
        .create_order(request(
            "k1",
            "BTCUSDT",
            ExchangeId::BinanceUsdm,
            Side::Buy,
            OrderKind::Market,
            dec!(0.01),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.fee, dec!(0.2));

    let positions = h
        .storage
        .user_open_positions(&SmolStr::new("alice"))
        .await
        .unwrap();
    assert_eq!(positions.len(), 1);
    let position = &positions[0];
    assert_eq!(position.position_side, PositionSide::Long);
    assert_eq!(position.amount, dec!(0.01));
    assert_eq!(position.entry_price, dec!(50000));
    assert_eq!(position.margin, dec!(50));
    assert_eq!(position.leverage, 10);
    assert_eq!(position.liquidation_price, dec!(44982));

    assert_eq!(
        h.balance("alice", "USDT").await,
        Balance::new(dec!(949.8), dec!(50))
    );

    // Leverage row is locked while the position is open.
    let row = h
        .storage
        .leverage(
            &SmolStr::new("alice"),
            "BTCUSDT",
            Some(PositionSide::Both),
        )
        .await
        .unwrap()
        .unwrap();
    assert!(row.locked);
    let err = h
        .engine
        .set_leverage("k1", "secret-k1", &SmolStr::new("BTCUSDT"), None, 20)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LeverageLocked));
}

// Scenario 4: the bid falling to the liquidation price force-closes the long.
#[tokio::test]
async fn long_liquidates_when_bid_touches() {
    let h = harness();
    add_user(&h, "k1", "alice");
    h.storage.deposit("alice", "USDT", dec!(1000));
    h.set_price("BTCUSDT", ExchangeId::BinanceUsdm, dec!(50000));
    h.engine
        .set_leverage("k1", "secret-k1", &SmolStr::new("BTCUSDT"), None, 10)
        .await
        .unwrap();
    h.engine
        .create_order(request(
            "k1",
            "BTCUSDT",
            ExchangeId::BinanceUsdm,
            Side::Buy,
            OrderKind::Market,
            dec!(0.01),
            None,
        ))
        .await
        .unwrap();

    h.engine
        .process_ticks(
            ExchangeId::BinanceUsdm,
            batch(tick(
                "BTCUSDT",
                ExchangeId::BinanceUsdm,
                dec!(44980),
                dec!(44981),
                dec!(1),
                dec!(1),
            )),
        )
        .await;

    let open = h
        .storage
        .user_open_positions(&SmolStr::new("alice"))
        .await
        .unwrap();
    assert!(open.is_empty());

    // Settled at the pre-computed liquidation price, not the tick.
    // pnl = (0.01*44982 - 0.01*50000) - 0.01*44982*0.0004 = -50.359928
    assert_eq!(
        h.balance("alice", "USDT").await,
        Balance::new(dec!(949.440072), dec!(0))
    );
    assert!(!h
        .engine
        .is_watching(&MarketChannel::new("BTCUSDT", ExchangeId::BinanceUsdm)));

    // Leverage unlocked again.
    let row = h
        .storage
        .leverage(&SmolStr::new("alice"), "BTCUSDT", Some(PositionSide::Both))
        .await
        .unwrap()
        .unwrap();
    assert!(!row.locked);
}

// Scenario 5: hedge mode, reduce-only limit close of a long.
#[tokio::test]
async fn hedge_reduce_only_limit_closes_long() {
    let h = harness();
    add_user(&h, "k1", "alice");
    h.storage.deposit("alice", "USDT", dec!(1000));
    h.set_price("BTCUSDT", ExchangeId::BinanceUsdm, dec!(50000));
    h.engine.set_hedge("k1", "secret-k1", true).await.unwrap();

    let mut open = request(
        "k1",
        "BTCUSDT",
        ExchangeId::BinanceUsdm,
        Side::Buy,
        OrderKind::Market,
        dec!(0.01),
        None,
    );
    open.position_side = Some(PositionSide::Long);
    h.engine.create_order(open).await.unwrap();
    let after_open = h.balance("alice", "USDT").await;
    assert_eq!(after_open.locked, dec!(500)); // leverage defaults to 1

    let mut close = request(
        "k1",
        "BTCUSDT",
        ExchangeId::BinanceUsdm,
        Side::Sell,
        OrderKind::Limit,
        dec!(0.01),
        Some(dec!(55000)),
    );
    close.reduce_only = true;
    close.position_side = Some(PositionSide::Long);
    let close = h.engine.create_order(close).await.unwrap();
    assert_eq!(close.status, OrderStatus::New);
    // Reduce-only books without any further reservation.
    assert_eq!(h.balance("alice", "USDT").await.locked, dec!(500));

    h.engine
        .process_ticks(
            ExchangeId::BinanceUsdm,
            batch(tick(
                "BTCUSDT",
                ExchangeId::BinanceUsdm,
                dec!(55000),
                dec!(55001),
                dec!(1),
                dec!(1),
            )),
        )
        .await;

    let filled = h
        .storage
        .order("BTCUSDT", &close.external_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(filled.status, OrderStatus::Filled);

    let open_positions = h
        .storage
        .user_open_positions(&SmolStr::new("alice"))
        .await
        .unwrap();
    assert!(open_positions.is_empty());

    // Maker fee on the close: 0.01*55000*0.0002 = 0.11; pnl = 50 - 0.11.
    assert_eq!(
        h.balance("alice", "USDT").await,
        Balance::new(dec!(1049.69), dec!(0))
    );

    let row = h
        .storage
        .leverage(&SmolStr::new("alice"), "BTCUSDT", Some(PositionSide::Long))
        .await
        .unwrap()
        .unwrap();
    assert!(!row.locked);
}

// Scenario 6: the watch set holds the subscription until the last holder goes.
#[tokio::test]
async fn shared_symbol_subscription_survives_first_cancel() {
    #[derive(Clone, Default)]
    struct RecordingConnector {
        log: Arc<Mutex<Vec<String>>>,
    }
    struct RecordingConnection {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl PubSubConnector for RecordingConnector {
        type Connection = RecordingConnection;
        async fn connect(&self) -> Result<RecordingConnection, DataError> {
            Ok(RecordingConnection {
                log: Arc::clone(&self.log),
            })
        }
    }

    #[async_trait]
    impl PubSubConnection for RecordingConnection {
        async fn subscribe(&mut self, topic: &str) -> Result<(), DataError> {
            self.log.lock().push(format!("+{topic}"));
            Ok(())
        }
        async fn unsubscribe(&mut self, topic: &str) -> Result<(), DataError> {
            self.log.lock().push(format!("-{topic}"));
            Ok(())
        }
        async fn recv(&mut self) -> Option<String> {
            std::future::pending::<()>().await;
            None
        }
    }

    let storage = Arc::new(MemoryStorage::new());
    let push = Arc::new(MemoryPush::new());
    let prices = PriceCache::default();
    let (feed, commands) = feed_channel();
    let engine = Engine::new(
        Arc::clone(&storage) as Arc<dyn Storage>,
        Arc::clone(&push) as Arc<dyn PushChannel>,
        Arc::new(StaticApi),
        prices.clone(),
        feed,
    );
    let connector = RecordingConnector::default();
    let log = Arc::clone(&connector.log);
    let intake = TickerIntake::new(Arc::new(engine.clone()), prices.clone());
    tokio::spawn(FeedDriver::new(connector, FEED_RECONNECT_POLICY, intake, commands).run());

    let h = Harness {
        engine,
        storage,
        push,
        prices,
    };
    add_user(&h, "k1", "alice");
    add_user(&h, "k2", "bob");
    h.storage.deposit("alice", "USDT", dec!(10000));
    h.storage.deposit("bob", "USDT", dec!(10000));
    h.set_price("BTCUSDT", ExchangeId::Binance, dec!(50000));

    let order_a = h
        .engine
        .create_order(request(
            "k1",
            "BTCUSDT",
            ExchangeId::Binance,
            Side::Buy,
            OrderKind::Limit,
            dec!(0.01),
            Some(dec!(40000)),
        ))
        .await
        .unwrap();
    let order_b = h
        .engine
        .create_order(request(
            "k2",
            "BTCUSDT",
            ExchangeId::Binance,
            Side::Buy,
            OrderKind::Limit,
            dec!(0.01),
            Some(dec!(40000)),
        ))
        .await
        .unwrap();

    let channel = MarketChannel::new("BTCUSDT", ExchangeId::Binance);
    assert_eq!(h.engine.watch_holder_count(&channel), 2);

    h.engine
        .cancel_order(CancelRequest {
            key: "k1".to_string(),
            secret: "secret-k1".to_string(),
            target: CancelTarget::External {
                symbol: SmolStr::new("BTCUSDT"),
                external_id: order_a.external_id.clone(),
            },
            expire: false,
        })
        .await
        .unwrap();
    assert!(h.engine.is_watching(&channel));

    h.engine
        .cancel_order(CancelRequest {
            key: "k2".to_string(),
            secret: "secret-k2".to_string(),
            target: CancelTarget::External {
                symbol: SmolStr::new("BTCUSDT"),
                external_id: order_b.external_id.clone(),
            },
            expire: false,
        })
        .await
        .unwrap();
    assert!(!h.engine.is_watching(&channel));

    // The driver applied one subscribe and one unsubscribe for the topic.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let entries = log.lock().clone();
        if entries
            == vec![
                "+trade@BTCUSDT@binance".to_string(),
                "-trade@BTCUSDT@binance".to_string(),
            ]
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "driver log never converged: {entries:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn cancel_restores_reservation_and_rejects_terminal() {
    let h = harness();
    add_user(&h, "k1", "alice");
    h.storage.deposit("alice", "USDT", dec!(10000));
    h.set_price("BTCUSDT", ExchangeId::Binance, dec!(50000));

    let order = h
        .engine
        .create_order(request(
            "k1",
            "BTCUSDT",
            ExchangeId::Binance,
            Side::Buy,
            OrderKind::Limit,
            dec!(0.1),
            Some(dec!(50000)),
        ))
        .await
        .unwrap();

    let cancel = CancelRequest {
        key: "k1".to_string(),
        secret: "secret-k1".to_string(),
        target: CancelTarget::External {
            symbol: SmolStr::new("BTCUSDT"),
            external_id: order.external_id.clone(),
        },
        expire: false,
    };
    let cancelled = h.engine.cancel_order(cancel.clone()).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Canceled);
    assert_eq!(
        h.balance("alice", "USDT").await,
        Balance::new(dec!(10000), dec!(0))
    );

    let err = h.engine.cancel_order(cancel).await.unwrap_err();
    assert!(matches!(err, EngineError::OrderTerminal(OrderStatus::Canceled)));
}

#[tokio::test]
async fn marketable_limit_promotes_to_market() {
    let h = harness();
    add_user(&h, "k1", "alice");
    h.storage.deposit("alice", "USDT", dec!(10000));
    h.set_price("BTCUSDT", ExchangeId::Binance, dec!(50000));

    let order = h
        .engine
        .create_order(request(
            "k1",
            "BTCUSDT",
            ExchangeId::Binance,
            Side::Buy,
            OrderKind::Limit,
            dec!(0.1),
            Some(dec!(51000)),
        ))
        .await
        .unwrap();

    assert_eq!(order.kind, OrderKind::Market);
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.avg_filled_price, dec!(50000));
    assert_eq!(
        h.balance("alice", "USDT").await,
        Balance::new(dec!(5000), dec!(0))
    );
    assert_eq!(
        h.balance("alice", "BTC").await,
        Balance::new(dec!(0.0999), dec!(0))
    );
}

#[tokio::test]
async fn reduce_only_overfill_is_trimmed() {
    let h = harness();
    add_user(&h, "k1", "alice");
    h.storage.deposit("alice", "USDT", dec!(1000));
    h.set_price("BTCUSDT", ExchangeId::BinanceUsdm, dec!(50000));
    h.engine
        .set_leverage("k1", "secret-k1", &SmolStr::new("BTCUSDT"), None, 10)
        .await
        .unwrap();
    h.engine
        .create_order(request(
            "k1",
            "BTCUSDT",
            ExchangeId::BinanceUsdm,
            Side::Buy,
            OrderKind::Market,
            dec!(0.01),
            None,
        ))
        .await
        .unwrap();

    let mut close = request(
        "k1",
        "BTCUSDT",
        ExchangeId::BinanceUsdm,
        Side::Sell,
        OrderKind::Market,
        dec!(0.02),
        None,
    );
    close.reduce_only = true;
    let close = h.engine.create_order(close).await.unwrap();

    // Rewritten down to the position amount; fee charged on 0.01 only.
    assert_eq!(close.amount, dec!(0.01));
    assert_eq!(close.quote_amount, dec!(500));
    assert_eq!(close.status, OrderStatus::Filled);
    assert_eq!(close.fee, dec!(0.2));

    assert!(h
        .storage
        .user_open_positions(&SmolStr::new("alice"))
        .await
        .unwrap()
        .is_empty());
    // 1000 - 0.2 (open fee) - 0.2 (close fee), margin round-tripped.
    assert_eq!(
        h.balance("alice", "USDT").await,
        Balance::new(dec!(999.6), dec!(0))
    );
}

#[tokio::test]
async fn oversized_sell_flips_long_into_short() {
    let h = harness();
    add_user(&h, "k1", "alice");
    h.storage.deposit("alice", "USDT", dec!(1000));
    h.set_price("BTCUSDT", ExchangeId::BinanceUsdm, dec!(50000));
    h.engine
        .set_leverage("k1", "secret-k1", &SmolStr::new("BTCUSDT"), None, 10)
        .await
        .unwrap();
    h.engine
        .create_order(request(
            "k1",
            "BTCUSDT",
            ExchangeId::BinanceUsdm,
            Side::Buy,
            OrderKind::Market,
            dec!(0.01),
            None,
        ))
        .await
        .unwrap();

    h.engine
        .create_order(request(
            "k1",
            "BTCUSDT",
            ExchangeId::BinanceUsdm,
            Side::Sell,
            OrderKind::Market,
            dec!(0.03),
            None,
        ))
        .await
        .unwrap();

    let positions = h
        .storage
        .user_open_positions(&SmolStr::new("alice"))
        .await
        .unwrap();
    assert_eq!(positions.len(), 1);
    let short = &positions[0];
    assert_eq!(short.position_side, PositionSide::Short);
    assert_eq!(short.amount, dec!(0.02));
    assert_eq!(short.entry_price, dec!(50000));
    assert_eq!(short.margin, dec!(100));

    // open: -50.2; close long: +49.8; open short: -100.4
    assert_eq!(
        h.balance("alice", "USDT").await,
        Balance::new(dec!(899.2), dec!(100))
    );
}

// A hedge-mode overfill flips into the opposite scope: the new Short leg
// takes the Short row's leverage and locks it, while the emptied Long row
// unlocks.
#[tokio::test]
async fn hedge_overfill_flips_into_short_scope() {
    let h = harness();
    add_user(&h, "k1", "alice");
    h.storage.deposit("alice", "USDT", dec!(2000));
    h.set_price("BTCUSDT", ExchangeId::BinanceUsdm, dec!(50000));
    h.engine.set_hedge("k1", "secret-k1", true).await.unwrap();
    h.engine
        .set_leverage(
            "k1",
            "secret-k1",
            &SmolStr::new("BTCUSDT"),
            Some(PositionSide::Long),
            10,
        )
        .await
        .unwrap();
    h.engine
        .set_leverage(
            "k1",
            "secret-k1",
            &SmolStr::new("BTCUSDT"),
            Some(PositionSide::Short),
            5,
        )
        .await
        .unwrap();

    let mut open = request(
        "k1",
        "BTCUSDT",
        ExchangeId::BinanceUsdm,
        Side::Buy,
        OrderKind::Market,
        dec!(0.01),
        None,
    );
    open.position_side = Some(PositionSide::Long);
    h.engine.create_order(open).await.unwrap();

    let mut flip = request(
        "k1",
        "BTCUSDT",
        ExchangeId::BinanceUsdm,
        Side::Sell,
        OrderKind::Market,
        dec!(0.03),
        None,
    );
    flip.position_side = Some(PositionSide::Long);
    h.engine.create_order(flip).await.unwrap();

    let positions = h
        .storage
        .user_open_positions(&SmolStr::new("alice"))
        .await
        .unwrap();
    assert_eq!(positions.len(), 1);
    let short = &positions[0];
    assert_eq!(short.position_side, PositionSide::Short);
    assert_eq!(short.amount, dec!(0.02));
    assert_eq!(short.margin, dec!(100));
    // The new leg is governed by the Short scope's leverage setting.
    assert_eq!(short.leverage, 5);
    // 50000 * (1 + 1/5) * (1 + 0.0004)
    assert_eq!(short.liquidation_price, dec!(60024));

    let long_row = h
        .storage
        .leverage(&SmolStr::new("alice"), "BTCUSDT", Some(PositionSide::Long))
        .await
        .unwrap()
        .unwrap();
    assert!(!long_row.locked);
    let short_row = h
        .storage
        .leverage(&SmolStr::new("alice"), "BTCUSDT", Some(PositionSide::Short))
        .await
        .unwrap()
        .unwrap();
    assert!(short_row.locked);
    // The Long scope is free to retune; the Short scope is pinned.
    h.engine
        .set_leverage(
            "k1",
            "secret-k1",
            &SmolStr::new("BTCUSDT"),
            Some(PositionSide::Long),
            20,
        )
        .await
        .unwrap();
    let err = h
        .engine
        .set_leverage(
            "k1",
            "secret-k1",
            &SmolStr::new("BTCUSDT"),
            Some(PositionSide::Short),
            10,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LeverageLocked));

    // open: -(50 + 0.2); close long at entry: +(50 - 0.2); flip short leg:
    // -(100 + 0.4)
    assert_eq!(
        h.balance("alice", "USDT").await,
        Balance::new(dec!(1899.2), dec!(100))
    );
}

#[tokio::test]
async fn inverse_margin_and_close_round_trip() {
    let h = harness();
    add_user(&h, "k1", "alice");
    h.storage.deposit("alice", "BTC", dec!(1));
    h.set_price("BTCUSD", ExchangeId::BinanceCoinm, dec!(50000));
    h.engine
        .set_leverage("k1", "secret-k1", &SmolStr::new("BTCUSD"), None, 5)
        .await
        .unwrap();

    // 10 contracts of 100 USD at 50000: margin = 1000/50000/5 = 0.004 BTC.
    h.engine
        .create_order(request(
            "k1",
            "BTCUSD",
            ExchangeId::BinanceCoinm,
            Side::Buy,
            OrderKind::Market,
            dec!(10),
            None,
        ))
        .await
        .unwrap();

    let positions = h
        .storage
        .user_open_positions(&SmolStr::new("alice"))
        .await
        .unwrap();
    assert_eq!(positions[0].margin, dec!(0.004));
    // taker = 5 * 0.0001; fee = 1000/50000 * 0.0005 = 0.00001 BTC
    assert_eq!(
        h.balance("alice", "BTC").await,
        Balance::new(dec!(0.99599), dec!(0.004))
    );
    // liq = 50000 * (1 - 1/5) * (1 - 0.0005)
    assert_eq!(positions[0].liquidation_price, dec!(39980));

    // Close at entry: only the fee is lost.
    let mut close = request(
        "k1",
        "BTCUSD",
        ExchangeId::BinanceCoinm,
        Side::Sell,
        OrderKind::Market,
        dec!(10),
        None,
    );
    close.reduce_only = true;
    h.engine.create_order(close).await.unwrap();

    assert_eq!(
        h.balance("alice", "BTC").await,
        Balance::new(dec!(0.99998), dec!(0))
    );
}

#[tokio::test]
async fn duplicate_external_id_is_rejected() {
    let h = harness();
    add_user(&h, "k1", "alice");
    h.storage.deposit("alice", "USDT", dec!(10000));
    h.set_price("BTCUSDT", ExchangeId::Binance, dec!(50000));

    let mut first = request(
        "k1",
        "BTCUSDT",
        ExchangeId::Binance,
        Side::Buy,
        OrderKind::Limit,
        dec!(0.01),
        Some(dec!(40000)),
    );
    first.external_id = Some(SmolStr::new("client-1"));
    h.engine.create_order(first.clone()).await.unwrap();

    let err = h.engine.create_order(first).await.unwrap_err();
    assert!(matches!(err, EngineError::DuplicateOrder));
}

#[tokio::test]
async fn insufficient_balance_leaves_no_state() {
    let h = harness();
    add_user(&h, "k1", "alice");
    h.storage.deposit("alice", "USDT", dec!(100));
    h.set_price("BTCUSDT", ExchangeId::Binance, dec!(50000));

    let err = h
        .engine
        .create_order(request(
            "k1",
            "BTCUSDT",
            ExchangeId::Binance,
            Side::Buy,
            OrderKind::Limit,
            dec!(0.1),
            Some(dec!(40000)),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientBalance { .. }));

    assert_eq!(
        h.balance("alice", "USDT").await,
        Balance::new(dec!(100), dec!(0))
    );
    assert!(h
        .storage
        .user_open_orders(&SmolStr::new("alice"))
        .await
        .unwrap()
        .is_empty());
    assert!(!h
        .engine
        .is_watching(&MarketChannel::new("BTCUSDT", ExchangeId::Binance)));
}

#[tokio::test]
async fn unknown_credentials_are_rejected() {
    let h = harness();
    let err = h
        .engine
        .create_order(request(
            "ghost",
            "BTCUSDT",
            ExchangeId::Binance,
            Side::Buy,
            OrderKind::Market,
            dec!(0.1),
            None,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UserNotFound));
}

#[tokio::test]
async fn hedge_mode_requires_position_side() {
    let h = harness();
    add_user(&h, "k1", "alice");
    h.storage.deposit("alice", "USDT", dec!(1000));
    h.set_price("BTCUSDT", ExchangeId::BinanceUsdm, dec!(50000));
    h.engine.set_hedge("k1", "secret-k1", true).await.unwrap();

    let err = h
        .engine
        .create_order(request(
            "k1",
            "BTCUSDT",
            ExchangeId::BinanceUsdm,
            Side::Buy,
            OrderKind::Market,
            dec!(0.01),
            None,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::HedgeModeRequiresSide));
}

// Reconciliation: rebuild, drift correction, and no-op on healthy state.
#[tokio::test]
async fn reconcile_rebuilds_and_corrects_drift() {
    let h = harness();
    add_user(&h, "k1", "alice");
    h.storage.deposit("alice", "USDT", dec!(10000));
    h.set_price("BTCUSDT", ExchangeId::Binance, dec!(50000));

    let order = h
        .engine
        .create_order(request(
            "k1",
            "BTCUSDT",
            ExchangeId::Binance,
            Side::Buy,
            OrderKind::Limit,
            dec!(0.1),
            Some(dec!(50000)),
        ))
        .await
        .unwrap();

    // Simulate a fresh process over the same storage, with drifted locked
    // balance and a stray locked wallet.
    let (feed, _commands) = feed_channel();
    let restarted = Engine::new(
        Arc::clone(&h.storage) as Arc<dyn Storage>,
        Arc::new(MemoryPush::new()) as Arc<dyn PushChannel>,
        Arc::new(StaticApi),
        PriceCache::default(),
        feed,
    );
    h.storage
        .set_balance(
            &SmolStr::new("alice"),
            "USDT",
            Balance::new(dec!(6000), dec!(4000)),
        )
        .await
        .unwrap();
    h.storage
        .set_balance(
            &SmolStr::new("alice"),
            "ETH",
            Balance::new(dec!(1), dec!(3)),
        )
        .await
        .unwrap();

    restarted.reconcile().await.unwrap();

    // The open order is projected and watched again.
    assert!(restarted.is_watching(&MarketChannel::new("BTCUSDT", ExchangeId::Binance)));
    // Locked snapped back to the open reservation (0.1 * 50000).
    assert_eq!(
        h.balance("alice", "USDT").await,
        Balance::new(dec!(5000), dec!(5000))
    );
    // Stray locked with no backing orders reset into free.
    assert_eq!(
        h.balance("alice", "ETH").await,
        Balance::new(dec!(4), dec!(0))
    );

    // Healthy state: a second pass changes nothing.
    restarted.reconcile().await.unwrap();
    assert_eq!(
        h.balance("alice", "USDT").await,
        Balance::new(dec!(5000), dec!(5000))
    );

    // The restarted engine can still fill the recovered order.
    restarted
        .process_ticks(
            ExchangeId::Binance,
            batch(tick(
                "BTCUSDT",
                ExchangeId::Binance,
                dec!(49999),
                dec!(50000),
                dec!(1),
                dec!(1),
            )),
        )
        .await;
    let filled = h
        .storage
        .order("BTCUSDT", &order.external_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(filled.status, OrderStatus::Filled);
}

#[tokio::test]
async fn reconcile_backfills_locked_leverage_side() {
    let h = harness();
    add_user(&h, "k1", "alice");
    h.storage.deposit("alice", "USDT", dec!(1000));
    h.set_price("BTCUSDT", ExchangeId::BinanceUsdm, dec!(50000));
    h.engine
        .create_order(request(
            "k1",
            "BTCUSDT",
            ExchangeId::BinanceUsdm,
            Side::Buy,
            OrderKind::Market,
            dec!(0.001),
            None,
        ))
        .await
        .unwrap();

    // Degrade the leverage row into the legacy keyless form.
    h.storage
        .remove_leverage(&SmolStr::new("alice"), "BTCUSDT", Some(PositionSide::Both))
        .await
        .unwrap();
    h.storage
        .upsert_leverage(&LeverageRow {
            user: SmolStr::new("alice"),
            symbol: SmolStr::new("BTCUSDT"),
            side: None,
            leverage: 1,
            locked: true,
        })
        .await
        .unwrap();

    let (feed, _commands) = feed_channel();
    let restarted = Engine::new(
        Arc::clone(&h.storage) as Arc<dyn Storage>,
        Arc::new(MemoryPush::new()) as Arc<dyn PushChannel>,
        Arc::new(StaticApi),
        PriceCache::default(),
        feed,
    );
    restarted.reconcile().await.unwrap();

    // One open long: the row takes its side.
    let rows = h
        .storage
        .leverage_rows(&SmolStr::new("alice"), "BTCUSDT")
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].side, Some(PositionSide::Long));
    assert!(rows[0].locked);
}

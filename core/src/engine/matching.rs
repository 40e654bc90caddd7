//! Per-exchange tick-batch matching.
//!
//! The engine is the feed's [`TickConsumer`]: batches for one exchange apply
//! in arrival order under the Ticker lock, never concurrently. For each
//! `(symbol, tick)` the scan runs liquidations first, then limit fills
//! against the touched side.

use crate::{
    engine::{settle::DerivSettle, Engine},
    error::EngineError,
    lock::keys,
    order::{Order, OrderKind, OrderStatus},
    position::Position,
};
use arara_data::{
    feed::MarketChannel,
    intake::{TickBatch, TickConsumer},
    ticker::Ticker,
};
use arara_markets::{ExchangeId, PositionSide, Side};
use async_trait::async_trait;
use chrono::Utc;
use itertools::Itertools;
use rust_decimal::Decimal;
use tracing::{debug, error};

#[async_trait]
impl TickConsumer for Engine {
    async fn process_ticks(&self, exchange: ExchangeId, batch: TickBatch) {
        let _guard = self.locks().acquire(keys::ticker(exchange)).await;
        for (symbol, tick) in &batch {
            self.match_symbol(exchange, symbol, tick).await;
        }
    }
}

impl Engine {
    async fn match_symbol(&self, exchange: ExchangeId, symbol: &str, tick: &Ticker) {
        for position in self.liquidation_candidates(exchange, symbol, tick) {
            self.liquidate_position(position).await;
        }
        for order in self.fill_candidates(exchange, symbol, tick) {
            if let Err(err) = self.fill_limit_order(&order, tick).await {
                error!(
                    external_id = %order.external_id,
                    symbol = %order.symbol,
                    %err,
                    "limit fill failed"
                );
            }
        }
    }

    /// Positions whose pre-computed liquidation price is touched: longs where
    /// the bid fell to it (worst liquidation price first), shorts where the
    /// ask rose to it.
    fn liquidation_candidates(
        &self,
        exchange: ExchangeId,
        symbol: &str,
        tick: &Ticker,
    ) -> Vec<Position> {
        let positions = self.projection().read().positions_for(symbol, exchange);

        let longs = positions
            .iter()
            .filter(|position| {
                position.position_side == PositionSide::Long
                    && position.liquidation_price >= tick.best_bid
            })
            .cloned()
            .sorted_by(|a, b| a.liquidation_price.cmp(&b.liquidation_price));
        let shorts = positions
            .iter()
            .filter(|position| {
                position.position_side == PositionSide::Short
                    && position.liquidation_price <= tick.best_ask
            })
            .cloned()
            .sorted_by(|a, b| b.liquidation_price.cmp(&a.liquidation_price));

        longs.chain(shorts).collect()
    }

    /// Open limit orders the tick crosses. Sells fill against the bid
    /// (lowest price first), buys against the ask (highest first). Spot also
    /// needs visible size on the touched side.
    fn fill_candidates(&self, exchange: ExchangeId, symbol: &str, tick: &Ticker) -> Vec<Order> {
        let spot = exchange.is_spot();
        let orders = self.projection().read().orders_for(symbol, exchange);

        let open_limit = |order: &&Order| {
            matches!(order.kind, OrderKind::Limit)
                && matches!(
                    order.status,
                    OrderStatus::New | OrderStatus::PartiallyFilled
                )
        };

        let sells = orders
            .iter()
            .filter(open_limit)
            .filter(|order| {
                order.side == Side::Sell
                    && tick.best_bid > Decimal::ZERO
                    && order.price <= tick.best_bid
                    && (!spot || tick.best_bid_qnt > Decimal::ZERO)
            })
            .cloned()
            .sorted_by(|a, b| a.price.cmp(&b.price));
        let buys = orders
            .iter()
            .filter(open_limit)
            .filter(|order| {
                order.side == Side::Buy
                    && tick.best_ask > Decimal::ZERO
                    && order.price >= tick.best_ask
                    && (!spot || tick.best_ask_qnt > Decimal::ZERO)
            })
            .cloned()
            .sorted_by(|a, b| b.price.cmp(&a.price));

        sells.chain(buys).collect()
    }

    /// Fill one limit order against the tick, under its UpdateOrder lock.
    async fn fill_limit_order(&self, candidate: &Order, tick: &Ticker) -> Result<(), EngineError> {
        let _guard = self
            .locks()
            .acquire(keys::update_order(&candidate.external_id))
            .await;

        // Re-fetch: the order may have been cancelled since the scan.
        let Some(mut order) = self
            .projection()
            .read()
            .order(&candidate.symbol, &candidate.external_id)
        else {
            return Ok(());
        };
        if order.is_terminal() {
            return Ok(());
        }
        let spec = self.symbols().get(&order.symbol, order.exchange).await?;

        if order.exchange.is_spot() {
            let (touched_price, touched_size) = match order.side {
                Side::Sell => (tick.best_bid, tick.best_bid_qnt),
                Side::Buy => (tick.best_ask, tick.best_ask_qnt),
            };
            let strictly_better = match order.side {
                Side::Sell => order.price < touched_price,
                Side::Buy => order.price > touched_price,
            };
            let fill = if strictly_better {
                order.remaining()
            } else {
                order.remaining().min(touched_size)
            };
            if fill <= Decimal::ZERO {
                return Ok(());
            }
            self.settle_spot_limit_fill(&spec, &mut order, fill).await?;
            self.storage().update_order(&order).await?;
            if order.is_terminal() {
                self.projection()
                    .write()
                    .remove_order(&order.symbol, &order.external_id);
                self.watch_remove(
                    &MarketChannel::new(order.symbol.clone(), order.exchange),
                    &order.external_id,
                );
            } else {
                self.projection().write().put_order(order.clone());
            }
        } else {
            // Derivatives fill the full remainder at the order price.
            let exec = order.price;
            match self.settle_derivative(&spec, &mut order, exec).await? {
                DerivSettle::Done => {
                    self.storage().update_order(&order).await?;
                }
                DerivSettle::RejectedNoPosition => {
                    // The position this reduce was resting against is gone.
                    debug!(
                        external_id = %order.external_id,
                        "expiring reduce order with no position left"
                    );
                    order.status = OrderStatus::Expired;
                    order.updated_at = Utc::now();
                    self.storage().update_order(&order).await?;
                }
            }
            self.projection()
                .write()
                .remove_order(&order.symbol, &order.external_id);
            self.watch_remove(
                &MarketChannel::new(order.symbol.clone(), order.exchange),
                &order.external_id,
            );
        }

        self.emit_order(&order).await;
        self.emit_balances(&order.user).await;
        Ok(())
    }
}

//! Forced position closes.
//!
//! When a tick touches a position's liquidation price, the engine first
//! expires every reduce-only open order of the same (user, symbol), then
//! submits a synthetic reduce-only market order at the liquidation price
//! through the shared settlement path. The liquidation path never raises to
//! any caller: if the synthetic order cannot be placed, the position is
//! force-closed in storage.

use crate::{
    engine::{settle::DerivSettle, Engine},
    error::EngineError,
    order::{Order, OrderKind, OrderStatus},
    position::{Position, PositionStatus},
};
use arara_data::feed::MarketChannel;
use arara_markets::{fee_rate, FeeRole, PositionSide};
use chrono::Utc;
use rust_decimal::Decimal;
use smol_str::SmolStr;
use tracing::{error, info, warn};
use uuid::Uuid;

impl Engine {
    /// Liquidate one position. Runs inside the Ticker frame; errors never
    /// propagate out of it.
    pub(crate) async fn liquidate_position(&self, snapshot: Position) {
        info!(
            uuid = %snapshot.uuid,
            user = %snapshot.user,
            symbol = %snapshot.symbol,
            liquidation_price = %snapshot.liquidation_price,
            "liquidating position"
        );

        // Clear the user's reduce-only orders on the symbol first; they were
        // resting against a position that is about to disappear.
        let reduce_orders: Vec<Order> = self
            .projection()
            .read()
            .orders_for(&snapshot.symbol, snapshot.exchange)
            .into_iter()
            .filter(|order| {
                order.user == snapshot.user && order.reduce_only && order.status.is_open()
            })
            .collect();
        for order in &reduce_orders {
            if let Err(err) = self.expire_order(order).await {
                warn!(
                    external_id = %order.external_id,
                    %err,
                    "failed to expire reduce-only order during liquidation"
                );
            }
        }

        if let Err(err) = self.submit_liquidation_order(&snapshot).await {
            error!(
                uuid = %snapshot.uuid,
                %err,
                "liquidation order failed, force-closing position"
            );
            self.force_close(snapshot).await;
        }
    }

    /// The synthetic market order: side opposite the position, reduce-only,
    /// executed at the pre-computed liquidation price. Entered below the
    /// CreateOrder lock (the Ticker frame is the outer lock here).
    async fn submit_liquidation_order(&self, position: &Position) -> Result<(), EngineError> {
        let spec = self
            .symbols()
            .get(&position.symbol, position.exchange)
            .await?;
        let hedge = self.storage().hedge(&position.user).await?;
        let scope = if hedge {
            position.position_side
        } else {
            PositionSide::Both
        };
        let exec = position.liquidation_price;
        let now = Utc::now();

        let mut order = Order {
            id: SmolStr::new(Uuid::new_v4().to_string()),
            external_id: SmolStr::new(format!("liquidation_{}", Uuid::new_v4())),
            user: position.user.clone(),
            symbol: position.symbol.clone(),
            exchange: position.exchange,
            side: position.position_side.entry_side().opposite(),
            kind: OrderKind::Market,
            price: exec,
            amount: position.amount,
            quote_amount: position.amount * exec,
            filled_amount: Decimal::ZERO,
            filled_quote_amount: Decimal::ZERO,
            avg_filled_price: Decimal::ZERO,
            fee: Decimal::ZERO,
            fee_rate: fee_rate(position.exchange.market_kind(), FeeRole::Taker),
            status: OrderStatus::New,
            reduce_only: true,
            position_side: Some(scope),
            created_at: now,
            updated_at: now,
        };
        self.storage().insert_order(&order).await?;

        match self.settle_derivative(&spec, &mut order, exec).await? {
            DerivSettle::Done => {
                self.storage().update_order(&order).await?;
                self.emit_order(&order).await;
                self.emit_balances(&order.user).await;
                Ok(())
            }
            DerivSettle::RejectedNoPosition => {
                // Closed by a concurrent path between the scan and here.
                order.status = OrderStatus::Expired;
                order.updated_at = Utc::now();
                self.storage().update_order(&order).await?;
                Ok(())
            }
        }
    }

    /// Last-resort close when the synthetic order cannot be placed: the
    /// position is closed in storage without settlement and dropped from the
    /// projection.
    pub(crate) async fn force_close(&self, mut position: Position) {
        position.status = PositionStatus::Closed;
        position.close_price = Some(position.liquidation_price);
        position.margin = Decimal::ZERO;
        position.updated_at = Utc::now();

        if let Err(err) = self.storage().upsert_position(&position).await {
            error!(uuid = %position.uuid, %err, "force-close persist failed");
        }
        self.projection()
            .write()
            .remove_position(&position.symbol, position.uuid);
        self.watch_remove(
            &MarketChannel::new(position.symbol.clone(), position.exchange),
            &position.uuid.to_string(),
        );
        if let Err(err) = self
            .unlock_leverage(&position.user, &position.symbol)
            .await
        {
            warn!(uuid = %position.uuid, %err, "force-close leverage unlock failed");
        }
    }
}

//! Order cancellation and the shared expire path.
//!
//! Cancels run under the UpdateOrder lock for the order's external id.
//! Terminal orders are rejected; live spot limit orders release their
//! unfilled reservation on the way out.

use crate::{
    engine::Engine,
    error::EngineError,
    lock::keys,
    order::{Order, OrderKind, OrderStatus},
};
use arara_data::feed::MarketChannel;
use arara_markets::Side;
use chrono::Utc;
use smol_str::SmolStr;
use tracing::info;

/// Which order a cancel targets.
#[derive(Debug, Clone)]
pub enum CancelTarget {
    External { symbol: SmolStr, external_id: SmolStr },
    Id(SmolStr),
}

#[derive(Debug, Clone)]
pub struct CancelRequest {
    pub key: String,
    pub secret: String,
    pub target: CancelTarget,
    /// Record the terminal state as `EXPIRED` instead of `CANCELED`.
    pub expire: bool,
}

impl Engine {
    /// Cancel a live order for the caller.
    pub async fn cancel_order(&self, request: CancelRequest) -> Result<Order, EngineError> {
        let user = self.authenticate(&request.key, &request.secret).await?;

        let (symbol, external_id) = match &request.target {
            CancelTarget::External {
                symbol,
                external_id,
            } => (symbol.clone(), external_id.clone()),
            CancelTarget::Id(id) => {
                let order = self
                    .storage()
                    .order_by_id(id)
                    .await?
                    .ok_or(EngineError::OrderNotFound)?;
                (order.symbol, order.external_id)
            }
        };

        let _guard = self.locks().acquire(keys::update_order(&external_id)).await;

        // Projection first (live path), storage as authority for the
        // terminal-state rejection.
        let order = match self.projection().read().order(&symbol, &external_id) {
            Some(order) => order,
            None => self
                .storage()
                .order(&symbol, &external_id)
                .await?
                .ok_or(EngineError::OrderNotFound)?,
        };
        if order.user != user {
            return Err(EngineError::OrderNotFound);
        }
        if order.is_terminal() {
            return Err(EngineError::OrderTerminal(order.status));
        }

        let status = if request.expire {
            OrderStatus::Expired
        } else {
            OrderStatus::Canceled
        };
        self.finish_open_order(order, status).await
    }

    /// Expire a live order from the engine side (liquidation cancelling the
    /// user's reduce-only orders). Takes the UpdateOrder lock itself.
    pub(crate) async fn expire_order(&self, snapshot: &Order) -> Result<(), EngineError> {
        let _guard = self
            .locks()
            .acquire(keys::update_order(&snapshot.external_id))
            .await;
        let Some(order) = self
            .projection()
            .read()
            .order(&snapshot.symbol, &snapshot.external_id)
        else {
            return Ok(());
        };
        if order.is_terminal() {
            return Ok(());
        }
        self.finish_open_order(order, OrderStatus::Expired).await?;
        Ok(())
    }

    /// Terminal transition shared by cancel and expire: release the spot
    /// reservation, persist, un-project, un-watch, emit.
    async fn finish_open_order(
        &self,
        mut order: Order,
        status: OrderStatus,
    ) -> Result<Order, EngineError> {
        if matches!(order.kind, OrderKind::Limit) && order.exchange.is_spot() {
            let spec = self.symbols().get(&order.symbol, order.exchange).await?;
            let (asset, unfilled) = match order.side {
                Side::Buy => (
                    spec.quote.name.clone(),
                    order.quote_amount - order.filled_quote_amount,
                ),
                Side::Sell => (spec.base.name.clone(), order.amount - order.filled_amount),
            };
            self.storage()
                .apply_balance(&order.user, &asset, unfilled, -unfilled)
                .await?;
        }

        order.status = status;
        order.updated_at = Utc::now();
        self.storage().update_order(&order).await?;
        self.projection()
            .write()
            .remove_order(&order.symbol, &order.external_id);
        self.watch_remove(
            &MarketChannel::new(order.symbol.clone(), order.exchange),
            &order.external_id,
        );
        info!(
            external_id = %order.external_id,
            symbol = %order.symbol,
            status = ?order.status,
            "order closed out"
        );
        self.emit_order(&order).await;
        self.emit_balances(&order.user).await;
        Ok(order)
    }
}

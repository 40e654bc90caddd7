//! Order creation: validation, marketable-limit promotion, booking.
//!
//! Market orders (including promoted marketable limits) settle immediately at
//! the current price; limit orders are persisted, reserved (spot), projected,
//! and watched. The whole operation runs under the CreateOrder lock keyed by
//! `key‖secret‖symbol‖exchange`.

use crate::{
    engine::{settle::DerivSettle, Engine},
    error::EngineError,
    lock::keys,
    order::{Order, OrderKind, OrderStatus},
    position::Position,
    Symbol, UserId,
};
use arara_data::feed::MarketChannel;
use arara_markets::{fee_rate, ExchangeId, FeeRole, PositionSide, Side, SymbolSpec};
use chrono::Utc;
use rust_decimal::Decimal;
use smol_str::SmolStr;
use tracing::{debug, info};
use uuid::Uuid;

/// A client order request, as it arrives from the REST edge.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub key: String,
    pub secret: String,
    pub symbol: Symbol,
    pub exchange: ExchangeId,
    pub side: Side,
    pub kind: OrderKind,
    /// Required for limit orders; ignored for market orders.
    pub price: Option<Decimal>,
    pub amount: Decimal,
    /// Client order id; generated when absent.
    pub external_id: Option<SmolStr>,
    pub reduce_only: bool,
    /// Required (`LONG`/`SHORT`) when the user has hedge mode on.
    pub position_side: Option<PositionSide>,
}

/// How the order will execute, decided at entry.
enum Booking {
    /// Immediate execution at this price.
    Market(Decimal),
    /// Rest in the book at this price.
    Limit(Decimal),
}

impl Engine {
    /// Validate, book, and (for market orders) settle a client order.
    pub async fn create_order(&self, request: OrderRequest) -> Result<Order, EngineError> {
        let user = self.authenticate(&request.key, &request.secret).await?;
        let _guard = self
            .locks()
            .acquire(keys::create_order(
                &request.key,
                &request.secret,
                &request.symbol,
                request.exchange,
            ))
            .await;
        self.place_order(user, request).await
    }

    /// Placement routine, entered once the CreateOrder lock is held.
    async fn place_order(
        &self,
        user: UserId,
        request: OrderRequest,
    ) -> Result<Order, EngineError> {
        if request.amount <= Decimal::ZERO {
            return Err(EngineError::InvalidAmount);
        }
        let spec = self
            .symbols()
            .get(&request.symbol, request.exchange)
            .await?;
        let derivatives = request.exchange.is_derivatives();

        let side_key = if derivatives {
            Some(self.resolve_position_scope(&user, &request).await?)
        } else {
            None
        };

        let booking = self.resolve_booking(&request).await?;
        let used_price = match booking {
            Booking::Market(price) | Booking::Limit(price) => price,
        };

        let existing = side_key.map(|scope| {
            self.find_user_position(&user, &request.symbol, request.exchange, scope)
        });
        self.check_balance(
            &user,
            &spec,
            &request,
            side_key,
            used_price,
            existing.flatten().as_ref(),
        )
        .await?;

        let (kind, price, role) = match booking {
            Booking::Market(exec) => (OrderKind::Market, exec, FeeRole::Taker),
            Booking::Limit(price) => (OrderKind::Limit, price, FeeRole::Maker),
        };
        if matches!(kind, OrderKind::Limit) {
            let resting = self
                .projection()
                .read()
                .orders_for(&request.symbol, request.exchange)
                .into_iter()
                .filter(|order| order.user == user)
                .count();
            if resting as u32 >= spec.max_orders {
                return Err(EngineError::MaxOrdersExceeded(spec.max_orders));
            }
        }
        let now = Utc::now();
        let mut order = Order {
            id: SmolStr::new(Uuid::new_v4().to_string()),
            external_id: request
                .external_id
                .clone()
                .unwrap_or_else(|| SmolStr::new(Uuid::new_v4().to_string())),
            user: user.clone(),
            symbol: request.symbol.clone(),
            exchange: request.exchange,
            side: request.side,
            kind,
            price,
            amount: request.amount,
            quote_amount: request.amount * price,
            filled_amount: Decimal::ZERO,
            filled_quote_amount: Decimal::ZERO,
            avg_filled_price: Decimal::ZERO,
            fee: Decimal::ZERO,
            fee_rate: fee_rate(request.exchange.market_kind(), role),
            status: OrderStatus::New,
            reduce_only: derivatives && request.reduce_only,
            position_side: side_key,
            created_at: now,
            updated_at: now,
        };
        // Uniqueness of (external_id, symbol) is enforced here.
        self.storage().insert_order(&order).await?;

        match kind {
            OrderKind::Market => {
                if derivatives {
                    if let DerivSettle::RejectedNoPosition =
                        self.settle_derivative(&spec, &mut order, price).await?
                    {
                        order.status = OrderStatus::Expired;
                        order.updated_at = Utc::now();
                        self.storage().update_order(&order).await?;
                        self.emit_order(&order).await;
                        return Err(EngineError::ReduceOrderRejected);
                    }
                } else {
                    self.settle_spot_market(&spec, &mut order, price).await?;
                }
                self.storage().update_order(&order).await?;
                info!(
                    external_id = %order.external_id,
                    symbol = %order.symbol,
                    exchange = %order.exchange,
                    side = %order.side,
                    price = %order.avg_filled_price,
                    "market order settled"
                );
            }
            OrderKind::Limit => {
                if !derivatives {
                    let (asset, reservation) = match order.side {
                        Side::Buy => (spec.quote.name.clone(), order.quote_amount),
                        Side::Sell => (spec.base.name.clone(), order.amount),
                    };
                    self.storage()
                        .apply_balance(&user, &asset, -reservation, reservation)
                        .await?;
                }
                self.projection().write().put_order(order.clone());
                self.watch_add(
                    MarketChannel::new(order.symbol.clone(), order.exchange),
                    order.external_id.clone(),
                );
                info!(
                    external_id = %order.external_id,
                    symbol = %order.symbol,
                    exchange = %order.exchange,
                    side = %order.side,
                    price = %order.price,
                    "limit order booked"
                );
            }
        }

        self.emit_order(&order).await;
        self.emit_balances(&user).await;
        Ok(order)
    }

    /// Resolve the derivatives position scope: the requested side in hedge
    /// mode, `Both` in one-way mode. Ensures the leverage row exists.
    async fn resolve_position_scope(
        &self,
        user: &UserId,
        request: &OrderRequest,
    ) -> Result<PositionSide, EngineError> {
        let hedge = self.storage().hedge(user).await?;
        let scope = if hedge {
            match request.position_side {
                Some(side @ (PositionSide::Long | PositionSide::Short)) => side,
                _ => return Err(EngineError::HedgeModeRequiresSide),
            }
        } else {
            PositionSide::Both
        };
        self.ensure_leverage_row(user, &request.symbol, scope)
            .await?;
        Ok(scope)
    }

    /// Decide the effective order kind. A limit that crosses the current
    /// price (buy above, sell below) is promoted to market at that price.
    async fn resolve_booking(&self, request: &OrderRequest) -> Result<Booking, EngineError> {
        match request.kind {
            OrderKind::Market => Ok(Booking::Market(
                self.current_price(&request.symbol, request.exchange).await?,
            )),
            OrderKind::Limit => {
                let limit_price = request.price.ok_or(EngineError::PriceRequired)?;
                if limit_price <= Decimal::ZERO {
                    return Err(EngineError::PriceRequired);
                }
                match self.current_price(&request.symbol, request.exchange).await {
                    Ok(current) => {
                        let marketable = match request.side {
                            Side::Buy => limit_price > current,
                            Side::Sell => limit_price < current,
                        };
                        if marketable {
                            Ok(Booking::Market(current))
                        } else {
                            Ok(Booking::Limit(limit_price))
                        }
                    }
                    Err(error) => {
                        // No reference price: book as-is, the tick path will
                        // fill it when quotes arrive.
                        debug!(symbol = %request.symbol, %error, "skipping marketable check");
                        Ok(Booking::Limit(limit_price))
                    }
                }
            }
        }
    }

    /// Pre-trade balance/position admission checks.
    async fn check_balance(
        &self,
        user: &UserId,
        spec: &SymbolSpec,
        request: &OrderRequest,
        side_key: Option<PositionSide>,
        used_price: Decimal,
        existing: Option<&Position>,
    ) -> Result<(), EngineError> {
        let Some(scope) = side_key else {
            // Spot: full notional (buy) or full amount (sell) must be free.
            let (asset, needed) = match request.side {
                Side::Buy => (&spec.quote.name, request.amount * used_price),
                Side::Sell => (&spec.base.name, request.amount),
            };
            return self.require_free(user, asset, needed).await;
        };

        let matching = match (scope, existing) {
            (PositionSide::Both, Some(position)) => {
                request.side == position.position_side.entry_side()
            }
            (PositionSide::Both, None) => true,
            // Hedge scope: buys grow a long scope, sells grow a short scope.
            (scope, _) => request.side == scope.entry_side(),
        };

        if request.reduce_only {
            // Reduce-only must have an opposite-direction position to shrink.
            if matching || existing.is_none() {
                return Err(EngineError::ReduceOrderRejected);
            }
            return Ok(());
        }
        if !matching && existing.is_none() {
            // A hedge-scope order against an empty scope has nothing to
            // reduce and cannot open the opposite side.
            return Err(EngineError::ReduceOrderRejected);
        }

        let leverage = self
            .ensure_leverage_row(user, &request.symbol, scope)
            .await?
            .leverage;
        let margin_amount = if matching {
            request.amount
        } else {
            let existing_amount = existing.map(|p| p.amount).unwrap_or_default();
            (request.amount - existing_amount).max(Decimal::ZERO)
        };
        let needed = super::settle::margin_required(spec, margin_amount, used_price, leverage);
        self.require_free(user, spec.margin_asset(), needed).await
    }

    async fn require_free(
        &self,
        user: &UserId,
        asset: &str,
        needed: Decimal,
    ) -> Result<(), EngineError> {
        let balance = self.storage().balance(user, asset).await?;
        if balance.free < needed {
            return Err(EngineError::InsufficientBalance {
                asset: asset.to_string(),
                needed,
                free: balance.free,
            });
        }
        Ok(())
    }

    /// The user's open position within a scope: the scope's side in hedge
    /// mode, the single netted position in one-way mode.
    pub(crate) fn find_user_position(
        &self,
        user: &UserId,
        symbol: &str,
        exchange: ExchangeId,
        scope: PositionSide,
    ) -> Option<Position> {
        self.projection()
            .read()
            .user_positions(user, symbol, exchange)
            .into_iter()
            .find(|position| match scope {
                PositionSide::Both => true,
                side => position.position_side == side,
            })
    }
}

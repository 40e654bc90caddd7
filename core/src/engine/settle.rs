//! Settlement: balance and position transitions for spot and derivatives.
//!
//! Write order on every settlement is persist the order/position transition,
//! then update the wallet (atomic per row), then emit events. Position
//! mutations run under the Common lock for the position's uuid; the leverage
//! helpers in [`super::account`] take the Common leverage lock underneath.
//!
//! Derivatives cases, resolved against the user's position in the order's
//! scope (the requested side in hedge mode, the single netted position in
//! one-way mode):
//!
//! 1. no prior position: open;
//! 2. same direction: increase, re-derive the liquidation price;
//! 3. opposite, remainder below the close threshold: full close;
//! 4. opposite, exceeding the position (not reduce-only): close then flip;
//! 5. opposite, reduce-only over-fill: trim the order, refund the
//!    proportional fee, then close;
//! 6. opposite, smaller: partial reduce.

use crate::{
    engine::Engine,
    error::EngineError,
    lock::keys,
    order::Order,
    position::{liquidation_price, Position, PositionStatus},
};
use arara_data::feed::MarketChannel;
use arara_markets::{PositionSide, Side, SymbolSpec};
use chrono::Utc;
use rust_decimal::Decimal;
use smol_str::SmolStr;
use tracing::info;
use uuid::Uuid;

/// Outcome of a derivatives settlement attempt.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum DerivSettle {
    Done,
    /// Reduce-only (or hedge-scope reduce) with nothing left to reduce.
    RejectedNoPosition,
}

/// Initial margin for `amount` at `price` under `leverage`. Inverse contracts
/// margin in base units through the contract size.
pub(crate) fn margin_required(
    spec: &SymbolSpec,
    amount: Decimal,
    price: Decimal,
    leverage: u32,
) -> Decimal {
    let leverage = Decimal::from(leverage.max(1));
    if spec.exchange.is_inverse() {
        amount * spec.contract_size() / price / leverage
    } else {
        amount * price / leverage
    }
}

/// Fee for trading `amount` at `price`: quote-denominated for linear,
/// base-denominated for inverse.
pub(crate) fn derivative_fee(
    spec: &SymbolSpec,
    amount: Decimal,
    price: Decimal,
    rate: Decimal,
) -> Decimal {
    if spec.exchange.is_inverse() {
        amount * spec.contract_size() / price * rate
    } else {
        amount * price * rate
    }
}

/// Realized PnL of closing `amount` of a position, fee deducted.
fn realized_pnl(
    spec: &SymbolSpec,
    direction: Decimal,
    amount: Decimal,
    entry: Decimal,
    close: Decimal,
    fee: Decimal,
) -> Decimal {
    if spec.exchange.is_inverse() {
        let size = spec.contract_size();
        (amount * size / entry - amount * size / close) * direction - fee
    } else {
        (amount * close - amount * entry) * direction - fee
    }
}

impl Engine {
    /// Settle a spot market execution at `exec`, in full.
    pub(crate) async fn settle_spot_market(
        &self,
        spec: &SymbolSpec,
        order: &mut Order,
        exec: Decimal,
    ) -> Result<(), EngineError> {
        let amount = order.remaining();
        let user = order.user.clone();
        match order.side {
            Side::Buy => {
                let fee = amount * order.fee_rate;
                self.storage()
                    .apply_balance(&user, &spec.quote.name, -(amount * exec), Decimal::ZERO)
                    .await?;
                self.storage()
                    .apply_balance(&user, &spec.base.name, amount - fee, Decimal::ZERO)
                    .await?;
                order.record_fill(amount, exec, fee);
            }
            Side::Sell => {
                let fee = amount * exec * order.fee_rate;
                self.storage()
                    .apply_balance(&user, &spec.base.name, -amount, Decimal::ZERO)
                    .await?;
                self.storage()
                    .apply_balance(&user, &spec.quote.name, amount * exec - fee, Decimal::ZERO)
                    .await?;
                order.record_fill(amount, exec, fee);
            }
        }
        Ok(())
    }

    /// Settle a spot limit fill of `fill` at the order's price, consuming the
    /// reservation made at booking.
    pub(crate) async fn settle_spot_limit_fill(
        &self,
        spec: &SymbolSpec,
        order: &mut Order,
        fill: Decimal,
    ) -> Result<(), EngineError> {
        let price = order.price;
        let user = order.user.clone();
        match order.side {
            Side::Buy => {
                let fee = fill * order.fee_rate;
                self.storage()
                    .apply_balance(&user, &spec.quote.name, Decimal::ZERO, -(fill * price))
                    .await?;
                self.storage()
                    .apply_balance(&user, &spec.base.name, fill - fee, Decimal::ZERO)
                    .await?;
                order.record_fill(fill, price, fee);
            }
            Side::Sell => {
                let fee = fill * price * order.fee_rate;
                self.storage()
                    .apply_balance(&user, &spec.base.name, Decimal::ZERO, -fill)
                    .await?;
                self.storage()
                    .apply_balance(&user, &spec.quote.name, fill * price - fee, Decimal::ZERO)
                    .await?;
                order.record_fill(fill, price, fee);
            }
        }
        Ok(())
    }

    /// Settle a derivatives execution of the order's remainder at `exec`.
    pub(crate) async fn settle_derivative(
        &self,
        spec: &SymbolSpec,
        order: &mut Order,
        exec: Decimal,
    ) -> Result<DerivSettle, EngineError> {
        let scope = order.position_side.unwrap_or(PositionSide::Both);
        let user = order.user.clone();

        let Some(snapshot) =
            self.find_user_position(&user, &order.symbol, order.exchange, scope)
        else {
            return self.derivative_open(spec, order, exec, scope).await;
        };

        // Mutations on an existing position serialize on its uuid; re-fetch
        // after acquiring, the snapshot may have been closed meanwhile.
        let _guard = self.locks().acquire(keys::position(snapshot.uuid)).await;
        let current = self
            .projection()
            .read()
            .position(&order.symbol, snapshot.uuid);
        let Some(current) = current.filter(Position::is_open) else {
            return self.derivative_open(spec, order, exec, scope).await;
        };

        if order.side == current.position_side.entry_side() {
            self.derivative_increase(spec, order, exec, current).await
        } else {
            self.derivative_reduce(spec, order, exec, scope, current)
                .await
        }
    }

    /// Case 1: no prior position in scope.
    async fn derivative_open(
        &self,
        spec: &SymbolSpec,
        order: &mut Order,
        exec: Decimal,
        scope: PositionSide,
    ) -> Result<DerivSettle, EngineError> {
        if order.reduce_only {
            return Ok(DerivSettle::RejectedNoPosition);
        }
        if !matches!(scope, PositionSide::Both) && order.side != scope.entry_side() {
            // Hedge scope with nothing to reduce.
            return Ok(DerivSettle::RejectedNoPosition);
        }

        let user = order.user.clone();
        let amount = order.remaining();
        let leverage = self.leverage_for(&user, &order.symbol, scope).await?;
        let margin = margin_required(spec, amount, exec, leverage);
        let fee = derivative_fee(spec, amount, exec, order.fee_rate);
        let side = order.side.opens();
        let now = Utc::now();

        let position = Position {
            uuid: Uuid::new_v4(),
            user: user.clone(),
            symbol: order.symbol.clone(),
            exchange: order.exchange,
            position_side: side,
            amount,
            entry_price: exec,
            margin,
            liquidation_price: liquidation_price(exec, side, order.fee_rate, leverage),
            leverage,
            profit: -fee,
            fee,
            status: PositionStatus::Open,
            close_price: None,
            created_at: now,
            updated_at: now,
        };

        self.storage().upsert_position(&position).await?;
        self.lock_leverage(&user, &order.symbol, scope, leverage)
            .await?;
        self.storage()
            .apply_balance(&user, spec.margin_asset(), -(margin + fee), margin)
            .await?;
        self.projection().write().put_position(position.clone());
        self.watch_add(
            MarketChannel::new(order.symbol.clone(), order.exchange),
            SmolStr::new(position.uuid.to_string()),
        );
        order.record_fill(amount, exec, fee);
        info!(
            uuid = %position.uuid,
            symbol = %position.symbol,
            side = %position.position_side,
            entry = %exec,
            margin = %margin,
            "position opened"
        );
        Ok(DerivSettle::Done)
    }

    /// Case 2: same direction, increase and re-derive the liquidation price.
    async fn derivative_increase(
        &self,
        spec: &SymbolSpec,
        order: &mut Order,
        exec: Decimal,
        mut current: Position,
    ) -> Result<DerivSettle, EngineError> {
        let user = order.user.clone();
        let amount = order.remaining();
        let fee = derivative_fee(spec, amount, exec, order.fee_rate);
        let margin = margin_required(spec, amount, exec, current.leverage);

        let new_amount = current.amount + amount;
        current.entry_price =
            (current.amount * current.entry_price + amount * exec) / new_amount;
        current.amount = new_amount;
        current.margin += margin;
        current.liquidation_price = liquidation_price(
            current.entry_price,
            current.position_side,
            order.fee_rate,
            current.leverage,
        );
        current.profit -= fee;
        current.fee += fee;
        current.updated_at = Utc::now();

        self.storage().upsert_position(&current).await?;
        self.storage()
            .apply_balance(&user, spec.margin_asset(), -(margin + fee), margin)
            .await?;
        self.projection().write().put_position(current);
        order.record_fill(amount, exec, fee);
        Ok(DerivSettle::Done)
    }

    /// Cases 3–6: opposite direction.
    async fn derivative_reduce(
        &self,
        spec: &SymbolSpec,
        order: &mut Order,
        exec: Decimal,
        scope: PositionSide,
        mut current: Position,
    ) -> Result<DerivSettle, EngineError> {
        let user = order.user.clone();

        // Case 5: reduce-only never fills beyond the position; the order is
        // rewritten down and the fee on the excess refunded proportionally.
        if order.reduce_only && order.remaining() > current.amount {
            order.trim_to(order.filled_amount + current.amount);
        }
        let amount = order.remaining();
        let fee = derivative_fee(spec, amount, exec, order.fee_rate);
        let margin = margin_required(spec, amount, exec, current.leverage);
        let threshold = spec.close_threshold();

        if current.amount - amount >= threshold {
            // Case 6: partial reduce.
            let pnl = realized_pnl(
                spec,
                current.direction(),
                amount,
                current.entry_price,
                exec,
                fee,
            );
            current.amount -= amount;
            current.margin -= margin;
            current.profit += pnl;
            current.fee += fee;
            current.updated_at = Utc::now();

            self.storage().upsert_position(&current).await?;
            self.storage()
                .apply_balance(&user, spec.margin_asset(), margin + pnl, -margin)
                .await?;
            self.projection().write().put_position(current);
            order.record_fill(amount, exec, fee);
            return Ok(DerivSettle::Done);
        }

        // Cases 3/4: the position is fully consumed.
        let closed_amount = current.amount;
        let remainder = amount - closed_amount;
        let flip = !order.reduce_only && remainder >= threshold;
        let closing_fee = if flip {
            derivative_fee(spec, closed_amount, exec, order.fee_rate)
        } else {
            fee
        };

        let pnl = realized_pnl(
            spec,
            current.direction(),
            closed_amount,
            current.entry_price,
            exec,
            closing_fee,
        );
        let margin_returned = current.margin;
        let closed_entry = current.entry_price;
        let closed_leverage = current.leverage;
        current.status = PositionStatus::Closed;
        current.close_price = Some(exec);
        current.profit += pnl;
        current.fee += closing_fee;
        current.margin = Decimal::ZERO;
        current.updated_at = Utc::now();

        self.storage().upsert_position(&current).await?;
        self.storage()
            .apply_balance(
                &user,
                spec.margin_asset(),
                margin_returned + pnl,
                -margin_returned,
            )
            .await?;
        self.projection()
            .write()
            .remove_position(&order.symbol, current.uuid);
        self.watch_remove(
            &MarketChannel::new(order.symbol.clone(), order.exchange),
            &current.uuid.to_string(),
        );
        self.unlock_leverage(&user, &order.symbol).await?;
        info!(
            uuid = %current.uuid,
            symbol = %current.symbol,
            close = %exec,
            pnl = %pnl,
            "position closed"
        );

        if flip {
            // Case 4: open the opposite leg for the remainder, unwinding the
            // old leg's margin at its entry price. The new leg's leverage
            // scope is its own direction, not the order's requested scope: a
            // hedge-mode overfill against a Long flips into the Short row,
            // which must be the one read and locked. One-way keeps the
            // netted Both scope.
            let diff_margin =
                margin_required(spec, closed_amount, closed_entry, closed_leverage);
            let open_margin = margin - diff_margin;
            let open_fee = fee - closing_fee;
            let side = order.side.opens();
            let leg_scope = if matches!(scope, PositionSide::Both) {
                PositionSide::Both
            } else {
                side
            };
            let now = Utc::now();
            let leverage = self.leverage_for(&user, &order.symbol, leg_scope).await?;

            let position = Position {
                uuid: Uuid::new_v4(),
                user: user.clone(),
                symbol: order.symbol.clone(),
                exchange: order.exchange,
                position_side: side,
                amount: remainder,
                entry_price: exec,
                margin: open_margin,
                liquidation_price: liquidation_price(exec, side, order.fee_rate, leverage),
                leverage,
                profit: -open_fee,
                fee: open_fee,
                status: PositionStatus::Open,
                close_price: None,
                created_at: now,
                updated_at: now,
            };
            self.storage().upsert_position(&position).await?;
            self.lock_leverage(&user, &order.symbol, leg_scope, leverage)
                .await?;
            self.storage()
                .apply_balance(
                    &user,
                    spec.margin_asset(),
                    -(open_margin + open_fee),
                    open_margin,
                )
                .await?;
            self.projection().write().put_position(position.clone());
            self.watch_add(
                MarketChannel::new(order.symbol.clone(), order.exchange),
                SmolStr::new(position.uuid.to_string()),
            );
            order.record_fill(amount, exec, fee);
        } else {
            order.record_fill(amount, exec, closing_fee);
        }
        Ok(DerivSettle::Done)
    }
}

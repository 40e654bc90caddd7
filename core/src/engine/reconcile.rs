//! Startup reconciliation.
//!
//! Rebuilds the projection and watch set from storage, recomputes the locked
//! balance every wallet row should carry from the open orders and positions
//! that back it, corrects drift in place, and backfills legacy leverage rows
//! that are locked without a side.

use crate::{engine::Engine, error::EngineError, Asset, UserId};
use arara_data::{feed::MarketChannel, FnvIndexMap};
use arara_markets::{PositionSide, Side};
use rust_decimal::Decimal;
use smol_str::SmolStr;
use tracing::{info, warn};

impl Engine {
    /// Run once at startup, before the feed driver starts delivering ticks.
    /// A second run on healthy state is a no-op.
    pub async fn reconcile(&self) -> Result<(), EngineError> {
        let orders = self.storage().open_limit_orders().await?;
        let positions = self.storage().open_positions().await?;

        // 1. Rebuild the projection, then the watch set (subscribing once per
        // channel through the normal first-holder edge).
        {
            let mut projection = self.projection().write();
            for order in &orders {
                projection.put_order(order.clone());
            }
            for position in &positions {
                projection.put_position(position.clone());
            }
        }
        for order in &orders {
            self.watch_add(
                MarketChannel::new(order.symbol.clone(), order.exchange),
                order.external_id.clone(),
            );
        }
        for position in &positions {
            self.watch_add(
                MarketChannel::new(position.symbol.clone(), position.exchange),
                SmolStr::new(position.uuid.to_string()),
            );
        }

        // 2. Expected locked balance per (user, asset): spot reservations
        // plus open-position margins.
        let mut expected: FnvIndexMap<(UserId, Asset), Decimal> = FnvIndexMap::default();
        for order in &orders {
            if !order.exchange.is_spot() {
                continue;
            }
            let spec = self.symbols().get(&order.symbol, order.exchange).await?;
            let (asset, reserved) = match order.side {
                Side::Buy => (
                    spec.quote.name.clone(),
                    order.quote_amount - order.filled_quote_amount,
                ),
                Side::Sell => (spec.base.name.clone(), order.amount - order.filled_amount),
            };
            *expected.entry((order.user.clone(), asset)).or_default() += reserved;
        }
        for position in &positions {
            let spec = self
                .symbols()
                .get(&position.symbol, position.exchange)
                .await?;
            *expected
                .entry((position.user.clone(), spec.margin_asset().clone()))
                .or_default() += position.margin;
        }

        // 3. Correct drift: move the difference between free and locked; a
        // locked remainder with no backing resets outright.
        for (user, asset, stored) in self.storage().all_balances().await? {
            let want = expected
                .get(&(user.clone(), asset.clone()))
                .copied()
                .unwrap_or(Decimal::ZERO);
            if stored.locked == want {
                continue;
            }
            warn!(
                %user,
                %asset,
                locked = %stored.locked,
                expected = %want,
                "correcting locked-balance drift"
            );
            let corrected = if want.is_zero() {
                crate::balance::Balance::new(
                    stored.free + stored.locked.max(Decimal::ZERO),
                    Decimal::ZERO,
                )
            } else {
                crate::balance::Balance::new(stored.free + (stored.locked - want), want)
            };
            self.storage().set_balance(&user, &asset, corrected).await?;
        }

        // 4. Backfill legacy leverage rows locked without a side.
        for row in self.storage().all_leverage_rows().await? {
            if !row.locked || row.side.is_some() {
                continue;
            }
            let open = self
                .projection()
                .read()
                .user_positions_symbol(&row.user, &row.symbol);
            let hedge = self.storage().hedge(&row.user).await?;

            self.storage()
                .remove_leverage(&row.user, &row.symbol, None)
                .await?;
            let sides: Vec<PositionSide> = if hedge && open.len() >= 2 {
                vec![PositionSide::Long, PositionSide::Short]
            } else if open.len() == 1 {
                vec![open[0].position_side]
            } else {
                vec![PositionSide::Both]
            };
            for side in sides {
                let mut replacement = row.clone();
                replacement.side = Some(side);
                self.storage().upsert_leverage(&replacement).await?;
            }
        }

        info!(
            orders = orders.len(),
            positions = positions.len(),
            "reconciliation complete"
        );
        Ok(())
    }
}

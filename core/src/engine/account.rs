//! User account operations: leverage, hedge mode, and read queries.

use crate::{
    balance::Balance,
    engine::Engine,
    error::EngineError,
    lock::keys,
    order::Order,
    position::Position,
    storage::LeverageRow,
    Asset, Symbol, UserId,
};
use arara_markets::PositionSide;
use tracing::info;

/// Leverage accepted by the venue.
pub const LEVERAGE_RANGE: std::ops::RangeInclusive<u32> = 1..=125;

impl Engine {
    /// Set leverage for a (user, symbol, side) scope. Rejected while any open
    /// position holds the row locked.
    pub async fn set_leverage(
        &self,
        key: &str,
        secret: &str,
        symbol: &Symbol,
        side: Option<PositionSide>,
        leverage: u32,
    ) -> Result<LeverageRow, EngineError> {
        if !LEVERAGE_RANGE.contains(&leverage) {
            return Err(EngineError::InvalidLeverage(leverage));
        }
        let user = self.authenticate(key, secret).await?;

        let hedge = self.storage().hedge(&user).await?;
        let scope = if hedge {
            match side {
                Some(side @ (PositionSide::Long | PositionSide::Short)) => side,
                _ => return Err(EngineError::HedgeModeRequiresSide),
            }
        } else {
            PositionSide::Both
        };

        let _guard = self.locks().acquire(keys::leverage(&user, symbol)).await;
        let existing = self.storage().leverage(&user, symbol, Some(scope)).await?;
        if existing.as_ref().is_some_and(|row| row.locked) {
            return Err(EngineError::LeverageLocked);
        }
        let row = LeverageRow {
            user: user.clone(),
            symbol: symbol.clone(),
            side: Some(scope),
            leverage,
            locked: false,
        };
        self.storage().upsert_leverage(&row).await?;
        info!(%user, %symbol, side = %scope, leverage, "leverage updated");
        Ok(row)
    }

    /// Toggle hedge mode. Affects subsequent orders only; open positions keep
    /// their recorded side.
    pub async fn set_hedge(&self, key: &str, secret: &str, hedge: bool) -> Result<(), EngineError> {
        let user = self.authenticate(key, secret).await?;
        self.storage().set_hedge(&user, hedge).await?;
        info!(%user, hedge, "hedge mode updated");
        Ok(())
    }

    /// All open orders for the caller.
    pub async fn open_orders(&self, key: &str, secret: &str) -> Result<Vec<Order>, EngineError> {
        let user = self.authenticate(key, secret).await?;
        Ok(self.storage().user_open_orders(&user).await?)
    }

    /// One order by `(symbol, external_id)`.
    pub async fn order(
        &self,
        key: &str,
        secret: &str,
        symbol: &str,
        external_id: &str,
    ) -> Result<Order, EngineError> {
        let user = self.authenticate(key, secret).await?;
        self.storage()
            .order(symbol, external_id)
            .await?
            .filter(|order| order.user == user)
            .ok_or(EngineError::OrderNotFound)
    }

    /// One order by storage id.
    pub async fn order_by_id(
        &self,
        key: &str,
        secret: &str,
        id: &str,
    ) -> Result<Order, EngineError> {
        let user = self.authenticate(key, secret).await?;
        self.storage()
            .order_by_id(id)
            .await?
            .filter(|order| order.user == user)
            .ok_or(EngineError::OrderNotFound)
    }

    /// All open positions for the caller.
    pub async fn positions(&self, key: &str, secret: &str) -> Result<Vec<Position>, EngineError> {
        let user = self.authenticate(key, secret).await?;
        Ok(self.storage().user_open_positions(&user).await?)
    }

    /// All wallet rows for the caller.
    pub async fn balances(
        &self,
        key: &str,
        secret: &str,
    ) -> Result<Vec<(Asset, Balance)>, EngineError> {
        let user = self.authenticate(key, secret).await?;
        Ok(self.storage().balances(&user).await?)
    }

    /// Fetch the leverage row for a scope, inserting the unlocked default
    /// (leverage 1) when missing.
    pub(crate) async fn ensure_leverage_row(
        &self,
        user: &UserId,
        symbol: &Symbol,
        scope: PositionSide,
    ) -> Result<LeverageRow, EngineError> {
        let _guard = self.locks().acquire(keys::leverage(user, symbol)).await;
        if let Some(row) = self.storage().leverage(user, symbol, Some(scope)).await? {
            return Ok(row);
        }
        let row = LeverageRow {
            user: user.clone(),
            symbol: symbol.clone(),
            side: Some(scope),
            leverage: 1,
            locked: false,
        };
        self.storage().upsert_leverage(&row).await?;
        Ok(row)
    }

    /// Current leverage for a scope; 1 when no row exists.
    pub(crate) async fn leverage_for(
        &self,
        user: &UserId,
        symbol: &Symbol,
        scope: PositionSide,
    ) -> Result<u32, EngineError> {
        Ok(self
            .storage()
            .leverage(user, symbol, Some(scope))
            .await?
            .map(|row| row.leverage)
            .unwrap_or(1))
    }

    /// Mark a scope's leverage row locked; the position it margins is open.
    pub(crate) async fn lock_leverage(
        &self,
        user: &UserId,
        symbol: &Symbol,
        scope: PositionSide,
        leverage: u32,
    ) -> Result<(), EngineError> {
        let _guard = self.locks().acquire(keys::leverage(user, symbol)).await;
        let mut row = self
            .storage()
            .leverage(user, symbol, Some(scope))
            .await?
            .unwrap_or(LeverageRow {
                user: user.clone(),
                symbol: symbol.clone(),
                side: Some(scope),
                leverage,
                locked: false,
            });
        row.locked = true;
        self.storage().upsert_leverage(&row).await?;
        Ok(())
    }

    /// Unlock every leverage row on the symbol whose scope no longer has an
    /// open position backing it.
    pub(crate) async fn unlock_leverage(
        &self,
        user: &UserId,
        symbol: &Symbol,
    ) -> Result<(), EngineError> {
        let _guard = self.locks().acquire(keys::leverage(user, symbol)).await;
        let open = self.projection().read().user_positions_symbol(user, symbol);
        for mut row in self.storage().leverage_rows(user, symbol).await? {
            if !row.locked {
                continue;
            }
            let still_backed = match row.side {
                Some(PositionSide::Long) => open
                    .iter()
                    .any(|position| position.position_side == PositionSide::Long),
                Some(PositionSide::Short) => open
                    .iter()
                    .any(|position| position.position_side == PositionSide::Short),
                Some(PositionSide::Both) | None => !open.is_empty(),
            };
            if !still_backed {
                row.locked = false;
                self.storage().upsert_leverage(&row).await?;
            }
        }
        Ok(())
    }
}

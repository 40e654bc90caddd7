//! Position record and the liquidation-price formula.

use crate::{Symbol, UserId};
use arara_markets::{ExchangeId, PositionSide};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum PositionStatus {
    #[serde(rename = "NEW")]
    Open,
    #[serde(rename = "CLOSED")]
    Closed,
}

/// One derivatives position.
///
/// While open, `amount > 0` and `margin > 0`. The recorded `position_side` is
/// always the real direction (`Long` / `Short`): in one-way mode the user
/// still holds at most one open position per symbol, and its direction comes
/// from the side of the order that opened it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Position {
    pub uuid: Uuid,
    pub user: UserId,
    pub symbol: Symbol,
    pub exchange: ExchangeId,
    pub position_side: PositionSide,
    /// Base amount for linear contracts, contract count for inverse.
    pub amount: Decimal,
    pub entry_price: Decimal,
    /// Margin currently locked in the wallet for this position.
    pub margin: Decimal,
    pub liquidation_price: Decimal,
    pub leverage: u32,
    /// Cumulative realized PnL including fees.
    pub profit: Decimal,
    /// Cumulative fee paid, in the margin asset.
    pub fee: Decimal,
    pub status: PositionStatus,
    pub close_price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        matches!(self.status, PositionStatus::Open)
    }

    /// `+1` for longs, `-1` for shorts; applied to realized-PnL formulas.
    pub fn direction(&self) -> Decimal {
        match self.position_side {
            PositionSide::Short => -Decimal::ONE,
            _ => Decimal::ONE,
        }
    }
}

/// The price at which a position is force-closed.
///
/// Derived once at open and recomputed only when the position grows. With
/// `leverage = 1` the formula degenerates to a near-zero floor for longs and
/// a huge ceiling for shorts; that shape is kept deliberately.
pub fn liquidation_price(
    entry: Decimal,
    side: PositionSide,
    fee_rate: Decimal,
    leverage: u32,
) -> Decimal {
    let s = match side {
        PositionSide::Short => Decimal::ONE,
        _ => -Decimal::ONE,
    };
    if leverage > 1 {
        let inverse_leverage = Decimal::ONE / Decimal::from(leverage);
        entry * (Decimal::ONE + inverse_leverage * s) * (Decimal::ONE + fee_rate * s)
    } else if matches!(side, PositionSide::Short) {
        entry / fee_rate
    } else {
        entry * fee_rate
    }
}

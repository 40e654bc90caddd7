//! Order record and its state machine.
//!
//! ```text
//!            create                fill(remaining)
//! [none] ───────────► NEW ─────────────────────────► FILLED
//!                      │   partial(remaining>done)      ▲
//!                      │   ─────────────► PARTIAL ──────┘
//!                      │                       │
//!                      └──► CANCELED / EXPIRED ┘ (from NEW or PARTIAL only)
//! ```
//!
//! Only limit orders live in the projection (`NEW` / `PARTIALLY_FILLED`);
//! terminal orders never re-enter it.

use crate::{Symbol, UserId};
use arara_markets::{ExchangeId, PositionSide, Side};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum OrderKind {
    #[serde(rename = "LIMIT")]
    Limit,
    #[serde(rename = "MARKET")]
    Market,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum OrderStatus {
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "PARTIALLY_FILLED")]
    PartiallyFilled,
    #[serde(rename = "FILLED")]
    Filled,
    #[serde(rename = "CANCELED")]
    Canceled,
    #[serde(rename = "EXPIRED")]
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Expired
        )
    }

    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }
}

/// One order. `(external_id, symbol)` is globally unique.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Order {
    /// Storage id.
    pub id: SmolStr,
    pub external_id: SmolStr,
    pub user: UserId,
    pub symbol: Symbol,
    pub exchange: ExchangeId,
    pub side: Side,
    pub kind: OrderKind,
    pub price: Decimal,
    pub amount: Decimal,
    /// `amount · price` at entry; maintained through reduce-only trims.
    pub quote_amount: Decimal,
    pub filled_amount: Decimal,
    pub filled_quote_amount: Decimal,
    pub avg_filled_price: Decimal,
    /// Accumulated fee, in the fee currency of the market kind.
    pub fee: Decimal,
    /// Rate fixed at entry: maker for limit, taker for market.
    pub fee_rate: Decimal,
    pub status: OrderStatus,
    pub reduce_only: bool,
    /// Derivatives only; `None` on spot orders.
    pub position_side: Option<PositionSide>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Unfilled remainder.
    pub fn remaining(&self) -> Decimal {
        self.amount - self.filled_amount
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Record a fill of `fill_amount` at `fill_price`, accumulating `fee` and
    /// transitioning to `FILLED` when the remainder is consumed.
    pub fn record_fill(&mut self, fill_amount: Decimal, fill_price: Decimal, fee: Decimal) {
        debug_assert!(fill_amount <= self.remaining());

        self.filled_amount += fill_amount;
        self.filled_quote_amount += fill_amount * fill_price;
        self.avg_filled_price = if self.filled_amount.is_zero() {
            Decimal::ZERO
        } else {
            self.filled_quote_amount / self.filled_amount
        };
        self.fee += fee;
        self.status = if self.remaining().is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.updated_at = Utc::now();
    }

    /// Rewrite the order down to `new_amount`, refunding the proportional fee
    /// on the trimmed excess (reduce-only over-fill, settlement rule for
    /// amounts above the open position).
    pub fn trim_to(&mut self, new_amount: Decimal) {
        debug_assert!(new_amount <= self.amount);

        if self.amount > Decimal::ZERO && self.fee > Decimal::ZERO {
            self.fee = self.fee * new_amount / self.amount;
        }
        self.amount = new_amount;
        self.quote_amount = new_amount * self.price;
        self.filled_amount = self.filled_amount.min(new_amount);
        self.filled_quote_amount = self.filled_amount * self.avg_filled_price;
        self.updated_at = Utc::now();
    }
}

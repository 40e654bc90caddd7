//! Compiled-in fee schedule.
//!
//! Rates are fixed per market kind. Note the compatibility asymmetry kept
//! from the reference venue: the spot *taker* rate equals the maker rate,
//! while futures takers pay a multiple of maker.

use crate::exchange::MarketKind;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Whether an order adds or removes liquidity. Limit orders rest (maker),
/// market orders cross (taker); the rate is fixed at order entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum FeeRole {
    Maker,
    Taker,
}

/// Spot maker rate: 0.1 bps × 10 = 0.001.
pub fn spot_maker_fee() -> Decimal {
    Decimal::new(1, 3)
}

/// Linear (USD-margined) futures maker rate: 0.0002.
pub fn usdm_maker_fee() -> Decimal {
    Decimal::new(2, 4)
}

/// Inverse (coin-margined) futures maker rate: 0.0001.
pub fn coinm_maker_fee() -> Decimal {
    Decimal::new(1, 4)
}

/// Resolve the fee rate for a market kind and role.
pub fn fee_rate(kind: MarketKind, role: FeeRole) -> Decimal {
    match (kind, role) {
        (MarketKind::Spot, FeeRole::Maker) => spot_maker_fee(),
        // Compat: spot taker charges the maker rate.
        (MarketKind::Spot, FeeRole::Taker) => spot_maker_fee(),
        (MarketKind::LinearFutures, FeeRole::Maker) => usdm_maker_fee(),
        (MarketKind::LinearFutures, FeeRole::Taker) => usdm_maker_fee() * Decimal::TWO,
        (MarketKind::InverseFutures, FeeRole::Maker) => coinm_maker_fee(),
        (MarketKind::InverseFutures, FeeRole::Taker) => {
            coinm_maker_fee() * Decimal::from(5)
        }
    }
}

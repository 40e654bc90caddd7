//! Wallet balance arithmetic.
//!
//! A wallet row holds `free + locked = real holding`. `locked` carries spot
//! limit-order reservations and open-position margins. Settlement expresses
//! every transition as a (delta_free, delta_locked) pair applied atomically
//! per row by the storage backend; admission checks happen before the deltas
//! are issued, so a realized loss may legitimately push `free` below zero in
//! the extremes the liquidation formula allows.

use derive_more::Constructor;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One wallet row value for a (user, asset) pair.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize, Serialize, Constructor,
)]
pub struct Balance {
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    /// The user's real holding.
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }

    /// Apply a settlement delta pair. A pure reservation or release keeps
    /// `total` constant; fees and realized PnL move it.
    pub fn apply(&self, delta_free: Decimal, delta_locked: Decimal) -> Balance {
        Balance {
            free: self.free + delta_free,
            locked: self.locked + delta_locked,
        }
    }
}

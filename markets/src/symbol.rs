//! Immutable per-symbol parameters.
//!
//! A [`SymbolSpec`] is retrieved from the external symbol service and cached;
//! it never changes within one retrieval. For inverse (coin-margined)
//! contracts, [`QuoteAsset::min_amount`] doubles as the contract size in quote
//! units used to convert a contract count to notional.

use crate::exchange::ExchangeId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Base-asset parameters of a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BaseAsset {
    pub name: SmolStr,
    /// Minimum order amount in base units; also the precision threshold below
    /// which a linear position counts as fully consumed.
    pub min_amount: Decimal,
    /// Amount step (lot size).
    pub step: Decimal,
}

/// Quote-asset parameters of a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct QuoteAsset {
    pub name: SmolStr,
    /// Minimum order amount in quote units. For inverse contracts this is the
    /// contract size.
    pub min_amount: Decimal,
}

/// Immutable parameters of one symbol on one venue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SymbolSpec {
    pub pair: SmolStr,
    pub exchange: ExchangeId,
    pub base: BaseAsset,
    pub quote: QuoteAsset,
    pub price_precision: u32,
    pub max_orders: u32,
}

impl SymbolSpec {
    /// Contract size in quote units; meaningful for inverse venues only.
    pub fn contract_size(&self) -> Decimal {
        self.quote.min_amount
    }

    /// The asset margin is held in: base for inverse contracts, quote
    /// otherwise.
    pub fn margin_asset(&self) -> &SmolStr {
        if self.exchange.is_inverse() {
            &self.base.name
        } else {
            &self.quote.name
        }
    }

    /// The amount below which an opposite-direction fill fully consumes a
    /// position: one contract for inverse venues, the base minimum otherwise.
    pub fn close_threshold(&self) -> Decimal {
        if self.exchange.is_inverse() {
            Decimal::ONE
        } else {
            self.base.min_amount
        }
    }
}

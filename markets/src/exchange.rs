//! Venue identifiers for the Arara simulator.
//!
//! The set is closed: the simulator only ever matches against the top-of-book
//! feeds of these venues. Wire names (`"binanceUsdm"`, `"kucoinLinear"`, ...)
//! follow the upstream market-data aggregator.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Identifies a trading venue whose price feed the simulator consumes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExchangeId {
    // Spot venues
    Binance,
    Kucoin,
    Bybit,
    Okx,
    Coinbase,
    Bitget,
    Mexc,
    Hyperliquid,
    // Linear (USD-margined) futures venues
    BinanceUsdm,
    BybitUsdm,
    KucoinLinear,
    OkxLinear,
    BitgetUsdm,
    // Inverse (coin-margined) futures venues
    BinanceCoinm,
    BybitInverse,
    KucoinInverse,
    OkxInverse,
    BitgetCoinm,
    HyperliquidInverse,
}

/// Classifies how a venue's instruments settle.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub enum MarketKind {
    /// Simple asset exchange; settlement in base and quote.
    Spot,
    /// Quote-margined futures; margin, fee and PnL in the quote asset.
    LinearFutures,
    /// Base-margined futures; notional converts through the contract size.
    InverseFutures,
}

impl ExchangeId {
    /// Returns the [`MarketKind`] of instruments traded on this venue.
    pub fn market_kind(&self) -> MarketKind {
        match self {
            ExchangeId::Binance
            | ExchangeId::Kucoin
            | ExchangeId::Bybit
            | ExchangeId::Okx
            | ExchangeId::Coinbase
            | ExchangeId::Bitget
            | ExchangeId::Mexc
            | ExchangeId::Hyperliquid => MarketKind::Spot,
            ExchangeId::BinanceUsdm
            | ExchangeId::BybitUsdm
            | ExchangeId::KucoinLinear
            | ExchangeId::OkxLinear
            | ExchangeId::BitgetUsdm => MarketKind::LinearFutures,
            ExchangeId::BinanceCoinm
            | ExchangeId::BybitInverse
            | ExchangeId::KucoinInverse
            | ExchangeId::OkxInverse
            | ExchangeId::BitgetCoinm
            | ExchangeId::HyperliquidInverse => MarketKind::InverseFutures,
        }
    }

    /// Returns true for spot venues.
    pub fn is_spot(&self) -> bool {
        matches!(self.market_kind(), MarketKind::Spot)
    }

    /// Returns true for futures venues, linear or inverse.
    pub fn is_derivatives(&self) -> bool {
        !self.is_spot()
    }

    /// Returns true for coin-margined futures venues.
    pub fn is_inverse(&self) -> bool {
        matches!(self.market_kind(), MarketKind::InverseFutures)
    }

    /// Returns the canonical wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeId::Binance => "binance",
            ExchangeId::Kucoin => "kucoin",
            ExchangeId::Bybit => "bybit",
            ExchangeId::Okx => "okx",
            ExchangeId::Coinbase => "coinbase",
            ExchangeId::Bitget => "bitget",
            ExchangeId::Mexc => "mexc",
            ExchangeId::Hyperliquid => "hyperliquid",
            ExchangeId::BinanceUsdm => "binanceUsdm",
            ExchangeId::BybitUsdm => "bybitUsdm",
            ExchangeId::KucoinLinear => "kucoinLinear",
            ExchangeId::OkxLinear => "okxLinear",
            ExchangeId::BitgetUsdm => "bitgetUsdm",
            ExchangeId::BinanceCoinm => "binanceCoinm",
            ExchangeId::BybitInverse => "bybitInverse",
            ExchangeId::KucoinInverse => "kucoinInverse",
            ExchangeId::OkxInverse => "okxInverse",
            ExchangeId::BitgetCoinm => "bitgetCoinm",
            ExchangeId::HyperliquidInverse => "hyperliquidInverse",
        }
    }
}

/// Error produced when parsing an unknown venue wire name.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("unknown exchange: {0}")]
pub struct ParseExchangeError(pub String);

impl FromStr for ExchangeId {
    type Err = ParseExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binance" => Ok(ExchangeId::Binance),
            "kucoin" => Ok(ExchangeId::Kucoin),
            "bybit" => Ok(ExchangeId::Bybit),
            "okx" => Ok(ExchangeId::Okx),
            "coinbase" => Ok(ExchangeId::Coinbase),
            "bitget" => Ok(ExchangeId::Bitget),
            "mexc" => Ok(ExchangeId::Mexc),
            "hyperliquid" => Ok(ExchangeId::Hyperliquid),
            "binanceUsdm" => Ok(ExchangeId::BinanceUsdm),
            "bybitUsdm" => Ok(ExchangeId::BybitUsdm),
            "kucoinLinear" => Ok(ExchangeId::KucoinLinear),
            "okxLinear" => Ok(ExchangeId::OkxLinear),
            "bitgetUsdm" => Ok(ExchangeId::BitgetUsdm),
            "binanceCoinm" => Ok(ExchangeId::BinanceCoinm),
            "bybitInverse" => Ok(ExchangeId::BybitInverse),
            "kucoinInverse" => Ok(ExchangeId::KucoinInverse),
            "okxInverse" => Ok(ExchangeId::OkxInverse),
            "bitgetCoinm" => Ok(ExchangeId::BitgetCoinm),
            "hyperliquidInverse" => Ok(ExchangeId::HyperliquidInverse),
            other => Err(ParseExchangeError(other.to_string())),
        }
    }
}

impl Display for ExchangeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

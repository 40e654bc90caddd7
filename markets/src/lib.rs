#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments, type_alias_bounds)]

//! # Markets
//!
//! Core venue and symbol abstractions for the Arara paper-trading simulator:
//! the closed [`ExchangeId`] set (spot, linear futures, inverse futures),
//! order/position sides, immutable per-symbol parameters, and the compiled-in
//! fee schedule.

/// Defines the closed set of supported venues and their market kinds.
pub mod exchange;

/// Defines the compiled-in maker/taker fee schedule.
pub mod fees;

/// Defines order and position side enums.
pub mod side;

/// Defines immutable per-symbol parameters ([`SymbolSpec`]).
pub mod symbol;

pub use exchange::{ExchangeId, MarketKind};
pub use fees::{fee_rate, FeeRole};
pub use side::{PositionSide, Side};
pub use symbol::{BaseAsset, QuoteAsset, SymbolSpec};

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

//! # Data
//!
//! Market-data intake for the Arara paper-trading simulator.
//!
//! The upstream aggregator publishes top-of-book ticks on pub/sub channels
//! named `trade@<symbol>@<exchange>`. This crate owns everything between that
//! channel and the matching engine:
//!
//! * [`Ticker`](ticker::Ticker): the normalised tick model, decoded
//!   leniently (venues ship numerics as JSON strings as often as numbers).
//! * [`feed`]: the pub/sub connection contract and the reconnecting driver
//!   that replays the live subscription set after a drop.
//! * [`intake`]: the three tick filters (per-exchange monotonicity, 30 s
//!   freshness, signature dedup), the 60 s price cache, and per-exchange
//!   coalescing into batches dispatched in arrival order.
//! * [`service`]: the typed client for the symbol / latest-price HTTP
//!   service, with its `OK`/`NOTOK` envelope and bounded retries.

use fnv::FnvBuildHasher;

/// All errors generated in the data crate.
pub mod error;

/// Pub/sub connection contract, channel naming, and the reconnecting feed
/// driver.
pub mod feed;

/// Tick filters, price cache, and per-exchange batch dispatch.
pub mod intake;

/// Typed client for the external symbol / market-data HTTP service.
pub mod service;

/// Normalised top-of-book tick model.
pub mod ticker;

/// Fast IndexMap using the FNV hasher, suited to the small keys used
/// throughout (symbols, exchange ids).
pub type FnvIndexMap<K, V> = indexmap::IndexMap<K, V, FnvBuildHasher>;

/// Fast IndexSet using the FNV hasher.
pub type FnvIndexSet<T> = indexmap::IndexSet<T, FnvBuildHasher>;

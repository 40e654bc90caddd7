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

//! # Core
//!
//! The matching and settlement engine of the Arara paper-trading simulator.
//!
//! The [`Engine`](engine::Engine) consumes per-exchange batches of top-of-book
//! ticks, fires limit-order fills against the touched side, applies spot and
//! derivatives balance/position transitions atomically per (user, symbol),
//! manages leverage locking and liquidation, and keeps the in-memory
//! projection of open orders and positions consistent with durable storage.
//!
//! Durable truth lives behind the [`storage`] contracts; execution reports and
//! balance snapshots go out through the [`push`] contract, best-effort. All
//! mutation paths are serialized by the [`lock`] manager's named locks.
//!
//! Wiring a running simulator:
//!
//! ```rust,ignore
//! let (feed, commands) = feed_channel();
//! let engine = Engine::new(storage, push, api, prices.clone(), feed);
//! engine.reconcile().await?;
//!
//! let intake = TickerIntake::new(Arc::new(engine.clone()), prices);
//! tokio::spawn(FeedDriver::new(connector, FEED_RECONNECT_POLICY, intake, commands).run());
//! ```

use smol_str::SmolStr;

/// Wallet balance arithmetic.
pub mod balance;

/// The matching and settlement engine and its operations.
pub mod engine;

/// All errors produced by the engine.
pub mod error;

/// Named-lock manager serializing every mutation path.
pub mod lock;

/// Default tracing initialisers.
pub mod logging;

/// Order record and its state machine.
pub mod order;

/// Position record and the liquidation-price formula.
pub mod position;

/// In-memory projection of open orders and positions.
pub mod projection;

/// Push-channel contract for execution reports and balance snapshots.
pub mod push;

/// Durable storage contracts and the in-memory implementation.
pub mod storage;

/// TTL cache over the external symbol service.
pub mod symbols;

/// Watch set: channels the engine is subscribed to and why.
pub mod watch;

/// Canonical user identifier. Credential lookups resolve to this opaque form
/// at the boundary; orders and positions hold it.
pub type UserId = SmolStr;

/// Asset name, eg/ "BTC".
pub type Asset = SmolStr;

/// Symbol pair name, eg/ "BTCUSDT".
pub type Symbol = SmolStr;

pub use engine::Engine;
pub use error::EngineError;

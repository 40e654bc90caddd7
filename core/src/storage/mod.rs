//! Durable storage contracts.
//!
//! All durable truth (orders, positions, wallets, leverage, hedge flags,
//! credentials) lives behind [`Storage`]. The engine treats every call as a
//! suspension point and re-reads its projection afterwards when acting on a
//! record. Balance mutations go through [`Storage::apply_balance`], which
//! backends implement atomically per wallet row.

use crate::{
    balance::Balance, error::StorageError, order::Order, position::Position, Asset, Symbol,
    UserId,
};
use arara_markets::PositionSide;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// In-memory implementation, used by tests and the default paper-trading
/// deployment.
pub mod memory;

/// Per-(user, symbol, side) leverage setting.
///
/// `locked` is true while any open position exists in the row's scope;
/// leverage cannot change while locked. `side` is `None` only on legacy rows,
/// until startup reconciliation backfills it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LeverageRow {
    pub user: UserId,
    pub symbol: Symbol,
    pub side: Option<PositionSide>,
    pub leverage: u32,
    pub locked: bool,
}

/// Durable storage for the engine. Keys: orders `(external_id, symbol)`
/// unique; positions `uuid`; wallets `(user, asset)`; leverage
/// `(user, symbol, side)`; hedge `(user)`.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    // Credentials

    /// Resolve an API key pair to the canonical user id.
    async fn find_user(&self, key: &str, secret: &str) -> Result<Option<UserId>, StorageError>;

    // Orders

    /// Insert a new order; fails with [`StorageError::Duplicate`] when
    /// `(external_id, symbol)` already exists.
    async fn insert_order(&self, order: &Order) -> Result<(), StorageError>;

    async fn update_order(&self, order: &Order) -> Result<(), StorageError>;

    async fn order(
        &self,
        symbol: &str,
        external_id: &str,
    ) -> Result<Option<Order>, StorageError>;

    async fn order_by_id(&self, id: &str) -> Result<Option<Order>, StorageError>;

    /// All limit orders with open status, for projection rebuild.
    async fn open_limit_orders(&self) -> Result<Vec<Order>, StorageError>;

    async fn user_open_orders(&self, user: &UserId) -> Result<Vec<Order>, StorageError>;

    // Positions

    async fn upsert_position(&self, position: &Position) -> Result<(), StorageError>;

    async fn position(&self, uuid: Uuid) -> Result<Option<Position>, StorageError>;

    /// All open positions, for projection rebuild.
    async fn open_positions(&self) -> Result<Vec<Position>, StorageError>;

    async fn user_open_positions(&self, user: &UserId) -> Result<Vec<Position>, StorageError>;

    // Wallets

    async fn balance(&self, user: &UserId, asset: &str) -> Result<Balance, StorageError>;

    async fn balances(&self, user: &UserId) -> Result<Vec<(Asset, Balance)>, StorageError>;

    async fn all_balances(&self) -> Result<Vec<(UserId, Asset, Balance)>, StorageError>;

    /// Apply free/locked deltas atomically to one wallet row; returns the new
    /// value.
    async fn apply_balance(
        &self,
        user: &UserId,
        asset: &str,
        delta_free: rust_decimal::Decimal,
        delta_locked: rust_decimal::Decimal,
    ) -> Result<Balance, StorageError>;

    /// Replace one wallet row outright (reconciliation only).
    async fn set_balance(
        &self,
        user: &UserId,
        asset: &str,
        balance: Balance,
    ) -> Result<(), StorageError>;

    // Leverage

    async fn leverage(
        &self,
        user: &UserId,
        symbol: &str,
        side: Option<PositionSide>,
    ) -> Result<Option<LeverageRow>, StorageError>;

    async fn upsert_leverage(&self, row: &LeverageRow) -> Result<(), StorageError>;

    async fn remove_leverage(
        &self,
        user: &UserId,
        symbol: &str,
        side: Option<PositionSide>,
    ) -> Result<(), StorageError>;

    async fn leverage_rows(
        &self,
        user: &UserId,
        symbol: &str,
    ) -> Result<Vec<LeverageRow>, StorageError>;

    async fn all_leverage_rows(&self) -> Result<Vec<LeverageRow>, StorageError>;

    // Hedge mode

    async fn hedge(&self, user: &UserId) -> Result<bool, StorageError>;

    async fn set_hedge(&self, user: &UserId, hedge: bool) -> Result<(), StorageError>;
}

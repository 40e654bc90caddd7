//! In-memory [`Storage`] implementation.
//!
//! Backs the test suites and the default risk-free deployment, where losing
//! paper state on restart is acceptable. Every map sits behind its own mutex;
//! [`MemoryStorage::apply_balance`] is atomic per wallet row by construction.

use super::{LeverageRow, Storage};
use crate::{
    balance::Balance, error::StorageError, order::Order, position::Position, Asset, Symbol,
    UserId,
};
use arara_data::FnvIndexMap;
use arara_markets::PositionSide;
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use smol_str::SmolStr;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct MemoryStorage {
    users: Mutex<FnvIndexMap<(String, String), UserId>>,
    orders: Mutex<FnvIndexMap<(Symbol, SmolStr), Order>>,
    positions: Mutex<FnvIndexMap<Uuid, Position>>,
    balances: Mutex<FnvIndexMap<(UserId, Asset), Balance>>,
    leverage: Mutex<FnvIndexMap<(UserId, Symbol, Option<PositionSide>), LeverageRow>>,
    hedge: Mutex<FnvIndexMap<UserId, bool>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an API key pair for a user.
    pub fn add_user(&self, key: &str, secret: &str, user: impl Into<UserId>) {
        self.users
            .lock()
            .insert((key.to_string(), secret.to_string()), user.into());
    }

    /// Credit free balance, creating the wallet row when missing.
    pub fn deposit(&self, user: impl Into<UserId>, asset: impl Into<Asset>, amount: Decimal) {
        let mut balances = self.balances.lock();
        let row = balances.entry((user.into(), asset.into())).or_default();
        row.free += amount;
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn find_user(&self, key: &str, secret: &str) -> Result<Option<UserId>, StorageError> {
        Ok(self
            .users
            .lock()
            .get(&(key.to_string(), secret.to_string()))
            .cloned())
    }

    async fn insert_order(&self, order: &Order) -> Result<(), StorageError> {
        let mut orders = self.orders.lock();
        let key = (order.symbol.clone(), order.external_id.clone());
        if orders.contains_key(&key) {
            return Err(StorageError::Duplicate);
        }
        orders.insert(key, order.clone());
        Ok(())
    }

    async fn update_order(&self, order: &Order) -> Result<(), StorageError> {
        self.orders.lock().insert(
            (order.symbol.clone(), order.external_id.clone()),
            order.clone(),
        );
        Ok(())
    }

    async fn order(
        &self,
        symbol: &str,
        external_id: &str,
    ) -> Result<Option<Order>, StorageError> {
        Ok(self
            .orders
            .lock()
            .get(&(SmolStr::new(symbol), SmolStr::new(external_id)))
            .cloned())
    }

    async fn order_by_id(&self, id: &str) -> Result<Option<Order>, StorageError> {
        Ok(self
            .orders
            .lock()
            .values()
            .find(|order| order.id == id)
            .cloned())
    }

    async fn open_limit_orders(&self) -> Result<Vec<Order>, StorageError> {
        Ok(self
            .orders
            .lock()
            .values()
            .filter(|order| {
                order.status.is_open() && matches!(order.kind, crate::order::OrderKind::Limit)
            })
            .cloned()
            .collect())
    }

    async fn user_open_orders(&self, user: &UserId) -> Result<Vec<Order>, StorageError> {
        Ok(self
            .orders
            .lock()
            .values()
            .filter(|order| &order.user == user && order.status.is_open())
            .cloned()
            .collect())
    }

    async fn upsert_position(&self, position: &Position) -> Result<(), StorageError> {
        self.positions
            .lock()
            .insert(position.uuid, position.clone());
        Ok(())
    }

    async fn position(&self, uuid: Uuid) -> Result<Option<Position>, StorageError> {
        Ok(self.positions.lock().get(&uuid).cloned())
    }

    async fn open_positions(&self) -> Result<Vec<Position>, StorageError> {
        Ok(self
            .positions
            .lock()
            .values()
            .filter(|position| position.is_open())
            .cloned()
            .collect())
    }

    async fn user_open_positions(&self, user: &UserId) -> Result<Vec<Position>, StorageError> {
        Ok(self
            .positions
            .lock()
            .values()
            .filter(|position| &position.user == user && position.is_open())
            .cloned()
            .collect())
    }

    async fn balance(&self, user: &UserId, asset: &str) -> Result<Balance, StorageError> {
        Ok(self
            .balances
            .lock()
            .get(&(user.clone(), SmolStr::new(asset)))
            .copied()
            .unwrap_or_default())
    }

    async fn balances(&self, user: &UserId) -> Result<Vec<(Asset, Balance)>, StorageError> {
        Ok(self
            .balances
            .lock()
            .iter()
            .filter(|((owner, _), _)| owner == user)
            .map(|((_, asset), balance)| (asset.clone(), *balance))
            .collect())
    }

    async fn all_balances(&self) -> Result<Vec<(UserId, Asset, Balance)>, StorageError> {
        Ok(self
            .balances
            .lock()
            .iter()
            .map(|((user, asset), balance)| (user.clone(), asset.clone(), *balance))
            .collect())
    }

    async fn apply_balance(
        &self,
        user: &UserId,
        asset: &str,
        delta_free: Decimal,
        delta_locked: Decimal,
    ) -> Result<Balance, StorageError> {
        let mut balances = self.balances.lock();
        let row = balances
            .entry((user.clone(), SmolStr::new(asset)))
            .or_default();
        *row = row.apply(delta_free, delta_locked);
        Ok(*row)
    }

    async fn set_balance(
        &self,
        user: &UserId,
        asset: &str,
        balance: Balance,
    ) -> Result<(), StorageError> {
        self.balances
            .lock()
            .insert((user.clone(), SmolStr::new(asset)), balance);
        Ok(())
    }

    async fn leverage(
        &self,
        user: &UserId,
        symbol: &str,
        side: Option<PositionSide>,
    ) -> Result<Option<LeverageRow>, StorageError> {
        Ok(self
            .leverage
            .lock()
            .get(&(user.clone(), SmolStr::new(symbol), side))
            .cloned())
    }

    async fn upsert_leverage(&self, row: &LeverageRow) -> Result<(), StorageError> {
        self.leverage.lock().insert(
            (row.user.clone(), row.symbol.clone(), row.side),
            row.clone(),
        );
        Ok(())
    }

    async fn remove_leverage(
        &self,
        user: &UserId,
        symbol: &str,
        side: Option<PositionSide>,
    ) -> Result<(), StorageError> {
        self.leverage
            .lock()
            .shift_remove(&(user.clone(), SmolStr::new(symbol), side));
        Ok(())
    }

    async fn leverage_rows(
        &self,
        user: &UserId,
        symbol: &str,
    ) -> Result<Vec<LeverageRow>, StorageError> {
        Ok(self
            .leverage
            .lock()
            .values()
            .filter(|row| &row.user == user && row.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn all_leverage_rows(&self) -> Result<Vec<LeverageRow>, StorageError> {
        Ok(self.leverage.lock().values().cloned().collect())
    }

    async fn hedge(&self, user: &UserId) -> Result<bool, StorageError> {
        Ok(self.hedge.lock().get(user).copied().unwrap_or(false))
    }

    async fn set_hedge(&self, user: &UserId, hedge: bool) -> Result<(), StorageError> {
        self.hedge.lock().insert(user.clone(), hedge);
        Ok(())
    }
}

//! Named-lock manager.
//!
//! Every mutation path that touches the projection, balances, or positions is
//! serialized by one of four named locks:
//!
//! | Lock        | Key                          | Guards                                  |
//! |-------------|------------------------------|-----------------------------------------|
//! | CreateOrder | `key‖secret‖symbol‖exchange` | order creation end-to-end               |
//! | UpdateOrder | `external_id`                | cancels and the limit-fill path         |
//! | Ticker      | `exchange`                   | per-exchange tick-batch processing      |
//! | Common      | leverage `(user‖symbol)`, position `uuid` | leverage lock/unlock, position close |
//!
//! Nesting order is `{CreateOrder | UpdateOrder | Ticker} → Common`: a task
//! holds at most one outer lock, and only the leverage/position helpers take
//! a Common lock underneath it. Locks are waiting with no fairness guarantee
//! beyond tokio's queue.

use arara_data::FnvIndexMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry entries are pruned once the map grows past this many keys;
/// `external_id` keys would otherwise accumulate forever.
const PRUNE_THRESHOLD: usize = 1024;

/// Keyed registry of waiting async locks.
#[derive(Default)]
pub struct NamedLocks {
    inner: Mutex<FnvIndexMap<String, Arc<AsyncMutex<()>>>>,
}

impl fmt::Debug for NamedLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedLocks")
            .field("keys", &self.inner.lock().len())
            .finish()
    }
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting behind current holders.
    pub async fn acquire(&self, key: String) -> OwnedMutexGuard<()> {
        let lock = {
            let mut registry = self.inner.lock();
            if registry.len() > PRUNE_THRESHOLD {
                registry.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(
                registry
                    .entry(key)
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}

/// Key constructors for the four named locks.
pub mod keys {
    use crate::{Symbol, UserId};
    use arara_markets::ExchangeId;
    use uuid::Uuid;

    pub fn create_order(key: &str, secret: &str, symbol: &str, exchange: ExchangeId) -> String {
        format!("create-order:{key}\u{1}{secret}\u{1}{symbol}\u{1}{exchange}")
    }

    pub fn update_order(external_id: &str) -> String {
        format!("update-order:{external_id}")
    }

    pub fn ticker(exchange: ExchangeId) -> String {
        format!("ticker:{exchange}")
    }

    pub fn leverage(user: &UserId, symbol: &Symbol) -> String {
        format!("leverage:{user}\u{1}{symbol}")
    }

    pub fn position(uuid: Uuid) -> String {
        format!("position:{uuid}")
    }
}

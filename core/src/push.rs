//! Push-channel contract for real-time client updates.
//!
//! Two per-user topics: `order` carries execution reports, and
//! `outboundAccountInfo` carries full balance snapshots. Delivery is
//! best-effort; a failed publish is logged and state remains correct.

use crate::{balance::Balance, error::StorageError, Asset, UserId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Per-user event topics.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PushTopic {
    Order,
    OutboundAccountInfo,
}

impl PushTopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushTopic::Order => "order",
            PushTopic::OutboundAccountInfo => "outboundAccountInfo",
        }
    }
}

/// One event on a push topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PushEvent {
    Update { data: Value },
    Info { info: Value },
    Error { error: String },
}

/// One wallet row in an `outboundAccountInfo` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceSnapshot {
    pub asset: Asset,
    pub free: rust_decimal::Decimal,
    pub locked: rust_decimal::Decimal,
}

impl BalanceSnapshot {
    pub fn new(asset: Asset, balance: Balance) -> Self {
        Self {
            asset,
            free: balance.free,
            locked: balance.locked,
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("push delivery failed: {0}")]
pub struct PushError(pub String);

impl From<StorageError> for PushError {
    fn from(value: StorageError) -> Self {
        Self(value.to_string())
    }
}

/// Transport delivering events to a connected client.
#[async_trait]
pub trait PushChannel: Send + Sync + 'static {
    async fn publish(
        &self,
        user: &UserId,
        topic: PushTopic,
        event: PushEvent,
    ) -> Result<(), PushError>;
}

/// In-memory fan-out used by tests and the default deployment.
#[derive(Debug, Default)]
pub struct MemoryPush {
    events: Mutex<Vec<(UserId, PushTopic, PushEvent)>>,
}

impl MemoryPush {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything published so far.
    pub fn take(&self) -> Vec<(UserId, PushTopic, PushEvent)> {
        std::mem::take(&mut self.events.lock())
    }

    pub fn count(&self, topic: PushTopic) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(_, event_topic, _)| *event_topic == topic)
            .count()
    }
}

#[async_trait]
impl PushChannel for MemoryPush {
    async fn publish(
        &self,
        user: &UserId,
        topic: PushTopic,
        event: PushEvent,
    ) -> Result<(), PushError> {
        self.events.lock().push((user.clone(), topic, event));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_shape() {
        let update = PushEvent::Update {
            data: serde_json::json!({"status": "FILLED"}),
        };
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            serde_json::json!({"type": "update", "data": {"status": "FILLED"}})
        );

        let error = PushEvent::Error {
            error: "boom".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            serde_json::json!({"type": "error", "error": "boom"})
        );
    }
}

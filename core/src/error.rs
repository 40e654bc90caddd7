//! Central error type for the engine.
//!
//! The client-facing variants map to HTTP 400 at the (out-of-scope) REST
//! edge; everything else is an internal failure that is logged and, where the
//! contract allows, retried.

use crate::order::OrderStatus;
use arara_data::error::DataError;
use rust_decimal::Decimal;
use thiserror::Error;

/// All errors produced by engine operations.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("User not found")]
    UserNotFound,

    #[error("Insufficient balance: need {needed} {asset}, free {free}")]
    InsufficientBalance {
        asset: String,
        needed: Decimal,
        free: Decimal,
    },

    #[error("Order not found")]
    OrderNotFound,

    #[error("Order already in terminal state: {0:?}")]
    OrderTerminal(OrderStatus),

    #[error("Duplicated externalId + symbol")]
    DuplicateOrder,

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("positionSide must be LONG or SHORT in hedge mode")]
    HedgeModeRequiresSide,

    #[error("Reduce order rejected")]
    ReduceOrderRejected,

    #[error("Leverage is locked by an open position")]
    LeverageLocked,

    #[error("Leverage out of range: {0}")]
    InvalidLeverage(u32),

    #[error("Order amount must be positive")]
    InvalidAmount,

    #[error("Too many open orders for symbol (max {0})")]
    MaxOrdersExceeded(u32),

    #[error("Limit order price required")]
    PriceRequired,

    #[error("No current price available for {0}")]
    PriceUnavailable(String),

    #[error("Storage: {0}")]
    Storage(String),

    #[error("MarketData: {0}")]
    MarketData(#[from] DataError),
}

impl EngineError {
    /// True for errors the REST edge surfaces as HTTP 400.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            EngineError::Storage(_) | EngineError::MarketData(_) | EngineError::PriceUnavailable(_)
        )
    }
}

/// Errors surfaced by storage backends.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// A unique-key constraint was violated.
    #[error("duplicate key")]
    Duplicate,

    #[error("{0}")]
    Backend(String),
}

impl From<StorageError> for EngineError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::Duplicate => EngineError::DuplicateOrder,
            StorageError::Backend(message) => EngineError::Storage(message),
        }
    }
}

//! In-memory projection of open orders and positions.
//!
//! The projection is the primary index for matching: open limit orders keyed
//! `symbol → external_id`, open positions keyed `symbol → uuid`. It is pure,
//! process-local data: reads return owned copies, writes replace whole
//! records, and durable truth lives in storage.

use crate::{order::Order, position::Position, Symbol};
use arara_data::FnvIndexMap;
use arara_markets::ExchangeId;
use smol_str::SmolStr;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct Projection {
    orders: FnvIndexMap<Symbol, FnvIndexMap<SmolStr, Order>>,
    positions: FnvIndexMap<Symbol, FnvIndexMap<Uuid, Position>>,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order(&self, symbol: &str, external_id: &str) -> Option<Order> {
        self.orders.get(symbol)?.get(external_id).cloned()
    }

    /// Linear scan by storage id.
    pub fn order_by_id(&self, id: &str) -> Option<Order> {
        self.orders
            .values()
            .flat_map(|by_external| by_external.values())
            .find(|order| order.id == id)
            .cloned()
    }

    pub fn put_order(&mut self, order: Order) {
        self.orders
            .entry(order.symbol.clone())
            .or_default()
            .insert(order.external_id.clone(), order);
    }

    pub fn remove_order(&mut self, symbol: &str, external_id: &str) -> Option<Order> {
        let by_external = self.orders.get_mut(symbol)?;
        let removed = by_external.shift_remove(external_id);
        if by_external.is_empty() {
            self.orders.shift_remove(symbol);
        }
        removed
    }

    /// Open orders for one symbol on one exchange, in insertion order.
    pub fn orders_for(&self, symbol: &str, exchange: ExchangeId) -> Vec<Order> {
        self.orders
            .get(symbol)
            .map(|by_external| {
                by_external
                    .values()
                    .filter(|order| order.exchange == exchange)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn position(&self, symbol: &str, uuid: Uuid) -> Option<Position> {
        self.positions.get(symbol)?.get(&uuid).cloned()
    }

    /// Linear scan by uuid.
    pub fn position_by_uuid(&self, uuid: Uuid) -> Option<Position> {
        self.positions
            .values()
            .find_map(|by_uuid| by_uuid.get(&uuid))
            .cloned()
    }

    pub fn put_position(&mut self, position: Position) {
        self.positions
            .entry(position.symbol.clone())
            .or_default()
            .insert(position.uuid, position);
    }

    pub fn remove_position(&mut self, symbol: &str, uuid: Uuid) -> Option<Position> {
        let by_uuid = self.positions.get_mut(symbol)?;
        let removed = by_uuid.shift_remove(&uuid);
        if by_uuid.is_empty() {
            self.positions.shift_remove(symbol);
        }
        removed
    }

    /// Open positions for one symbol on one exchange.
    pub fn positions_for(&self, symbol: &str, exchange: ExchangeId) -> Vec<Position> {
        self.positions
            .get(symbol)
            .map(|by_uuid| {
                by_uuid
                    .values()
                    .filter(|position| position.exchange == exchange)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All open positions for one user on one symbol+exchange.
    pub fn user_positions(
        &self,
        user: &str,
        symbol: &str,
        exchange: ExchangeId,
    ) -> Vec<Position> {
        self.positions_for(symbol, exchange)
            .into_iter()
            .filter(|position| position.user == user)
            .collect()
    }

    /// All open positions for one user on one symbol, across exchanges.
    /// Leverage rows are keyed without the exchange, so the lock scope is too.
    pub fn user_positions_symbol(&self, user: &str, symbol: &str) -> Vec<Position> {
        self.positions
            .get(symbol)
            .map(|by_uuid| {
                by_uuid
                    .values()
                    .filter(|position| position.user == user)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{OrderKind, OrderStatus};
    use arara_markets::Side;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn order(symbol: &str, external_id: &str, exchange: ExchangeId) -> Order {
        let now = Utc::now();
        Order {
            id: SmolStr::new(format!("id-{external_id}")),
            external_id: SmolStr::new(external_id),
            user: SmolStr::new("user-1"),
            symbol: SmolStr::new(symbol),
            exchange,
            side: Side::Buy,
            kind: OrderKind::Limit,
            price: dec!(100),
            amount: dec!(1),
            quote_amount: dec!(100),
            filled_amount: Decimal::ZERO,
            filled_quote_amount: Decimal::ZERO,
            avg_filled_price: Decimal::ZERO,
            fee: Decimal::ZERO,
            fee_rate: dec!(0.001),
            status: OrderStatus::New,
            reduce_only: false,
            position_side: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn reads_return_copies() {
        let mut projection = Projection::new();
        projection.put_order(order("BTCUSDT", "a", ExchangeId::Binance));

        let mut copy = projection.order("BTCUSDT", "a").unwrap();
        copy.status = OrderStatus::Canceled;

        assert_eq!(
            projection.order("BTCUSDT", "a").unwrap().status,
            OrderStatus::New
        );
    }

    #[test]
    fn orders_for_filters_by_exchange() {
        let mut projection = Projection::new();
        projection.put_order(order("BTCUSDT", "a", ExchangeId::Binance));
        projection.put_order(order("BTCUSDT", "b", ExchangeId::Kucoin));

        let binance = projection.orders_for("BTCUSDT", ExchangeId::Binance);
        assert_eq!(binance.len(), 1);
        assert_eq!(binance[0].external_id, "a");
    }

    #[test]
    fn remove_prunes_empty_symbol_entries() {
        let mut projection = Projection::new();
        projection.put_order(order("BTCUSDT", "a", ExchangeId::Binance));
        assert!(projection.remove_order("BTCUSDT", "a").is_some());
        assert!(projection.remove_order("BTCUSDT", "a").is_none());
        assert!(projection.order_by_id("id-a").is_none());
    }
}

// =============================================================================
// Order State — order ledger with an idempotency index
// =============================================================================
//
// Every order is keyed by its internal `order_id` (UUID v4). A secondary
// index maps `client_order_id -> order_id` so that `submit_signal` can detect
// a retried call using the same idempotency key before it ever reaches the
// exchange.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

/// Lifecycle status of a single order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub price: Option<f64>,
    pub status: OrderStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// In-memory order ledger, hydrated from and persisted to `persistence.rs`.
pub struct OrderState {
    orders: RwLock<HashMap<String, Order>>,
    client_index: RwLock<HashMap<String, String>>,
}

impl OrderState {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            client_index: RwLock::new(HashMap::new()),
        }
    }

    /// Restore orders loaded from persistence on startup.
    pub fn hydrate(&self, orders: Vec<Order>) {
        let mut by_id = self.orders.write();
        let mut idx = self.client_index.write();
        for order in orders {
            idx.insert(order.client_order_id.clone(), order.order_id.clone());
            by_id.insert(order.order_id.clone(), order);
        }
    }

    /// Reserve a client order id for `symbol`/`side`/`quantity` before the
    /// broker call is made, so a concurrent retry with the same key observes
    /// the same order instead of racing a second broker call.
    ///
    /// Returns `Existing(order)` if `client_order_id` was already reserved,
    /// or `Created(order)` if this call created the reservation.
    pub fn reserve(
        &self,
        client_order_id: &str,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: Option<f64>,
    ) -> ReserveOutcome {
        let mut idx = self.client_index.write();
        if let Some(existing_id) = idx.get(client_order_id) {
            let orders = self.orders.read();
            let order = orders.get(existing_id).cloned().expect("index/orders desync");
            return ReserveOutcome::Existing(order);
        }

        let order_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let order = Order {
            order_id: order_id.clone(),
            client_order_id: client_order_id.to_string(),
            symbol: symbol.to_string(),
            side,
            quantity,
            filled_quantity: 0.0,
            price,
            status: OrderStatus::New,
            created_at: now.clone(),
            updated_at: now,
        };

        idx.insert(client_order_id.to_string(), order_id.clone());
        self.orders.write().insert(order_id, order.clone());
        ReserveOutcome::Created(order)
    }

    pub fn mark_submitted(&self, order_id: &str) {
        self.update_status(order_id, OrderStatus::Submitted);
    }

    pub fn mark_rejected(&self, order_id: &str) {
        self.update_status(order_id, OrderStatus::Rejected);
    }

    pub fn record_fill(&self, order_id: &str, filled_quantity: f64, fully_filled: bool) {
        let mut orders = self.orders.write();
        if let Some(order) = orders.get_mut(order_id) {
            order.filled_quantity = filled_quantity;
            order.status = if fully_filled {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
            order.updated_at = Utc::now().to_rfc3339();
        }
    }

    fn update_status(&self, order_id: &str, status: OrderStatus) {
        let mut orders = self.orders.write();
        if let Some(order) = orders.get_mut(order_id) {
            order.status = status;
            order.updated_at = Utc::now().to_rfc3339();
        }
    }

    /// Overwrite an order's fill/status fields from an authoritative
    /// exchange-side view, as fetched by the reconciler. No-op if the order
    /// id is unknown locally.
    pub fn upsert_from_exchange_status(&self, order_id: &str, status_str: &str, filled_quantity: f64) {
        let mut orders = self.orders.write();
        if let Some(order) = orders.get_mut(order_id) {
            order.filled_quantity = filled_quantity;
            order.status = exchange_status_to_order_status(status_str);
            order.updated_at = Utc::now().to_rfc3339();
        }
    }

    pub fn get(&self, order_id: &str) -> Option<Order> {
        self.orders.read().get(order_id).cloned()
    }

    pub fn get_by_client_id(&self, client_order_id: &str) -> Option<Order> {
        let idx = self.client_index.read();
        let order_id = idx.get(client_order_id)?;
        self.orders.read().get(order_id).cloned()
    }

    pub fn all(&self) -> Vec<Order> {
        self.orders.read().values().cloned().collect()
    }
}

/// Map a venue's raw order status string onto the internal lifecycle enum.
/// Tolerates both the single- and double-L "cancel(l)ed" spellings venues use.
fn exchange_status_to_order_status(status: &str) -> OrderStatus {
    match status {
        "NEW" => OrderStatus::New,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "CANCELLED" | "EXPIRED" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        _ => OrderStatus::Submitted,
    }
}

impl Default for OrderState {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of [`OrderState::reserve`].
pub enum ReserveOutcome {
    Created(Order),
    Existing(Order),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_is_idempotent_on_client_order_id() {
        let state = OrderState::new();
        let first = state.reserve("key-1", "BTCUSDT", Side::Buy, 0.01, Some(50000.0));
        let second = state.reserve("key-1", "BTCUSDT", Side::Buy, 0.01, Some(50000.0));

        let (id_a, id_b) = match (first, second) {
            (ReserveOutcome::Created(a), ReserveOutcome::Existing(b)) => (a.order_id, b.order_id),
            _ => panic!("expected Created then Existing"),
        };
        assert_eq!(id_a, id_b);
        assert_eq!(state.all().len(), 1);
    }

    #[test]
    fn record_fill_updates_status() {
        let state = OrderState::new();
        let order = match state.reserve("k", "ETHUSDT", Side::Sell, 1.0, None) {
            ReserveOutcome::Created(o) => o,
            _ => unreachable!(),
        };
        state.mark_submitted(&order.order_id);
        state.record_fill(&order.order_id, 1.0, true);
        let updated = state.get(&order.order_id).unwrap();
        assert_eq!(updated.status, OrderStatus::Filled);
        assert!((updated.filled_quantity - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn hydrate_rebuilds_client_index() {
        let state = OrderState::new();
        let order = Order {
            order_id: "o1".into(),
            client_order_id: "c1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            quantity: 1.0,
            filled_quantity: 0.0,
            price: None,
            status: OrderStatus::New,
            created_at: Utc::now().to_rfc3339(),
            updated_at: Utc::now().to_rfc3339(),
        };
        state.hydrate(vec![order]);
        assert!(state.get_by_client_id("c1").is_some());
    }
}

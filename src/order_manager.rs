// =============================================================================
// Order Manager — idempotent signal submission
// =============================================================================
//
// Generalises execution.rs's demo/live split: every signal now reserves a
// client order id in order_state.rs before it touches anything else, so a
// retried submit_signal call (scheduler overlap, a crashed task resumed)
// observes the existing reservation instead of placing a second order.
// Demo mode fills synthetically against the reservation; live mode dispatches
// through the retry executor to whichever ExchangeAdapter AccountMode
// selects.
// =============================================================================

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::event_bus::{EventBus, PositionEvent, TradeEvent};
use crate::exchange_adapter::{ExchangeAdapter, OrderSide};
use crate::gatekeeper::{GateContext, GateDecision, Gatekeeper};
use crate::inventory::InventoryManager;
use crate::journal::{Journal, JournalEntryKind};
use crate::order_state::{Order, OrderState, ReserveOutcome, Side};
use crate::position_state_machine::{LifecycleStatus, PositionStateMachine};
use crate::retry::RetryExecutor;
use crate::types::AccountMode;

/// Everything submit_signal needs to place or simulate one order.
pub struct SignalRequest {
    pub symbol: String,
    pub asset: String,
    pub side: Side,
    pub quantity: f64,
    pub price: Option<f64>,
    /// Caller-chosen idempotency key; pass the same value on a retried call
    /// of the same logical signal.
    pub client_order_id: String,
}

pub enum SubmitOutcome {
    Placed(Order),
    Simulated(Order),
    Blocked { gate: &'static str, reason: String },
    Rejected(String),
}

pub struct OrderManager {
    order_state: Arc<OrderState>,
    inventory: Arc<InventoryManager>,
    gatekeeper: Arc<Gatekeeper>,
    position_sm: Arc<PositionStateMachine>,
    retry_executor: Arc<RetryExecutor>,
    event_bus: Arc<EventBus>,
    journal: Arc<Journal>,
}

impl OrderManager {
    pub fn new(
        order_state: Arc<OrderState>,
        inventory: Arc<InventoryManager>,
        gatekeeper: Arc<Gatekeeper>,
        position_sm: Arc<PositionStateMachine>,
        retry_executor: Arc<RetryExecutor>,
        event_bus: Arc<EventBus>,
        journal: Arc<Journal>,
    ) -> Self {
        Self {
            order_state,
            inventory,
            gatekeeper,
            position_sm,
            retry_executor,
            event_bus,
            journal,
        }
    }

    /// Submit a signal for execution. Idempotent on `request.client_order_id`:
    /// a call reusing a key that already reserved an order returns that
    /// order's current state instead of creating a second one. This check
    /// runs before the gate pipeline so a retried call never re-evaluates
    /// (and re-triggers the cooldown gate's timestamp bookkeeping for) a
    /// signal that has already been accepted.
    pub async fn submit_signal(
        &self,
        request: SignalRequest,
        account_mode: AccountMode,
        adapter: &dyn ExchangeAdapter,
        gate_ctx: &GateContext<'_>,
    ) -> SubmitOutcome {
        if let Some(existing) = self.order_state.get_by_client_id(&request.client_order_id) {
            info!(
                client_order_id = %request.client_order_id,
                order_id = %existing.order_id,
                "submit_signal idempotent replay — returning existing order"
            );
            return SubmitOutcome::Placed(existing);
        }

        match self.gatekeeper.evaluate(gate_ctx) {
            GateDecision::Veto { gate, reason } => {
                self.journal.record(
                    &request.symbol,
                    Some(&request.client_order_id),
                    JournalEntryKind::GateVeto,
                    format!("{gate}: {reason}"),
                );
                return SubmitOutcome::Blocked { gate, reason };
            }
            GateDecision::Allow => {}
        }

        let outcome = self.order_state.reserve(
            &request.client_order_id,
            &request.symbol,
            request.side,
            request.quantity,
            request.price,
        );

        let order = match outcome {
            ReserveOutcome::Existing(order) => {
                info!(
                    client_order_id = %request.client_order_id,
                    order_id = %order.order_id,
                    "submit_signal idempotent replay — returning existing order"
                );
                return SubmitOutcome::Placed(order);
            }
            ReserveOutcome::Created(order) => order,
        };

        self.journal.record(
            &request.symbol,
            Some(&request.client_order_id),
            JournalEntryKind::OrderReserved,
            format!("{:?} {} @ {:?}", request.side, request.quantity, request.price),
        );

        if matches!(request.side, Side::Sell) {
            if let Err(e) = self.inventory.reserve(&request.asset, request.quantity) {
                self.order_state.mark_rejected(&order.order_id);
                self.journal.record(
                    &request.symbol,
                    Some(&request.client_order_id),
                    JournalEntryKind::OrderRejected,
                    format!("inventory reservation failed: {e}"),
                );
                return SubmitOutcome::Rejected(e.to_string());
            }
        }

        let _ = self
            .position_sm
            .transition(&request.symbol, LifecycleStatus::PendingEntry);

        if account_mode == AccountMode::Demo {
            return self.fill_demo(request, order);
        }

        self.submit_live(request, order, adapter).await
    }

    fn fill_demo(&self, request: SignalRequest, order: Order) -> SubmitOutcome {
        let sim_id = Uuid::new_v4().to_string();
        self.order_state.mark_submitted(&order.order_id);
        self.order_state.record_fill(&order.order_id, request.quantity, true);

        let fill_price = request.price.unwrap_or(0.0);
        // Demo fills never incur real fees; the adapter layer reports no
        // fee figures either, so live fills below pass 0.0 as well.
        self.inventory.confirm_fill(&request.asset, matches!(request.side, Side::Buy), request.quantity, fill_price, 0.0);

        let _ = self.position_sm.transition(&request.symbol, LifecycleStatus::Filled);

        self.journal.record(
            &request.symbol,
            Some(&request.client_order_id),
            JournalEntryKind::OrderFilled,
            format!("demo fill sim_id={sim_id}"),
        );

        let side_str = match request.side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        self.event_bus.publish_trade(TradeEvent {
            symbol: request.symbol.clone(),
            side: side_str.to_string(),
            quantity: request.quantity,
            price: fill_price,
            at_ms: chrono::Utc::now().timestamp_millis(),
        });
        self.event_bus.publish_position(PositionEvent {
            symbol: request.symbol.clone(),
            status: "filled".to_string(),
            at_ms: chrono::Utc::now().timestamp_millis(),
        });

        let filled = self.order_state.get(&order.order_id).unwrap_or(order);
        SubmitOutcome::Simulated(filled)
    }

    async fn submit_live(
        &self,
        request: SignalRequest,
        order: Order,
        adapter: &dyn ExchangeAdapter,
    ) -> SubmitOutcome {
        let side = match request.side {
            Side::Buy => OrderSide::Buy,
            Side::Sell => OrderSide::Sell,
        };

        let result = self
            .retry_executor
            .run(|| adapter.place_order(&request.symbol, side, request.quantity, request.price, &request.client_order_id))
            .await;

        match result {
            Ok(placed) => {
                self.order_state.mark_submitted(&order.order_id);
                let fully_filled = placed.filled_quantity >= request.quantity - 1e-9;
                self.order_state.record_fill(&order.order_id, placed.filled_quantity, fully_filled);

                if placed.filled_quantity > 0.0 {
                    let price = placed.avg_fill_price.or(request.price).unwrap_or(0.0);
                    // No adapter currently reports a fee/commission figure on
                    // a placed order, so cash bookkeeping treats fees as 0.0
                    // until that lands.
                    self.inventory.confirm_fill(
                        &request.asset,
                        matches!(request.side, Side::Buy),
                        placed.filled_quantity,
                        price,
                        0.0,
                    );
                }

                if fully_filled {
                    let _ = self.position_sm.transition(&request.symbol, LifecycleStatus::Filled);
                }

                self.journal.record(
                    &request.symbol,
                    Some(&request.client_order_id),
                    JournalEntryKind::OrderFilled,
                    format!("live order {} status={}", placed.exchange_order_id, placed.status),
                );

                let updated = self.order_state.get(&order.order_id).unwrap_or(order);
                SubmitOutcome::Placed(updated)
            }
            Err(e) => {
                warn!(symbol = %request.symbol, error = %e, "live order submission failed");
                if matches!(request.side, Side::Sell) {
                    self.inventory.release_reservation(&request.asset, request.quantity);
                }
                self.order_state.mark_rejected(&order.order_id);
                let _ = self.position_sm.transition(&request.symbol, LifecycleStatus::Flat);
                self.journal.record(
                    &request.symbol,
                    Some(&request.client_order_id),
                    JournalEntryKind::OrderRejected,
                    e.to_string(),
                );
                SubmitOutcome::Rejected(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange_adapter::UnavailableAdapter;
    use crate::kill_switch::KillSwitch;
    use crate::risk::RiskEngine;
    use crate::types::TradingMode;

    fn manager() -> OrderManager {
        OrderManager::new(
            Arc::new(OrderState::new()),
            Arc::new(InventoryManager::new()),
            Arc::new(Gatekeeper::new(
                Default::default(),
                Arc::new(KillSwitch::new(Default::default())),
                Arc::new(RiskEngine::new(1000.0, 0.03, 5, 0.05, 50)),
                Arc::new(InventoryManager::new()),
            )),
            Arc::new(PositionStateMachine::new()),
            Arc::new(RetryExecutor::new(Default::default())),
            Arc::new(EventBus::new()),
            Journal::new(100),
        )
    }

    fn ctx<'a>(symbol: &'a str) -> GateContext<'a> {
        GateContext {
            symbol,
            side: "BUY",
            confidence: 0.9,
            trading_mode: TradingMode::Live,
            account_mode: AccountMode::Demo,
            allow_live_trading: false,
            open_position_count: 0,
            has_open_position_for_symbol: false,
            position_notional_usd: 100.0,
            spread_bps: Some(5.0),
            expected_edge_bps: 5.0,
            adx: Some(25.0),
            asset: "BTC",
            sell_quantity: None,
        }
    }

    #[tokio::test]
    async fn demo_submit_fills_synthetically() {
        let mgr = manager();
        let adapter = UnavailableAdapter::new("demo");
        let req = SignalRequest {
            symbol: "BTCUSDT".into(),
            asset: "BTC".into(),
            side: Side::Buy,
            quantity: 0.01,
            price: Some(50_000.0),
            client_order_id: "req-1".into(),
        };
        let outcome = mgr.submit_signal(req, AccountMode::Demo, &adapter, &ctx("BTCUSDT")).await;
        match outcome {
            SubmitOutcome::Simulated(order) => assert_eq!(order.status, crate::order_state::OrderStatus::Filled),
            _ => panic!("expected simulated fill"),
        }
    }

    #[tokio::test]
    async fn repeated_client_order_id_is_idempotent() {
        let mgr = manager();
        let adapter = UnavailableAdapter::new("demo");
        let req1 = SignalRequest {
            symbol: "BTCUSDT".into(),
            asset: "BTC".into(),
            side: Side::Buy,
            quantity: 0.01,
            price: Some(50_000.0),
            client_order_id: "dup-key".into(),
        };
        let req2 = SignalRequest {
            symbol: "BTCUSDT".into(),
            asset: "BTC".into(),
            side: Side::Buy,
            quantity: 0.01,
            price: Some(50_000.0),
            client_order_id: "dup-key".into(),
        };
        mgr.submit_signal(req1, AccountMode::Demo, &adapter, &ctx("BTCUSDT")).await;
        let second = mgr.submit_signal(req2, AccountMode::Demo, &adapter, &ctx("BTCUSDT")).await;
        match second {
            SubmitOutcome::Placed(order) => assert_eq!(order.client_order_id, "dup-key"),
            _ => panic!("expected idempotent replay to return Placed(existing order)"),
        }
        assert_eq!(mgr.order_state.all().len(), 1);
    }

    #[tokio::test]
    async fn gate_veto_blocks_before_any_reservation() {
        let mgr = manager();
        let adapter = UnavailableAdapter::new("demo");
        let mut c = ctx("BTCUSDT");
        c.account_mode = AccountMode::Live;
        c.allow_live_trading = false;
        let req = SignalRequest {
            symbol: "BTCUSDT".into(),
            asset: "BTC".into(),
            side: Side::Buy,
            quantity: 0.01,
            price: Some(50_000.0),
            client_order_id: "blocked-1".into(),
        };
        let outcome = mgr.submit_signal(req, AccountMode::Demo, &adapter, &c).await;
        assert!(matches!(outcome, SubmitOutcome::Blocked { gate: "mode_gate", .. }));
        assert!(mgr.order_state.all().is_empty());
    }
}

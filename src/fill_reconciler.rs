// =============================================================================
// Fill Reconciler — periodic aggregated-fill comparison against the journal
// =============================================================================
//
// Runs independently of reconciler.rs's open-order pass, on its own longer
// period. The adapter trait exposes no bulk "list fills since timestamp"
// endpoint, so this walks every locally known order that settled into
// Filled/PartiallyFilled since the last cursor and re-fetches it via
// ExchangeAdapter::get_order for the venue's authoritative aggregate filled
// quantity — the number a per-fill feed grouped by orderId would converge on.
// Mismatches are journaled so the audit trail carries the discrepancy, not
// just the counters.
//
// fee_mismatches stays 0 — no adapter reports a commission figure anywhere in
// this codebase, so there is nothing to compare fees against yet.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CoreError;
use crate::exchange_adapter::ExchangeAdapter;
use crate::journal::{Journal, JournalEntryKind};
use crate::order_state::{Order, OrderState, OrderStatus};

const QTY_MISMATCH_TOLERANCE: f64 = 1e-8;

/// Summary of a single fill-reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FillReconcileReport {
    pub orders_checked: u32,
    pub qty_mismatches: u32,
    pub fee_mismatches: u32,
    pub orphan_fills: u32,
}

pub struct FillReconciler {
    order_state: Arc<OrderState>,
    journal: Arc<Journal>,
    cursor: RwLock<Option<DateTime<Utc>>>,
}

impl FillReconciler {
    pub fn new(order_state: Arc<OrderState>, journal: Arc<Journal>) -> Self {
        Self {
            order_state,
            journal,
            cursor: RwLock::new(None),
        }
    }

    /// Compare every order that reached a filled state since the last cursor
    /// against the venue's authoritative view of it.
    pub async fn reconcile_once(&self, adapter: &dyn ExchangeAdapter) -> Result<FillReconcileReport, CoreError> {
        let since = *self.cursor.read();
        let now = Utc::now();

        let candidates: Vec<Order> = self
            .order_state
            .all()
            .into_iter()
            .filter(|o| matches!(o.status, OrderStatus::Filled | OrderStatus::PartiallyFilled))
            .filter(|o| since.map_or(true, |cursor| updated_at(o) > cursor))
            .collect();

        let mut report = FillReconcileReport {
            orders_checked: candidates.len() as u32,
            ..Default::default()
        };

        for order in &candidates {
            match adapter.get_order(&order.symbol, &order.order_id).await {
                Ok(authoritative) => {
                    if (authoritative.filled_quantity - order.filled_quantity).abs() > QTY_MISMATCH_TOLERANCE {
                        report.qty_mismatches += 1;
                        warn!(
                            order_id = %order.order_id,
                            internal_qty = order.filled_quantity,
                            venue_qty = authoritative.filled_quantity,
                            "fill quantity mismatch against venue"
                        );
                        self.journal.record(
                            &order.symbol,
                            Some(&order.client_order_id),
                            JournalEntryKind::FillMismatch,
                            format!(
                                "order {} internal filled_quantity={} venue filled_quantity={}",
                                order.order_id, order.filled_quantity, authoritative.filled_quantity
                            ),
                        );
                    }
                }
                Err(e) => {
                    warn!(order_id = %order.order_id, error = %e, "could not confirm fill against venue");
                }
            }
        }

        *self.cursor.write() = Some(now);
        Ok(report)
    }
}

fn updated_at(order: &Order) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&order.updated_at)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange_adapter::UnavailableAdapter;
    use crate::order_state::Side;

    #[tokio::test]
    async fn no_candidates_yields_empty_report() {
        let fr = FillReconciler::new(Arc::new(OrderState::new()), Journal::new(50));
        let adapter = UnavailableAdapter::new("test");
        let report = fr.reconcile_once(&adapter).await.unwrap();
        assert_eq!(report.orders_checked, 0);
        assert_eq!(report.qty_mismatches, 0);
    }

    #[tokio::test]
    async fn filled_order_is_checked_against_venue() {
        let order_state = Arc::new(OrderState::new());
        let outcome = order_state.reserve("c1", "BTCUSDT", Side::Buy, 1.0, Some(50_000.0));
        let order = match outcome {
            crate::order_state::ReserveOutcome::Created(o) => o,
            crate::order_state::ReserveOutcome::Existing(o) => o,
        };
        order_state.mark_submitted(&order.order_id);
        order_state.record_fill(&order.order_id, 1.0, true);

        let fr = FillReconciler::new(order_state, Journal::new(50));
        let adapter = UnavailableAdapter::new("test");
        let report = fr.reconcile_once(&adapter).await.unwrap();
        assert_eq!(report.orders_checked, 1);
        // UnavailableAdapter errors on get_order, so no mismatch can be
        // confirmed either way.
        assert_eq!(report.qty_mismatches, 0);
    }

    #[tokio::test]
    async fn second_pass_only_rechecks_orders_updated_since_cursor() {
        let order_state = Arc::new(OrderState::new());
        let outcome = order_state.reserve("c1", "BTCUSDT", Side::Buy, 1.0, Some(50_000.0));
        let order = match outcome {
            crate::order_state::ReserveOutcome::Created(o) => o,
            crate::order_state::ReserveOutcome::Existing(o) => o,
        };
        order_state.mark_submitted(&order.order_id);
        order_state.record_fill(&order.order_id, 1.0, true);

        let fr = FillReconciler::new(order_state, Journal::new(50));
        let adapter = UnavailableAdapter::new("test");
        let first = fr.reconcile_once(&adapter).await.unwrap();
        assert_eq!(first.orders_checked, 1);

        let second = fr.reconcile_once(&adapter).await.unwrap();
        assert_eq!(second.orders_checked, 0);
    }
}

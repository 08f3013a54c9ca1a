// =============================================================================
// Journal — append-only audit trail of order lifecycle events
// =============================================================================
//
// Distinct from position_engine.rs's closed-position ledger (P&L-focused,
// backs the existing /trade-journal REST route): this journal records every
// order-manager decision point — reservation, submission, fill, rejection,
// gate veto — so an operator reconstructing "what happened to order X" has
// a full timeline rather than just the final closed-position row.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub at: String,
    pub symbol: String,
    pub client_order_id: Option<String>,
    pub kind: JournalEntryKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalEntryKind {
    GateVeto,
    OrderReserved,
    OrderSubmitted,
    OrderRejected,
    OrderFilled,
    ReconcileDrift,
    FillMismatch,
}

/// Bounded append-only log kept in memory and mirrored to the caller's
/// persistence layer; the in-memory copy is what the dashboard reads.
pub struct Journal {
    entries: RwLock<Vec<JournalEntry>>,
    max_entries: usize,
}

impl Journal {
    pub fn new(max_entries: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(Vec::new()),
            max_entries,
        })
    }

    pub fn record(&self, symbol: &str, client_order_id: Option<&str>, kind: JournalEntryKind, detail: impl Into<String>) {
        let entry = JournalEntry {
            at: Utc::now().to_rfc3339(),
            symbol: symbol.to_string(),
            client_order_id: client_order_id.map(|s| s.to_string()),
            kind,
            detail: detail.into(),
        };
        let mut entries = self.entries.write();
        entries.push(entry);
        while entries.len() > self.max_entries {
            entries.remove(0);
        }
    }

    pub fn recent(&self, count: usize) -> Vec<JournalEntry> {
        let entries = self.entries.read();
        let start = entries.len().saturating_sub(count);
        entries[start..].to_vec()
    }

    pub fn for_symbol(&self, symbol: &str) -> Vec<JournalEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.symbol == symbol)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_capped_at_max_entries() {
        let journal = Journal::new(3);
        for i in 0..5 {
            journal.record("BTCUSDT", None, JournalEntryKind::OrderReserved, format!("entry {i}"));
        }
        assert_eq!(journal.recent(10).len(), 3);
        assert_eq!(journal.recent(10)[0].detail, "entry 2");
    }

    #[test]
    fn for_symbol_filters_correctly() {
        let journal = Journal::new(10);
        journal.record("BTCUSDT", None, JournalEntryKind::OrderReserved, "a");
        journal.record("ETHUSDT", None, JournalEntryKind::OrderReserved, "b");
        assert_eq!(journal.for_symbol("BTCUSDT").len(), 1);
    }
}

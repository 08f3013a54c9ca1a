// =============================================================================
// Position State Machine — canonical position lifecycle
// =============================================================================
//
// flat -> pending_entry -> filled -> managing -> pending_exit -> exited
//
// Distinct from position_engine.rs's PositionManager, which tracks P&L and
// TP1/TP2/trailing-stop bookkeeping for the bundled strategy. This module is
// the authoritative lifecycle record: it only cares about which transitions
// are legal and rejects everything else.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleStatus {
    Flat,
    PendingEntry,
    Filled,
    Managing,
    PendingExit,
    Exited,
}

impl std::fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Flat => "flat",
            Self::PendingEntry => "pending_entry",
            Self::Filled => "filled",
            Self::Managing => "managing",
            Self::PendingExit => "pending_exit",
            Self::Exited => "exited",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Error)]
#[error("invalid transition for {symbol}: {from} -> {to}")]
pub struct InvalidTransition {
    pub symbol: String,
    pub from: LifecycleStatus,
    pub to: LifecycleStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionLifecycle {
    pub symbol: String,
    pub status: LifecycleStatus,
    pub updated_at: String,
}

impl LifecycleStatus {
    fn from_label(label: &str) -> Option<Self> {
        match label {
            "flat" => Some(Self::Flat),
            "pending_entry" => Some(Self::PendingEntry),
            "filled" => Some(Self::Filled),
            "managing" => Some(Self::Managing),
            "pending_exit" => Some(Self::PendingExit),
            "exited" => Some(Self::Exited),
            _ => None,
        }
    }
}

fn is_legal(from: LifecycleStatus, to: LifecycleStatus) -> bool {
    use LifecycleStatus::*;
    matches!(
        (from, to),
        (Flat, PendingEntry)
            | (PendingEntry, Filled)
            | (PendingEntry, Flat) // entry order rejected/cancelled
            | (Filled, Managing)
            | (Managing, Managing) // stop/target update, no lifecycle change
            | (Managing, PendingExit)
            | (PendingExit, Exited)
    )
}

/// Per-symbol position lifecycle tracker.
pub struct PositionStateMachine {
    states: RwLock<HashMap<String, LifecycleStatus>>,
}

impl PositionStateMachine {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn status(&self, symbol: &str) -> LifecycleStatus {
        *self
            .states
            .read()
            .get(symbol)
            .unwrap_or(&LifecycleStatus::Flat)
    }

    /// Attempt a transition, returning the new lifecycle record on success.
    pub fn transition(
        &self,
        symbol: &str,
        to: LifecycleStatus,
    ) -> Result<PositionLifecycle, InvalidTransition> {
        let mut states = self.states.write();
        let from = *states.get(symbol).unwrap_or(&LifecycleStatus::Flat);

        if !is_legal(from, to) {
            return Err(InvalidTransition {
                symbol: symbol.to_string(),
                from,
                to,
            });
        }

        states.insert(symbol.to_string(), to);
        debug!(symbol, %from, %to, "position lifecycle transition");

        Ok(PositionLifecycle {
            symbol: symbol.to_string(),
            status: to,
            updated_at: Utc::now().to_rfc3339(),
        })
    }

    /// Restore lifecycle state from persisted (symbol, status label) rows.
    /// Bypasses transition legality checks since the rows already reflect a
    /// legal history; unrecognized labels are skipped. `exited` rows are not
    /// hydrated — a completed round starts the next run at `flat`.
    pub fn hydrate(&self, rows: Vec<(String, String)>) {
        let mut states = self.states.write();
        for (symbol, label) in rows {
            match LifecycleStatus::from_label(&label) {
                Some(LifecycleStatus::Exited) | None => {}
                Some(status) => {
                    states.insert(symbol, status);
                }
            }
        }
    }

    pub fn snapshot(&self) -> Vec<PositionLifecycle> {
        self.states
            .read()
            .iter()
            .map(|(symbol, status)| PositionLifecycle {
                symbol: symbol.clone(),
                status: *status,
                updated_at: Utc::now().to_rfc3339(),
            })
            .collect()
    }
}

impl Default for PositionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleStatus::*;

    #[test]
    fn happy_path_through_full_lifecycle() {
        let sm = PositionStateMachine::new();
        sm.transition("BTCUSDT", PendingEntry).unwrap();
        sm.transition("BTCUSDT", Filled).unwrap();
        sm.transition("BTCUSDT", Managing).unwrap();
        sm.transition("BTCUSDT", PendingExit).unwrap();
        sm.transition("BTCUSDT", Exited).unwrap();
        assert_eq!(sm.status("BTCUSDT"), Exited);
    }

    #[test]
    fn rejects_skipping_states() {
        let sm = PositionStateMachine::new();
        let err = sm.transition("ETHUSDT", Filled).unwrap_err();
        assert_eq!(err.from, Flat);
        assert_eq!(err.to, Filled);
    }

    #[test]
    fn entry_order_rejection_returns_to_flat() {
        let sm = PositionStateMachine::new();
        sm.transition("BTCUSDT", PendingEntry).unwrap();
        sm.transition("BTCUSDT", Flat).unwrap();
        assert_eq!(sm.status("BTCUSDT"), Flat);
    }

    #[test]
    fn exited_has_no_legal_outgoing_transition() {
        let sm = PositionStateMachine::new();
        sm.transition("BTCUSDT", PendingEntry).unwrap();
        sm.transition("BTCUSDT", Filled).unwrap();
        sm.transition("BTCUSDT", Managing).unwrap();
        sm.transition("BTCUSDT", PendingExit).unwrap();
        sm.transition("BTCUSDT", Exited).unwrap();
        assert!(sm.transition("BTCUSDT", Flat).is_err());
    }

    #[test]
    fn managing_self_transition_is_legal_for_stop_updates() {
        let sm = PositionStateMachine::new();
        sm.transition("BTCUSDT", PendingEntry).unwrap();
        sm.transition("BTCUSDT", Filled).unwrap();
        sm.transition("BTCUSDT", Managing).unwrap();
        sm.transition("BTCUSDT", Managing).unwrap();
        assert_eq!(sm.status("BTCUSDT"), Managing);
    }

    #[test]
    fn pending_exit_cannot_fall_back_to_managing() {
        let sm = PositionStateMachine::new();
        sm.transition("BTCUSDT", PendingEntry).unwrap();
        sm.transition("BTCUSDT", Filled).unwrap();
        sm.transition("BTCUSDT", Managing).unwrap();
        sm.transition("BTCUSDT", PendingExit).unwrap();
        assert!(sm.transition("BTCUSDT", Managing).is_err());
    }

    #[test]
    fn untracked_symbol_defaults_to_flat() {
        let sm = PositionStateMachine::new();
        assert_eq!(sm.status("XRPUSDT"), Flat);
    }

    #[test]
    fn hydrate_restores_persisted_status() {
        let sm = PositionStateMachine::new();
        sm.hydrate(vec![("BTCUSDT".to_string(), "managing".to_string())]);
        assert_eq!(sm.status("BTCUSDT"), Managing);
    }

    #[test]
    fn hydrate_skips_unrecognized_labels() {
        let sm = PositionStateMachine::new();
        sm.hydrate(vec![("BTCUSDT".to_string(), "bogus".to_string())]);
        assert_eq!(sm.status("BTCUSDT"), Flat);
    }

    #[test]
    fn hydrate_does_not_restore_exited_rows() {
        let sm = PositionStateMachine::new();
        sm.hydrate(vec![("BTCUSDT".to_string(), "exited".to_string())]);
        assert_eq!(sm.status("BTCUSDT"), Flat);
    }
}

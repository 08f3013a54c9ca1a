// =============================================================================
// Kill Switch — persisted, sticky, multi-trigger trading halt
// =============================================================================
//
// Distinct from risk.rs's circuit breakers (which reset daily and only feed
// the gatekeeper's `daily_loss` gate): once tripped, the kill switch stays
// tripped across restarts until an operator explicitly resets it. Four
// independent triggers can trip it: max drawdown, consecutive losses, API
// error rate, and a rolling window of spread-guard violations.
// =============================================================================

use std::collections::VecDeque;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchConfig {
    pub max_drawdown_pct: f64,
    pub max_consecutive_losses: u32,
    pub api_error_threshold: u32,
    pub spread_violations_limit: u32,
    pub spread_violations_window_min: i64,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            max_drawdown_pct: 10.0,
            max_consecutive_losses: 8,
            api_error_threshold: 10,
            spread_violations_limit: 5,
            spread_violations_window_min: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchState {
    pub triggered: bool,
    pub reason: Option<String>,
    pub triggered_at: Option<String>,
    pub consecutive_losses: u32,
    /// Rolling window of spread-guard violation timestamps (rfc3339),
    /// verbatim what `record_spread_violation` has accumulated so far.
    pub spread_violations: Vec<String>,
}

struct Inner {
    triggered: bool,
    reason: Option<String>,
    triggered_at: Option<String>,
    consecutive_losses: u32,
    api_errors: VecDeque<chrono::DateTime<Utc>>,
    spread_violations: VecDeque<chrono::DateTime<Utc>>,
}

/// Sticky kill switch. Construct with [`KillSwitch::hydrate`] on startup
/// using the row loaded from `persistence.rs`, or [`KillSwitch::new`] for a
/// fresh engine.
pub struct KillSwitch {
    config: KillSwitchConfig,
    state: RwLock<Inner>,
}

impl KillSwitch {
    pub fn new(config: KillSwitchConfig) -> Self {
        Self {
            config,
            state: RwLock::new(Inner {
                triggered: false,
                reason: None,
                triggered_at: None,
                consecutive_losses: 0,
                api_errors: VecDeque::new(),
                spread_violations: VecDeque::new(),
            }),
        }
    }

    /// Rebuild from a persisted snapshot (e.g. loaded from the `kill_switch`
    /// sqlite row on startup).
    pub fn hydrate(config: KillSwitchConfig, persisted: KillSwitchState) -> Self {
        let switch = Self::new(config);
        {
            let mut s = switch.state.write();
            s.triggered = persisted.triggered;
            s.reason = persisted.reason;
            s.triggered_at = persisted.triggered_at;
            s.consecutive_losses = persisted.consecutive_losses;
            s.spread_violations = persisted
                .spread_violations
                .iter()
                .filter_map(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))
                .collect();
        }
        switch
    }

    pub fn is_triggered(&self) -> bool {
        self.state.read().triggered
    }

    pub fn snapshot(&self) -> KillSwitchState {
        let s = self.state.read();
        KillSwitchState {
            triggered: s.triggered,
            reason: s.reason.clone(),
            triggered_at: s.triggered_at.clone(),
            consecutive_losses: s.consecutive_losses,
            spread_violations: s.spread_violations.iter().map(|t| t.to_rfc3339()).collect(),
        }
    }

    /// Record a completed trade's realized PnL and consecutive-loss streak.
    pub fn record_trade_result(&self, pnl: f64) {
        let mut s = self.state.write();
        if pnl < 0.0 {
            s.consecutive_losses += 1;
        } else {
            s.consecutive_losses = 0;
        }
        if s.consecutive_losses >= self.config.max_consecutive_losses {
            Self::trip(&mut s, format!(
                "consecutive losses reached {} (limit {})",
                s.consecutive_losses, self.config.max_consecutive_losses
            ));
        }
    }

    /// Check a drawdown percentage (0-100 scale) and trip if it exceeds the
    /// configured ceiling.
    pub fn check_drawdown(&self, drawdown_pct: f64) {
        if drawdown_pct < self.config.max_drawdown_pct {
            return;
        }
        let mut s = self.state.write();
        Self::trip(
            &mut s,
            format!(
                "drawdown {:.2}% reached limit {:.2}%",
                drawdown_pct, self.config.max_drawdown_pct
            ),
        );
    }

    /// Record a spread-guard violation and trip if the rolling window count
    /// exceeds the configured limit.
    pub fn record_spread_violation(&self) {
        let mut s = self.state.write();
        let now = Utc::now();
        s.spread_violations.push_back(now);
        let cutoff = now - chrono::Duration::minutes(self.config.spread_violations_window_min);
        while s.spread_violations.front().is_some_and(|t| *t < cutoff) {
            s.spread_violations.pop_front();
        }
        if s.spread_violations.len() as u32 >= self.config.spread_violations_limit {
            Self::trip(
                &mut s,
                format!(
                    "{} spread violations in the last {} minutes",
                    s.spread_violations.len(),
                    self.config.spread_violations_window_min
                ),
            );
        }
    }

    /// Record an API error and trip if the rolling count within the last
    /// minute exceeds the configured threshold.
    pub fn check_api_errors(&self) {
        let mut s = self.state.write();
        let now = Utc::now();
        s.api_errors.push_back(now);
        let cutoff = now - chrono::Duration::minutes(1);
        while s.api_errors.front().is_some_and(|t| *t < cutoff) {
            s.api_errors.pop_front();
        }
        if s.api_errors.len() as u32 >= self.config.api_error_threshold {
            Self::trip(
                &mut s,
                format!(
                    "{} API errors in the last minute (threshold {})",
                    s.api_errors.len(),
                    self.config.api_error_threshold
                ),
            );
        }
    }

    /// Explicitly reset the kill switch (operator action only).
    pub fn reset(&self) {
        let mut s = self.state.write();
        s.triggered = false;
        s.reason = None;
        s.triggered_at = None;
        s.consecutive_losses = 0;
        s.api_errors.clear();
        s.spread_violations.clear();
    }

    fn trip(s: &mut Inner, reason: String) {
        if s.triggered {
            return;
        }
        warn!(reason = %reason, "kill switch triggered");
        s.triggered = true;
        s.reason = Some(reason);
        s.triggered_at = Some(Utc::now().to_rfc3339());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> KillSwitchConfig {
        KillSwitchConfig {
            max_drawdown_pct: 10.0,
            max_consecutive_losses: 3,
            api_error_threshold: 3,
            spread_violations_limit: 2,
            spread_violations_window_min: 15,
        }
    }

    #[test]
    fn trips_on_consecutive_losses() {
        let ks = KillSwitch::new(test_config());
        ks.record_trade_result(-1.0);
        ks.record_trade_result(-1.0);
        assert!(!ks.is_triggered());
        ks.record_trade_result(-1.0);
        assert!(ks.is_triggered());
    }

    #[test]
    fn winning_trade_resets_streak() {
        let ks = KillSwitch::new(test_config());
        ks.record_trade_result(-1.0);
        ks.record_trade_result(-1.0);
        ks.record_trade_result(1.0);
        ks.record_trade_result(-1.0);
        ks.record_trade_result(-1.0);
        assert!(!ks.is_triggered());
    }

    #[test]
    fn trips_on_drawdown() {
        let ks = KillSwitch::new(test_config());
        ks.check_drawdown(5.0);
        assert!(!ks.is_triggered());
        ks.check_drawdown(11.0);
        assert!(ks.is_triggered());
    }

    #[test]
    fn trips_on_spread_violation_window() {
        let ks = KillSwitch::new(test_config());
        ks.record_spread_violation();
        assert!(!ks.is_triggered());
        ks.record_spread_violation();
        assert!(ks.is_triggered());
    }

    #[test]
    fn is_sticky_until_explicit_reset() {
        let ks = KillSwitch::new(test_config());
        ks.check_drawdown(20.0);
        assert!(ks.is_triggered());
        ks.check_drawdown(0.0);
        assert!(ks.is_triggered());
        ks.reset();
        assert!(!ks.is_triggered());
    }

    #[test]
    fn hydrate_restores_persisted_state() {
        let persisted = KillSwitchState {
            triggered: true,
            reason: Some("manual".into()),
            triggered_at: Some(Utc::now().to_rfc3339()),
            consecutive_losses: 4,
            spread_violations: Vec::new(),
        };
        let ks = KillSwitch::hydrate(test_config(), persisted);
        assert!(ks.is_triggered());
        assert_eq!(ks.snapshot().consecutive_losses, 4);
    }

    #[test]
    fn hydrate_restores_spread_violation_window_verbatim() {
        let violations = vec![Utc::now().to_rfc3339(), Utc::now().to_rfc3339()];
        let persisted = KillSwitchState {
            triggered: false,
            reason: None,
            triggered_at: None,
            consecutive_losses: 0,
            spread_violations: violations.clone(),
        };
        let ks = KillSwitch::hydrate(test_config(), persisted);
        assert_eq!(ks.snapshot().spread_violations.len(), violations.len());

        // One more violation should now trip it, since the window already
        // holds 2 and the limit is 2.
        ks.record_spread_violation();
        assert!(ks.is_triggered());
    }
}

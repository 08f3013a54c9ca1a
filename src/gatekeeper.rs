// =============================================================================
// Trade Gatekeeper — ordered 12-gate veto pipeline
// =============================================================================
//
// Every signal passes through these gates, in order, before it can reach the
// order manager. The first gate to veto wins; later gates are never
// evaluated. This is the authoritative risk pipeline; trade_insurance.rs's
// 8-gate chain is the bundled strategy's own, independent pre-filter and
// still runs ahead of this one, but this module is what the rest of the core
// consults.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::inventory::InventoryManager;
use crate::kill_switch::KillSwitch;
use crate::risk::RiskEngine;
use crate::types::{AccountMode, TradingMode};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    pub max_open_positions: u32,
    pub max_position_size_usd: f64,
    pub max_spread_bps: f64,
    pub cooldown_minutes: i64,
    pub min_expected_edge_bps: f64,
    pub chop_adx_threshold: f64,
    pub min_notional_usd: f64,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            max_open_positions: 3,
            max_position_size_usd: 500.0,
            max_spread_bps: 15.0,
            cooldown_minutes: 5,
            min_expected_edge_bps: 2.0,
            chop_adx_threshold: 15.0,
            min_notional_usd: 10.0,
        }
    }
}

/// Everything the gatekeeper needs to know about a candidate signal to
/// evaluate the gates; the caller (trading_loops.rs / order_manager.rs)
/// assembles this from the rest of AppState each tick.
pub struct GateContext<'a> {
    pub symbol: &'a str,
    pub side: &'a str,
    pub confidence: f64,
    pub trading_mode: TradingMode,
    pub account_mode: AccountMode,
    /// Mirrors `RuntimeConfig::allow_live_trading`. Gate 3 only consults
    /// this when `account_mode == Live`; Demo/paper signals always pass it.
    pub allow_live_trading: bool,
    pub open_position_count: u32,
    pub has_open_position_for_symbol: bool,
    pub position_notional_usd: f64,
    pub spread_bps: Option<f64>,
    pub expected_edge_bps: f64,
    pub adx: Option<f64>,
    pub asset: &'a str,
    pub sell_quantity: Option<f64>,
}

/// Result of a full gate pass.
pub enum GateDecision {
    Allow,
    Veto { gate: &'static str, reason: String },
}

pub struct Gatekeeper {
    config: GatekeeperConfig,
    kill_switch: std::sync::Arc<KillSwitch>,
    risk_engine: std::sync::Arc<RiskEngine>,
    inventory: std::sync::Arc<InventoryManager>,
    last_signal_at: RwLock<HashMap<(String, String), Instant>>,
}

impl Gatekeeper {
    pub fn new(
        config: GatekeeperConfig,
        kill_switch: std::sync::Arc<KillSwitch>,
        risk_engine: std::sync::Arc<RiskEngine>,
        inventory: std::sync::Arc<InventoryManager>,
    ) -> Self {
        Self {
            config,
            kill_switch,
            risk_engine,
            inventory,
            last_signal_at: RwLock::new(HashMap::new()),
        }
    }

    /// Run the full ordered pipeline. Returns `GateDecision::Allow` only if
    /// every gate passes; records the cooldown timestamp as a side effect
    /// when gate 8 is reached and passed.
    pub fn evaluate(&self, ctx: &GateContext) -> GateDecision {
        // Gate 1: kill switch.
        if self.kill_switch.is_triggered() {
            return veto("kill_switch", "kill switch is triggered");
        }

        // Gate 2: hold or zero-confidence signal carries no action.
        if ctx.side.eq_ignore_ascii_case("hold") || ctx.confidence <= 0.0 {
            return veto("hold_or_zero_confidence", "signal carries no actionable confidence");
        }

        // Gate 3: live-account orders require allow_live_trading. Paper/demo
        // signals are never blocked by this gate, regardless of trading_mode.
        if ctx.account_mode == AccountMode::Live && !ctx.allow_live_trading {
            return veto(
                "mode_gate",
                "account_mode is Live but allow_live_trading is false".to_string(),
            );
        }

        // Gate 4: daily loss circuit breaker.
        let (allowed, reason) = self.risk_engine.can_trade();
        if !allowed {
            return veto(
                "daily_loss",
                reason.unwrap_or_else(|| "risk engine blocked".to_string()),
            );
        }

        // Gate 5: max open positions.
        if !ctx.has_open_position_for_symbol && ctx.open_position_count >= self.config.max_open_positions
        {
            return veto(
                "max_open_positions",
                format!(
                    "{} open positions >= limit {}",
                    ctx.open_position_count, self.config.max_open_positions
                ),
            );
        }

        // Gate 6: max position size.
        if ctx.position_notional_usd > self.config.max_position_size_usd {
            return veto(
                "max_position_size",
                format!(
                    "position notional {:.2} exceeds limit {:.2}",
                    ctx.position_notional_usd, self.config.max_position_size_usd
                ),
            );
        }

        // Gate 7: spread guard.
        if let Some(spread) = ctx.spread_bps {
            if spread > self.config.max_spread_bps {
                return veto(
                    "spread_guard",
                    format!(
                        "spread {:.1}bps exceeds limit {:.1}bps",
                        spread, self.config.max_spread_bps
                    ),
                );
            }
        }

        // Gate 8: per-symbol+action cooldown (the one and only place this
        // dedup lives).
        {
            let key = (ctx.symbol.to_string(), ctx.side.to_uppercase());
            let mut last = self.last_signal_at.write();
            if let Some(at) = last.get(&key) {
                let cooldown = Duration::from_secs((self.config.cooldown_minutes * 60) as u64);
                if at.elapsed() < cooldown {
                    return veto(
                        "cooldown_by_symbol",
                        format!(
                            "{} {} signalled {}s ago (cooldown {}m)",
                            ctx.symbol,
                            ctx.side,
                            at.elapsed().as_secs(),
                            self.config.cooldown_minutes
                        ),
                    );
                }
            }
            last.insert(key, Instant::now());
        }

        // Gate 9: inventory guard for sells.
        if ctx.side.eq_ignore_ascii_case("sell") {
            if let Some(qty) = ctx.sell_quantity {
                if !self.inventory.can_sell(ctx.asset, qty) {
                    return veto(
                        "inventory_guard",
                        format!("insufficient {} inventory to sell {:.8}", ctx.asset, qty),
                    );
                }
            }
        }

        // Gate 10: expected edge floor.
        if ctx.expected_edge_bps < self.config.min_expected_edge_bps {
            return veto(
                "expected_edge_floor",
                format!(
                    "expected edge {:.2}bps below floor {:.2}bps",
                    ctx.expected_edge_bps, self.config.min_expected_edge_bps
                ),
            );
        }

        // Gate 11: chop filter (low-ADX ranging markets have no edge).
        if let Some(adx) = ctx.adx {
            if adx < self.config.chop_adx_threshold {
                return veto(
                    "chop_filter",
                    format!(
                        "ADX {:.1} below chop threshold {:.1}",
                        adx, self.config.chop_adx_threshold
                    ),
                );
            }
        }

        // Gate 12: minimum notional.
        if ctx.position_notional_usd < self.config.min_notional_usd {
            return veto(
                "min_notional",
                format!(
                    "notional {:.2} below minimum {:.2}",
                    ctx.position_notional_usd, self.config.min_notional_usd
                ),
            );
        }

        debug!(symbol = ctx.symbol, side = ctx.side, "all gatekeeper gates passed");
        GateDecision::Allow
    }
}

fn veto(gate: &'static str, reason: impl Into<String>) -> GateDecision {
    GateDecision::Veto {
        gate,
        reason: reason.into(),
    }
}

impl From<GateDecision> for Result<(), CoreError> {
    fn from(decision: GateDecision) -> Self {
        match decision {
            GateDecision::Allow => Ok(()),
            GateDecision::Veto { gate, reason } => Err(CoreError::blocked(gate, reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn base_ctx<'a>(symbol: &'a str, side: &'a str) -> GateContext<'a> {
        GateContext {
            symbol,
            side,
            confidence: 0.8,
            trading_mode: TradingMode::Live,
            account_mode: AccountMode::Live,
            allow_live_trading: true,
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

    fn gatekeeper() -> Gatekeeper {
        Gatekeeper::new(
            GatekeeperConfig::default(),
            Arc::new(KillSwitch::new(Default::default())),
            Arc::new(RiskEngine::new(1000.0, 0.03, 5, 0.05, 50)),
            Arc::new(InventoryManager::new()),
        )
    }

    #[test]
    fn allows_a_clean_signal() {
        let gk = gatekeeper();
        let ctx = base_ctx("BTCUSDT", "BUY");
        assert!(matches!(gk.evaluate(&ctx), GateDecision::Allow));
    }

    #[test]
    fn kill_switch_vetoes_first() {
        let gk = gatekeeper();
        gk.kill_switch.check_drawdown(100.0);
        let ctx = base_ctx("BTCUSDT", "BUY");
        match gk.evaluate(&ctx) {
            GateDecision::Veto { gate, .. } => assert_eq!(gate, "kill_switch"),
            _ => panic!("expected veto"),
        }
    }

    #[test]
    fn live_account_blocked_when_allow_live_trading_is_false() {
        let gk = gatekeeper();
        let mut ctx = base_ctx("BTCUSDT", "BUY");
        ctx.allow_live_trading = false;
        match gk.evaluate(&ctx) {
            GateDecision::Veto { gate, .. } => assert_eq!(gate, "mode_gate"),
            _ => panic!("expected veto"),
        }
    }

    #[test]
    fn demo_account_passes_regardless_of_allow_live_trading() {
        let gk = gatekeeper();
        let mut ctx = base_ctx("BTCUSDT", "BUY");
        ctx.account_mode = AccountMode::Demo;
        ctx.allow_live_trading = false;
        assert!(matches!(gk.evaluate(&ctx), GateDecision::Allow));
    }

    #[test]
    fn cooldown_blocks_repeat_signal_within_window() {
        let gk = gatekeeper();
        let ctx = base_ctx("BTCUSDT", "BUY");
        assert!(matches!(gk.evaluate(&ctx), GateDecision::Allow));
        match gk.evaluate(&ctx) {
            GateDecision::Veto { gate, .. } => assert_eq!(gate, "cooldown_by_symbol"),
            _ => panic!("expected cooldown veto on second identical signal"),
        }
    }

    #[test]
    fn low_adx_is_vetoed_by_chop_filter() {
        let gk = gatekeeper();
        let mut ctx = base_ctx("BTCUSDT", "BUY");
        ctx.adx = Some(5.0);
        match gk.evaluate(&ctx) {
            GateDecision::Veto { gate, .. } => assert_eq!(gate, "chop_filter"),
            _ => panic!("expected veto"),
        }
    }

    #[test]
    fn insufficient_inventory_vetoes_sell() {
        let gk = gatekeeper();
        let mut ctx = base_ctx("BTCUSDT", "SELL");
        ctx.sell_quantity = Some(1.0);
        match gk.evaluate(&ctx) {
            GateDecision::Veto { gate, .. } => assert_eq!(gate, "inventory_guard"),
            _ => panic!("expected veto"),
        }
    }
}

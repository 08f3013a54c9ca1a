// =============================================================================
// Trailing Stop Manager — activating, ratcheting, percent-based
// =============================================================================
//
// Distinct from exit/micro_trail.rs's ATR/order-flow-adaptive trail, which is
// a feature-flagged extra for the bundled strategy: this is the baseline
// trailing stop every managed position gets once it activates, expressed as
// a simple percent-below-peak distance that only ever ratchets in the
// position's favor.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TrailingStopConfig {
    /// Profit percent (relative to entry) at which the trail activates.
    pub activation_pct: f64,
    /// Trail distance as a percent below (long) or above (short) the peak,
    /// used when `update` is called without an ATR reading.
    pub trail_pct: f64,
    /// Distance in ATR units below (long) or above (short) the peak, used
    /// when `update` is called with `atr: Some(_)` instead of `trail_pct`.
    pub atr_multiplier: f64,
}

impl Default for TrailingStopConfig {
    fn default() -> Self {
        Self {
            activation_pct: 1.0,
            trail_pct: 0.5,
            atr_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailState {
    pub symbol: String,
    pub is_long: bool,
    pub entry_price: f64,
    pub peak_price: f64,
    pub stop_price: Option<f64>,
    pub activated: bool,
}

/// Per-symbol trailing stop tracker. One instance serves every managed
/// position; state is keyed by symbol and reset when a position closes.
pub struct TrailingStopManager {
    config: TrailingStopConfig,
    states: RwLock<HashMap<String, TrailState>>,
}

impl TrailingStopManager {
    pub fn new(config: TrailingStopConfig) -> Self {
        Self {
            config,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Begin tracking a freshly filled position.
    pub fn open(&self, symbol: &str, is_long: bool, entry_price: f64) {
        self.states.write().insert(
            symbol.to_string(),
            TrailState {
                symbol: symbol.to_string(),
                is_long,
                entry_price,
                peak_price: entry_price,
                stop_price: None,
                activated: false,
            },
        );
    }

    /// Feed a new price for `symbol`, optionally with the current ATR
    /// reading. Returns `Some(stop_price)` if the position should be exited
    /// at the current price (price has crossed the trail), `None` otherwise.
    /// A no-op if the symbol is not being tracked.
    ///
    /// When `atr` is `Some`, the trail distance is `atr * atr_multiplier`
    /// instead of the percent-of-peak distance; either way the stop only
    /// ever ratchets in the position's favor.
    pub fn update(&self, symbol: &str, price: f64, atr: Option<f64>) -> Option<f64> {
        let mut states = self.states.write();
        let state = states.get_mut(symbol)?;

        if state.is_long {
            if price > state.peak_price {
                state.peak_price = price;
            }
            let profit_pct = (state.peak_price - state.entry_price) / state.entry_price * 100.0;
            if !state.activated && profit_pct >= self.config.activation_pct {
                state.activated = true;
                debug!(symbol, profit_pct, "trailing stop activated");
            }
            if state.activated {
                let candidate = match atr {
                    Some(atr) => state.peak_price - atr * self.config.atr_multiplier,
                    None => state.peak_price * (1.0 - self.config.trail_pct / 100.0),
                };
                state.stop_price = Some(state.stop_price.map_or(candidate, |prev| prev.max(candidate)));
                if price <= state.stop_price.unwrap() {
                    return Some(state.stop_price.unwrap());
                }
            }
        } else {
            if price < state.peak_price || state.peak_price == state.entry_price {
                state.peak_price = price.min(state.peak_price);
            }
            let profit_pct = (state.entry_price - state.peak_price) / state.entry_price * 100.0;
            if !state.activated && profit_pct >= self.config.activation_pct {
                state.activated = true;
                debug!(symbol, profit_pct, "trailing stop activated");
            }
            if state.activated {
                let candidate = match atr {
                    Some(atr) => state.peak_price + atr * self.config.atr_multiplier,
                    None => state.peak_price * (1.0 + self.config.trail_pct / 100.0),
                };
                state.stop_price = Some(state.stop_price.map_or(candidate, |prev| prev.min(candidate)));
                if price >= state.stop_price.unwrap() {
                    return Some(state.stop_price.unwrap());
                }
            }
        }

        None
    }

    pub fn close(&self, symbol: &str) {
        self.states.write().remove(symbol);
    }

    pub fn snapshot(&self, symbol: &str) -> Option<TrailState> {
        self.states.read().get(symbol).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mgr() -> TrailingStopManager {
        TrailingStopManager::new(TrailingStopConfig {
            activation_pct: 1.0,
            trail_pct: 0.5,
            atr_multiplier: 2.0,
        })
    }

    #[test]
    fn long_trail_does_not_activate_below_threshold() {
        let m = mgr();
        m.open("BTCUSDT", true, 100.0);
        assert!(m.update("BTCUSDT", 100.5, None).is_none());
        assert!(!m.snapshot("BTCUSDT").unwrap().activated);
    }

    #[test]
    fn long_trail_activates_and_ratchets_with_peak() {
        let m = mgr();
        m.open("BTCUSDT", true, 100.0);
        m.update("BTCUSDT", 102.0, None);
        assert!(m.snapshot("BTCUSDT").unwrap().activated);
        let first_stop = m.snapshot("BTCUSDT").unwrap().stop_price.unwrap();
        m.update("BTCUSDT", 110.0, None);
        let second_stop = m.snapshot("BTCUSDT").unwrap().stop_price.unwrap();
        assert!(second_stop > first_stop);
    }

    #[test]
    fn long_trail_triggers_exit_when_price_falls_through_stop() {
        let m = mgr();
        m.open("BTCUSDT", true, 100.0);
        m.update("BTCUSDT", 110.0, None);
        let stop = m.snapshot("BTCUSDT").unwrap().stop_price.unwrap();
        let triggered = m.update("BTCUSDT", stop - 0.01, None);
        assert!(triggered.is_some());
    }

    #[test]
    fn short_trail_activates_and_ratchets_downward() {
        let m = mgr();
        m.open("ETHUSDT", false, 100.0);
        m.update("ETHUSDT", 98.0, None);
        assert!(m.snapshot("ETHUSDT").unwrap().activated);
        let first_stop = m.snapshot("ETHUSDT").unwrap().stop_price.unwrap();
        m.update("ETHUSDT", 90.0, None);
        let second_stop = m.snapshot("ETHUSDT").unwrap().stop_price.unwrap();
        assert!(second_stop < first_stop);
    }

    #[test]
    fn stop_never_loosens_on_a_pullback_that_does_not_trigger() {
        let m = mgr();
        m.open("BTCUSDT", true, 100.0);
        m.update("BTCUSDT", 110.0, None);
        let stop = m.snapshot("BTCUSDT").unwrap().stop_price.unwrap();
        m.update("BTCUSDT", 105.0, None);
        assert_eq!(m.snapshot("BTCUSDT").unwrap().stop_price.unwrap(), stop);
    }

    #[test]
    fn close_removes_tracked_state() {
        let m = mgr();
        m.open("BTCUSDT", true, 100.0);
        m.close("BTCUSDT");
        assert!(m.snapshot("BTCUSDT").is_none());
    }

    #[test]
    fn long_trail_uses_atr_distance_when_provided() {
        let m = mgr();
        m.open("BTCUSDT", true, 100.0);
        m.update("BTCUSDT", 110.0, Some(2.0));
        // atr_multiplier is 2.0, atr is 2.0 -> stop trails 4.0 below peak.
        let stop = m.snapshot("BTCUSDT").unwrap().stop_price.unwrap();
        assert!((stop - 106.0).abs() < 1e-9);
    }

    #[test]
    fn short_trail_uses_atr_distance_when_provided() {
        let m = mgr();
        m.open("ETHUSDT", false, 100.0);
        m.update("ETHUSDT", 90.0, Some(3.0));
        let stop = m.snapshot("ETHUSDT").unwrap().stop_price.unwrap();
        assert!((stop - 96.0).abs() < 1e-9);
    }
}

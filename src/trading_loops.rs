// =============================================================================
// Trading Loops — scheduled job bodies
// =============================================================================
//
// Replaces the ad-hoc tokio::spawn + interval loops that used to live in
// main.rs: each function here is a single tick body, registered with
// scheduler.rs's Scheduler at the period carried in RuntimeConfig. None of
// these loop internally — overlap protection and period management are the
// scheduler's job, not this module's.
//
// Per-symbol+action signal cooldown lives exactly once, in gatekeeper.rs's
// cooldown_by_symbol gate. This module does not keep its own cooldown map.
// =============================================================================

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::exit::micro_trail::MicroTrailState;
use crate::exit::triple_barrier::{BarrierConfig, BarrierState};
use crate::gatekeeper::GateContext;
use crate::order_manager::{SignalRequest, SubmitOutcome};
use crate::order_state::Side;
use crate::signal_queue::QueuedSignal;
use crate::strategy::StrategyEngine;
use crate::types::BalanceInfo;

/// Strip a common quote-asset suffix to recover the base asset a sell order
/// draws inventory from. Falls back to the full symbol if nothing matches.
fn base_asset(symbol: &str) -> &str {
    const QUOTES: &[&str] = &["USDT", "BUSD", "USDC", "FDUSD", "BTC", "ETH", "BNB"];
    for quote in QUOTES {
        if let Some(stripped) = symbol.strip_suffix(quote) {
            if !stripped.is_empty() {
                return stripped;
            }
        }
    }
    symbol
}

/// Evaluate every configured symbol and route any resulting proposal through
/// the gatekeeper and order manager.
pub async fn run_strategy_tick(state: Arc<AppState>) {
    let (symbols, account_mode, trading_mode, allow_live_trading) = {
        let cfg = state.runtime_config.read();
        (cfg.symbols.clone(), cfg.account_mode, cfg.trading_mode, cfg.allow_live_trading)
    };

    for symbol in &symbols {
        let (envelope, proposal) = StrategyEngine::evaluate_symbol(&state, symbol);
        state.push_decision(envelope);

        let Some(prop) = proposal else { continue };

        let queued_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        state.signal_queue.push(QueuedSignal {
            symbol: prop.symbol.clone(),
            side: prop.side.clone(),
            confidence: prop.confidence,
            queued_at_ms,
        });
        // Dequeued immediately: the queue exists to absorb a burst of
        // proposals against a stalled consumer, not to buffer within a
        // single tick. A future batched-submission path can hold signals
        // here across ticks instead of draining inline.
        let Some(queued) = state.signal_queue.pop() else { continue };

        let asset = base_asset(&queued.symbol).to_string();
        let side = if queued.side.eq_ignore_ascii_case("buy") {
            Side::Buy
        } else {
            Side::Sell
        };
        let sell_quantity = matches!(side, Side::Sell).then_some(prop.quantity);

        let open_positions = state.position_manager.get_open_positions();
        let has_open_position_for_symbol =
            open_positions.iter().any(|p| p.symbol == queued.symbol);
        let position_notional_usd = prop.entry_price * prop.quantity;
        let spread_bps = state.orderbook_manager.spread_bps(&queued.symbol);
        let adx = state
            .regime_detector
            .read()
            .current_regime()
            .map(|rs| rs.adx);

        let gate_ctx = GateContext {
            symbol: &queued.symbol,
            side: &queued.side,
            confidence: queued.confidence,
            trading_mode,
            account_mode,
            allow_live_trading,
            open_position_count: open_positions.len() as u32,
            has_open_position_for_symbol,
            position_notional_usd,
            spread_bps,
            expected_edge_bps: prop.score,
            adx,
            asset: &asset,
            sell_quantity,
        };

        let request = SignalRequest {
            symbol: queued.symbol.clone(),
            asset: asset.clone(),
            side,
            quantity: prop.quantity,
            price: Some(prop.entry_price),
            client_order_id: uuid::Uuid::new_v4().to_string(),
        };

        let outcome = state
            .order_manager
            .submit_signal(
                request,
                account_mode,
                &*state.exchange_adapter,
                &gate_ctx,
            )
            .await;

        match outcome {
            SubmitOutcome::Placed(order) | SubmitOutcome::Simulated(order) => {
                state
                    .trailing_stop
                    .open(&order.symbol, matches!(side, Side::Buy), prop.entry_price);
                info!(symbol = %prop.symbol, side = %prop.side, "signal submitted");

                let position_id = state.position_manager.open_position(
                    &prop.symbol,
                    &prop.side,
                    prop.entry_price,
                    prop.quantity,
                    prop.stop_loss,
                    prop.take_profit_1,
                    prop.take_profit_2,
                );
                open_exit_state(&state, &position_id, &prop);
            }
            SubmitOutcome::Blocked { gate, reason } => {
                debug!(symbol = %prop.symbol, gate, reason, "signal vetoed by gatekeeper");
            }
            SubmitOutcome::Rejected(reason) => {
                warn!(symbol = %prop.symbol, reason = %reason, "order rejected");
            }
        }
    }

    state.increment_version();
}

/// Feed the trailing stop manager and position manager with the latest
/// prices from the trade stream, tick the triple-barrier/micro-trail exit
/// monitor's position price cache.
pub async fn run_market_data_tick(state: Arc<AppState>) {
    let open_positions = state.position_manager.get_open_positions();
    for pos in &open_positions {
        let price = {
            let procs = state.trade_processors.read();
            procs.get(&pos.symbol).map(|tp| tp.last_price())
        };
        let Some(price) = price else { continue };
        if price <= 0.0 {
            continue;
        }

        state.position_manager.update_price(&pos.symbol, price);

        let key = crate::market_data::CandleKey {
            symbol: pos.symbol.clone(),
            interval: "5m".to_string(),
        };
        let candles = state.candle_buffer.get_closed_candles(&key, 15);
        let atr = crate::indicators::atr::calculate_atr(&candles, 14);

        if let Some(stop) = state.trailing_stop.update(&pos.symbol, price, atr) {
            info!(symbol = %pos.symbol, stop, "trailing stop triggered");
        }
    }
}

/// Reconcile internal order/inventory state against the venue.
pub async fn run_reconcile_tick(state: Arc<AppState>) {
    let symbols = state.runtime_config.read().symbols.clone();

    match state
        .reconciler
        .reconcile_once(&*state.exchange_adapter, &symbols)
        .await
    {
        Ok(report) => {
            *state.last_reconcile_ok.write() = Some(std::time::Instant::now());
            *state.last_reconcile_error.write() = None;
            if report.orphan_exchange_orders > 0 || report.stale_internal_orders > 0 {
                warn!(
                    orphan = report.orphan_exchange_orders,
                    stale = report.stale_internal_orders,
                    "reconciliation found drift"
                );
            }
            let snapshots = state.inventory.snapshot_all();
            *state.balances.write() = snapshots
                .into_iter()
                .map(|(asset, inv)| BalanceInfo {
                    asset,
                    free: inv.available,
                    locked: inv.reserved,
                })
                .collect();
        }
        Err(e) => {
            *state.last_reconcile_error.write() = Some(format!("{e}"));
            warn!(error = %e, "reconciliation failed");
        }
    }

    state.increment_version();
}

/// Compare recently filled orders against the venue's authoritative fill
/// quantities. Runs far less often than run_reconcile_tick since it only
/// needs to catch drift in settled orders, not open-order placement.
pub async fn run_fill_reconcile_tick(state: Arc<AppState>) {
    match state.fill_reconciler.reconcile_once(&*state.exchange_adapter).await {
        Ok(report) => {
            if report.qty_mismatches > 0 || report.orphan_fills > 0 {
                warn!(
                    checked = report.orders_checked,
                    qty_mismatches = report.qty_mismatches,
                    fee_mismatches = report.fee_mismatches,
                    orphan_fills = report.orphan_fills,
                    "fill reconciliation found drift"
                );
            } else {
                debug!(checked = report.orders_checked, "fill reconciliation clean");
            }
        }
        Err(e) => warn!(error = %e, "fill reconciliation failed"),
    }
}

/// Flush in-memory order, kill-switch, and position-lifecycle state to the
/// sqlite store. Everything here is cheap upsert-by-primary-key, so running
/// it on a short period just bounds how much a crash between ticks can lose.
pub async fn run_persist_tick(state: Arc<AppState>) {
    for order in state.order_state.all() {
        if let Err(e) = state.store.upsert_order(&order) {
            warn!(order_id = %order.order_id, error = %e, "failed to persist order");
        }
    }

    if let Err(e) = state.store.save_kill_switch(&state.kill_switch.snapshot()) {
        warn!(error = %e, "failed to persist kill switch state");
    }

    for lifecycle in state.position_state_machine.snapshot() {
        if let Err(e) = state.store.save_position_lifecycle(
            &lifecycle.symbol,
            lifecycle.status,
            &lifecycle.updated_at,
        ) {
            warn!(symbol = %lifecycle.symbol, error = %e, "failed to persist position lifecycle");
        }
    }

    let symbols = state.runtime_config.read().symbols.clone();
    for symbol in &symbols {
        for interval in ["1m", "5m"] {
            let key = crate::market_data::CandleKey {
                symbol: symbol.clone(),
                interval: interval.to_string(),
            };
            if let Some(candle) = state.candle_buffer.get_closed_candles(&key, 1).first() {
                if let Err(e) = state.store.upsert_candle(symbol, interval, candle) {
                    warn!(symbol, interval, error = %e, "failed to persist candle");
                }
            }
        }
    }
}

/// Refresh the regime detector from the most liquid configured symbol's 5m
/// candles.
pub async fn run_regime_tick(state: Arc<AppState>) {
    let symbols = state.runtime_config.read().symbols.clone();
    let Some(symbol) = symbols.first() else {
        return;
    };

    let key = crate::market_data::CandleKey {
        symbol: symbol.clone(),
        interval: "5m".to_string(),
    };
    let candles = state.candle_buffer.get_closed_candles(&key, 100);
    if candles.len() >= 50 {
        state.regime_detector.write().update(&candles);
        state.increment_version();
    }
}

/// Seed a triple-barrier + micro-trail exit state for a position the order
/// manager just placed or simulated. This is the bundled strategy's own exit
/// tooling, run independently of the baseline trailing_stop.rs trail by
/// exit::monitor's background loop.
fn open_exit_state(state: &Arc<AppState>, position_id: &str, prop: &crate::strategy::TradeProposal) {
    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let atr_pct = if prop.entry_price > 0.0 {
        ((prop.stop_loss - prop.entry_price).abs() / prop.entry_price) * 100.0
    } else {
        0.5
    };

    let barrier_config = BarrierConfig::from_atr(atr_pct, &prop.regime);
    let barrier = BarrierState::new(barrier_config, prop.entry_price, &prop.side, now_secs);
    state
        .barrier_states
        .write()
        .insert(position_id.to_string(), barrier);

    let atr_price_units = (prop.stop_loss - prop.entry_price).abs();
    let mut micro = MicroTrailState::new(
        prop.side == "BUY",
        prop.entry_price,
        prop.take_profit_1,
        atr_price_units,
    );
    let cvd_at_entry = state
        .trade_processors
        .read()
        .get(&prop.symbol)
        .map(|tp| tp.cvd())
        .unwrap_or(0.0);
    micro.set_cvd_at_entry(cvd_at_entry);
    state
        .micro_trail_states
        .write()
        .insert(position_id.to_string(), micro);

    info!(position_id = %position_id, symbol = %prop.symbol, "barrier + micro-trail exit state created");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_known_quote_suffix() {
        assert_eq!(base_asset("BTCUSDT"), "BTC");
        assert_eq!(base_asset("ETHUSDT"), "ETH");
        assert_eq!(base_asset("BNBUSDT"), "BNB");
        assert_eq!(base_asset("XRPUSDT"), "XRP");
    }

    #[test]
    fn prefers_longer_quote_match() {
        // FDUSD must win over a bare USD-style partial match.
        assert_eq!(base_asset("BTCFDUSD"), "BTC");
    }

    #[test]
    fn crypto_quoted_pair_strips_to_base() {
        assert_eq!(base_asset("ETHBTC"), "ETH");
    }

    #[test]
    fn falls_back_to_full_symbol_when_unmatched() {
        assert_eq!(base_asset("DOGE"), "DOGE");
    }

    #[test]
    fn does_not_strip_to_an_empty_base() {
        // A symbol equal to a quote suffix itself should not strip to "".
        assert_eq!(base_asset("USDT"), "USDT");
    }
}

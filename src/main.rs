// =============================================================================
// Aurora Spot Nexus — Main Entry Point
// =============================================================================
//
// The engine starts in Demo + Paused mode for safety. Users must explicitly
// switch to Live mode via the dashboard or API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod absorption_detector;
mod api;
mod app_state;
mod arena;
mod binance;
mod cusum_detector;
mod decision_envelope;
mod error;
mod event_bus;
mod exchange_adapter;
mod exit;
mod fill_reconciler;
mod futures_intel;
mod gatekeeper;
mod htf_analysis;
mod indicators;
mod inventory;
mod journal;
mod kill_switch;
mod market_data;
mod order_manager;
mod order_state;
mod persistence;
mod position_engine;
mod position_state_machine;
mod reconciler;
mod regime;
mod retry;
mod risk;
mod runtime_config;
mod scheduler;
mod secrets;
mod signal_queue;
mod signals;
mod smart_filters;
mod strategy;
mod trade_insurance;
mod trading_loops;
mod trailing_stop;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::exchange_adapter::{BinanceAdapter, CcxtStyleAdapter, CoinbaseAdapter, ExchangeAdapter, UnavailableAdapter};
use crate::runtime_config::RuntimeConfig;
use crate::secrets::{EnvSecretsProvider, SecretsProvider};
use crate::types::AccountMode;

/// Build the venue adapter named by `config.exchange.venue`, resolving any
/// credentials it needs through `secrets`. Falls back to `UnavailableAdapter`
/// if the venue is unknown or required credentials are missing, rather than
/// failing startup — Demo mode trading never needs a live adapter at all.
fn build_exchange_adapter(
    config: &RuntimeConfig,
    secrets: &dyn SecretsProvider,
) -> Arc<dyn ExchangeAdapter> {
    let exchange = &config.exchange;

    match exchange.venue.as_str() {
        "binance" => {
            let key_env = exchange.api_key_env.as_deref().unwrap_or("BINANCE_API_KEY");
            let secret_env = exchange
                .api_secret_env
                .as_deref()
                .unwrap_or("BINANCE_API_SECRET");
            let api_key = secrets.get(key_env).unwrap_or_default();
            let api_secret = secrets.get(secret_env).unwrap_or_default();
            let client = binance::client::BinanceClient::new(api_key, api_secret);
            Arc::new(BinanceAdapter::new(client))
        }
        "coinbase" => {
            let key_env = exchange.api_key_env.as_deref().unwrap_or("COINBASE_API_KEY");
            let secret_env = exchange
                .api_secret_env
                .as_deref()
                .unwrap_or("COINBASE_API_SECRET");
            let passphrase_env = exchange
                .passphrase_env
                .as_deref()
                .unwrap_or("COINBASE_PASSPHRASE");
            match (
                secrets.get(key_env),
                secrets.get(secret_env),
                secrets.get(passphrase_env),
            ) {
                (Some(key), Some(secret), Some(passphrase)) => {
                    Arc::new(CoinbaseAdapter::new(key, secret, passphrase))
                }
                _ => {
                    warn!("coinbase venue configured but credentials are missing — falling back to unavailable adapter");
                    Arc::new(UnavailableAdapter::new("coinbase credentials not configured"))
                }
            }
        }
        "ccxt_bridge" => match &exchange.bridge_base_url {
            Some(base_url) => Arc::new(CcxtStyleAdapter::new(base_url.clone(), "ccxt".to_string())),
            None => {
                warn!("ccxt_bridge venue configured but bridge_base_url is missing");
                Arc::new(UnavailableAdapter::new("ccxt bridge url not configured"))
            }
        },
        other => {
            warn!(venue = other, "unknown exchange venue — falling back to unavailable adapter");
            Arc::new(UnavailableAdapter::new(format!("unknown venue: {other}")))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Aurora Spot Nexus — Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: Force Demo + Paused on startup.
    config.trading_mode = types::TradingMode::Paused;
    config.account_mode = AccountMode::Demo;

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("AURORA_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if config.symbols.is_empty() {
        config.symbols = vec![
            "BTCUSDT".into(),
            "ETHUSDT".into(),
            "BNBUSDT".into(),
            "XRPUSDT".into(),
            "SOLUSDT".into(),
        ];
    }

    info!(symbols = ?config.symbols, "Configured trading pairs");
    info!(
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        "Engine starting in SAFE mode (Demo + Paused)"
    );

    // ── 2. Build the venue adapter and shared state ──────────────────────
    let secrets_provider = EnvSecretsProvider;
    let exchange_adapter = build_exchange_adapter(&config, &secrets_provider);
    info!(venue = exchange_adapter.name(), "Exchange adapter constructed");

    let state = Arc::new(AppState::new(config, exchange_adapter));

    // ── 3. Spawn market data streams ─────────────────────────────────────
    let symbols = state.runtime_config.read().symbols.clone();

    for symbol in &symbols {
        // Kline 1m stream
        let cb = state.candle_buffer.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    market_data::candle_buffer::run_kline_stream(&sym, "1m", &cb).await
                {
                    error!(symbol = %sym, error = %e, "Kline 1m stream error — reconnecting in 5s");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        // Kline 5m stream
        let cb = state.candle_buffer.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    market_data::candle_buffer::run_kline_stream(&sym, "5m", &cb).await
                {
                    error!(symbol = %sym, error = %e, "Kline 5m stream error — reconnecting in 5s");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        // Trade stream
        {
            let procs = state.trade_processors.read();
            if let Some(tp) = procs.get(symbol) {
                let processor = tp.clone();
                let sym = symbol.clone();
                tokio::spawn(async move {
                    loop {
                        if let Err(e) =
                            market_data::trade_stream::run_trade_stream(&sym, &processor).await
                        {
                            error!(symbol = %sym, error = %e, "Trade stream error — reconnecting in 5s");
                        }
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                });
            }
        }

        // Orderbook stream
        let ob = state.orderbook_manager.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = market_data::orderbook::run_depth_stream(&sym, &ob).await {
                    error!(symbol = %sym, error = %e, "Depth stream error — reconnecting in 5s");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }

    info!(count = symbols.len(), "Market data streams launched");

    // ── 4. Start the API server ──────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr =
        std::env::var("AURORA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let bind_addr_clone = bind_addr.clone();

    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr_clone)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr_clone, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    // ── 5. Exit monitor loop (bundled strategy's triple barrier + micro-trail) ─
    {
        let exit_state = state.clone();
        let barriers = state.barrier_states.clone();
        let trails = state.micro_trail_states.clone();
        tokio::spawn(async move {
            exit::monitor::run_exit_monitor(exit_state, barriers, trails).await;
        });
    }

    // ── 6. Register scheduled jobs ────────────────────────────────────────
    let (strategy_interval_ms, poll_interval_ms, data_polling_ms) = {
        let cfg = state.runtime_config.read();
        (cfg.strategy_interval_ms, cfg.poll_interval_ms, cfg.data_polling_ms)
    };

    {
        let s = state.clone();
        state.scheduler.register(
            "strategy",
            Duration::from_millis(strategy_interval_ms),
            move || {
                let s = s.clone();
                async move { trading_loops::run_strategy_tick(s).await }
            },
        );
    }
    {
        let s = state.clone();
        state.scheduler.register(
            "market_data",
            Duration::from_millis(data_polling_ms),
            move || {
                let s = s.clone();
                async move { trading_loops::run_market_data_tick(s).await }
            },
        );
    }
    {
        let s = state.clone();
        state.scheduler.register(
            "reconcile",
            Duration::from_millis(poll_interval_ms.max(5_000)),
            move || {
                let s = s.clone();
                async move { trading_loops::run_reconcile_tick(s).await }
            },
        );
    }
    {
        let s = state.clone();
        state.scheduler.register("fill-reconcile", Duration::from_secs(300), move || {
            let s = s.clone();
            async move { trading_loops::run_fill_reconcile_tick(s).await }
        });
    }
    {
        let s = state.clone();
        state.scheduler.register("regime", Duration::from_secs(30), move || {
            let s = s.clone();
            async move { trading_loops::run_regime_tick(s).await }
        });
    }
    {
        let s = state.clone();
        state.scheduler.register("persist", Duration::from_secs(10), move || {
            let s = s.clone();
            async move { trading_loops::run_persist_tick(s).await }
        });
    }

    info!("Waiting 30s for initial market data before starting scheduled jobs");
    tokio::time::sleep(Duration::from_secs(30)).await;
    state.scheduler.start();

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ──────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    state.scheduler.shutdown(Duration::from_secs(10)).await;
    trading_loops::run_persist_tick(state.clone()).await;

    if let Err(e) = state.runtime_config.read().save("runtime_config.json") {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Aurora Spot Nexus shut down complete.");
    Ok(())
}

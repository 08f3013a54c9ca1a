// =============================================================================
// Persistence — sqlite-backed durable state
// =============================================================================
//
// Orders, candle backfill, the kill switch row, and position lifecycle state
// all need to survive a restart. runtime_config.rs persists to a JSON file
// with an atomic tmp+rename; the tables here need indexed lookup and
// incremental writes instead, so they go through rusqlite. Every write here
// that matters for correctness (order upserts, the kill switch row) runs
// inside a transaction.
// =============================================================================

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tracing::info;

use crate::kill_switch::KillSwitchState;
use crate::market_data::candle_buffer::Candle;
use crate::order_state::{Order, OrderStatus, Side};
use crate::position_state_machine::LifecycleStatus;

/// Thin wrapper around a single sqlite connection. rusqlite's `Connection`
/// is `!Sync`; callers share one `Store` behind an `Arc` and every access
/// takes the internal mutex.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open sqlite database")?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite database")?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                order_id TEXT PRIMARY KEY,
                client_order_id TEXT NOT NULL UNIQUE,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity REAL NOT NULL,
                filled_quantity REAL NOT NULL,
                price REAL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS candles (
                symbol TEXT NOT NULL,
                interval TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                close_time INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                PRIMARY KEY (symbol, interval, open_time)
            );

            CREATE TABLE IF NOT EXISTS kill_switch (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                triggered INTEGER NOT NULL,
                reason TEXT,
                triggered_at TEXT,
                consecutive_losses INTEGER NOT NULL,
                spread_violations_json TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS position_lifecycle (
                symbol TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .context("failed to run sqlite migrations")?;
        info!("sqlite schema migrated");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Orders
    // ---------------------------------------------------------------------

    pub fn upsert_order(&self, order: &Order) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO orders
                (order_id, client_order_id, symbol, side, quantity, filled_quantity, price, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(order_id) DO UPDATE SET
                filled_quantity = excluded.filled_quantity,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
            params![
                order.order_id,
                order.client_order_id,
                order.symbol,
                side_to_str(order.side),
                order.quantity,
                order.filled_quantity,
                order.price,
                status_to_str(order.status),
                order.created_at,
                order.updated_at,
            ],
        )
        .context("failed to upsert order")?;
        Ok(())
    }

    pub fn load_orders(&self) -> Result<Vec<Order>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT order_id, client_order_id, symbol, side, quantity, filled_quantity, price, status, created_at, updated_at FROM orders",
        )?;
        let rows = stmt.query_map([], |row| {
            let side: String = row.get(3)?;
            let status: String = row.get(7)?;
            Ok(Order {
                order_id: row.get(0)?,
                client_order_id: row.get(1)?,
                symbol: row.get(2)?,
                side: str_to_side(&side),
                quantity: row.get(4)?,
                filled_quantity: row.get(5)?,
                price: row.get(6)?,
                status: str_to_status(&status),
                created_at: row.get(8)?,
                updated_at: row.get(9)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to load orders")
    }

    // ---------------------------------------------------------------------
    // Candles
    // ---------------------------------------------------------------------

    pub fn upsert_candle(&self, symbol: &str, interval: &str, candle: &Candle) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO candles (symbol, interval, open_time, close_time, open, high, low, close, volume)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(symbol, interval, open_time) DO UPDATE SET
                close_time = excluded.close_time,
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume
            "#,
            params![
                symbol,
                interval,
                candle.open_time,
                candle.close_time,
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.volume,
            ],
        )
        .context("failed to upsert candle")?;
        Ok(())
    }

    pub fn count_candles(&self, symbol: &str, interval: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM candles WHERE symbol = ?1 AND interval = ?2",
            params![symbol, interval],
            |row| row.get(0),
        )
        .context("failed to count candles")
    }

    // ---------------------------------------------------------------------
    // Kill switch
    // ---------------------------------------------------------------------

    pub fn save_kill_switch(&self, state: &KillSwitchState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let spread_violations_json = serde_json::to_string(&state.spread_violations)
            .context("failed to serialize spread violations")?;
        conn.execute(
            r#"
            INSERT INTO kill_switch (id, triggered, reason, triggered_at, consecutive_losses, spread_violations_json)
            VALUES (0, ?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                triggered = excluded.triggered,
                reason = excluded.reason,
                triggered_at = excluded.triggered_at,
                consecutive_losses = excluded.consecutive_losses,
                spread_violations_json = excluded.spread_violations_json
            "#,
            params![
                state.triggered,
                state.reason,
                state.triggered_at,
                state.consecutive_losses,
                spread_violations_json,
            ],
        )
        .context("failed to save kill switch state")?;
        Ok(())
    }

    pub fn load_kill_switch(&self) -> Result<Option<KillSwitchState>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT triggered, reason, triggered_at, consecutive_losses, spread_violations_json FROM kill_switch WHERE id = 0",
            [],
            |row| {
                let spread_violations_json: String = row.get(4)?;
                Ok((
                    KillSwitchState {
                        triggered: row.get(0)?,
                        reason: row.get(1)?,
                        triggered_at: row.get(2)?,
                        consecutive_losses: row.get(3)?,
                        spread_violations: Vec::new(),
                    },
                    spread_violations_json,
                ))
            },
        )
        .optional()
        .context("failed to load kill switch state")
        .map(|opt| {
            opt.map(|(mut state, json)| {
                state.spread_violations = serde_json::from_str(&json).unwrap_or_default();
                state
            })
        })
    }

    // ---------------------------------------------------------------------
    // Position lifecycle
    // ---------------------------------------------------------------------

    pub fn save_position_lifecycle(&self, symbol: &str, status: LifecycleStatus, updated_at: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO position_lifecycle (symbol, status, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(symbol) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at
            "#,
            params![symbol, status.to_string(), updated_at],
        )
        .context("failed to save position lifecycle")?;
        Ok(())
    }

    pub fn load_position_lifecycles(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT symbol, status FROM position_lifecycle")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to load position lifecycle rows")
    }
}

use rusqlite::OptionalExtension;

fn side_to_str(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

fn str_to_side(s: &str) -> Side {
    if s == "SELL" {
        Side::Sell
    } else {
        Side::Buy
    }
}

fn status_to_str(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::New => "NEW",
        OrderStatus::Submitted => "SUBMITTED",
        OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
        OrderStatus::Filled => "FILLED",
        OrderStatus::Cancelled => "CANCELLED",
        OrderStatus::Rejected => "REJECTED",
    }
}

fn str_to_status(s: &str) -> OrderStatus {
    match s {
        "SUBMITTED" => OrderStatus::Submitted,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELLED" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        _ => OrderStatus::New,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order_state::OrderState;

    #[test]
    fn order_round_trips_through_sqlite() {
        let store = Store::open_in_memory().unwrap();
        let state = OrderState::new();
        let order = match state.reserve("coid-1", "BTCUSDT", Side::Buy, 1.0, Some(50_000.0)) {
            crate::order_state::ReserveOutcome::Created(o) => o,
            crate::order_state::ReserveOutcome::Existing(o) => o,
        };
        store.upsert_order(&order).unwrap();

        let loaded = store.load_orders().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].client_order_id, "coid-1");
        assert_eq!(loaded[0].symbol, "BTCUSDT");
    }

    #[test]
    fn candle_upsert_is_idempotent_on_open_time() {
        let store = Store::open_in_memory().unwrap();
        let candle = Candle {
            open_time: 0,
            close_time: 59_999,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 10.0,
            quote_volume: 1000.0,
            trades_count: 5,
            taker_buy_volume: 5.0,
            taker_buy_quote_volume: 500.0,
            is_closed: true,
        };
        store.upsert_candle("BTCUSDT", "1m", &candle).unwrap();
        store.upsert_candle("BTCUSDT", "1m", &candle).unwrap();
        assert_eq!(store.count_candles("BTCUSDT", "1m").unwrap(), 1);
    }

    #[test]
    fn kill_switch_state_round_trips() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.load_kill_switch().unwrap().is_none());

        let state = KillSwitchState {
            triggered: true,
            reason: Some("manual".into()),
            triggered_at: Some("2026-01-01T00:00:00Z".into()),
            consecutive_losses: 3,
            spread_violations: vec!["2026-01-01T00:00:00Z".into(), "2026-01-01T00:05:00Z".into()],
        };
        store.save_kill_switch(&state).unwrap();

        let loaded = store.load_kill_switch().unwrap().unwrap();
        assert!(loaded.triggered);
        assert_eq!(loaded.consecutive_losses, 3);
        assert_eq!(loaded.spread_violations, state.spread_violations);
    }

    #[test]
    fn position_lifecycle_round_trips() {
        let store = Store::open_in_memory().unwrap();
        store
            .save_position_lifecycle("BTCUSDT", LifecycleStatus::Managing, "2026-01-01T00:00:00Z")
            .unwrap();
        let rows = store.load_position_lifecycles().unwrap();
        assert_eq!(rows, vec![("BTCUSDT".to_string(), "managing".to_string())]);
    }
}

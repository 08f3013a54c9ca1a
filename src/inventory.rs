// =============================================================================
// Inventory Manager — available / reserved balances with weighted entry price
// =============================================================================
//
// Tracks, per asset, how much is free to sell versus reserved against an
// in-flight order. Buys blend into a weighted-average entry price exactly
// the way a fill confirmation would settle a position's cost basis.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::types::BalanceInfo;

/// Minimum residual balance treated as dust and excluded from `can_sell`
/// checks, to avoid blocking a full-position sell on a sub-lot-size remainder.
const DUST_BUFFER: f64 = 1e-8;

#[derive(Debug, Clone, Default, Serialize)]
pub struct AssetInventory {
    pub available: f64,
    pub reserved: f64,
    pub avg_entry_price: f64,
}

impl AssetInventory {
    fn total(&self) -> f64 {
        self.available + self.reserved
    }
}

pub struct InventoryManager {
    assets: RwLock<HashMap<String, AssetInventory>>,
    cash_usd: RwLock<f64>,
}

impl InventoryManager {
    pub fn new() -> Self {
        Self {
            assets: RwLock::new(HashMap::new()),
            cash_usd: RwLock::new(0.0),
        }
    }

    /// Set the starting cash balance. Called once at startup with the
    /// configured starting capital; never called mid-run.
    pub fn seed_cash(&self, amount: f64) {
        *self.cash_usd.write() = amount;
    }

    pub fn cash_usd(&self) -> f64 {
        *self.cash_usd.read()
    }

    /// Replace the available balances wholesale from an exchange snapshot.
    /// Reserved amounts (in-flight orders) are left untouched.
    pub fn hydrate_from_exchange(&self, balances: &[BalanceInfo]) {
        let mut assets = self.assets.write();
        for b in balances {
            let entry = assets.entry(b.asset.clone()).or_default();
            entry.available = b.free;
            entry.reserved = b.locked;
        }
    }

    /// Whether `quantity` of `asset` can be sold right now, given dust.
    pub fn can_sell(&self, asset: &str, quantity: f64) -> bool {
        let assets = self.assets.read();
        match assets.get(asset) {
            Some(inv) => inv.available + DUST_BUFFER >= quantity,
            None => false,
        }
    }

    /// Clamp a requested sell quantity down to what is actually available.
    pub fn clamp_sell_qty(&self, asset: &str, requested: f64) -> f64 {
        let assets = self.assets.read();
        match assets.get(asset) {
            Some(inv) => requested.min(inv.available.max(0.0)),
            None => 0.0,
        }
    }

    /// Move `quantity` of `asset` from available into reserved, ahead of an
    /// in-flight sell order. Fails if insufficient available balance.
    pub fn reserve(&self, asset: &str, quantity: f64) -> Result<(), CoreError> {
        let mut assets = self.assets.write();
        let inv = assets.entry(asset.to_string()).or_default();
        if inv.available + DUST_BUFFER < quantity {
            return Err(CoreError::blocked(
                "inventory_guard",
                format!(
                    "insufficient {asset} balance: available {:.8} < requested {:.8}",
                    inv.available, quantity
                ),
            ));
        }
        inv.available -= quantity;
        inv.reserved += quantity;
        debug!(asset, quantity, "inventory reserved");
        Ok(())
    }

    /// Release a previously reserved quantity back to available (order
    /// cancelled or rejected before any fill).
    pub fn release_reservation(&self, asset: &str, quantity: f64) {
        let mut assets = self.assets.write();
        let inv = assets.entry(asset.to_string()).or_default();
        let released = quantity.min(inv.reserved);
        inv.reserved -= released;
        inv.available += released;
        debug!(asset, quantity = released, "inventory reservation released");
    }

    /// Confirm a fill. For buys, blends into the weighted-average entry
    /// price, adds the filled quantity to available, and debits
    /// `qty * price + fees` from cash. For sells, removes the filled
    /// quantity from reserved (it was already deducted from available at
    /// reservation time) and credits `qty * price - fees` to cash.
    pub fn confirm_fill(&self, asset: &str, is_buy: bool, filled_qty: f64, fill_price: f64, fees: f64) {
        let mut assets = self.assets.write();
        let inv = assets.entry(asset.to_string()).or_default();
        let notional = filled_qty * fill_price;

        if is_buy {
            let old_qty = inv.total();
            let new_qty = old_qty + filled_qty;
            inv.avg_entry_price = if new_qty > 0.0 {
                (old_qty * inv.avg_entry_price + filled_qty * fill_price) / new_qty
            } else {
                fill_price
            };
            inv.available += filled_qty;
            *self.cash_usd.write() -= notional + fees;
        } else {
            let consumed = filled_qty.min(inv.reserved);
            inv.reserved -= consumed;
            *self.cash_usd.write() += notional - fees;
        }

        debug!(
            asset,
            is_buy,
            filled_qty,
            fill_price,
            fees,
            avg_entry_price = inv.avg_entry_price,
            "fill confirmed against inventory"
        );
    }

    /// Reconcile this asset's state against a fresh exchange snapshot,
    /// overwriting available/reserved and logging any discrepancy found.
    pub fn resync(&self, asset: &str, exchange_free: f64, exchange_locked: f64) {
        let mut assets = self.assets.write();
        let inv = assets.entry(asset.to_string()).or_default();
        let drift = (inv.available - exchange_free).abs() + (inv.reserved - exchange_locked).abs();
        if drift > 1e-6 {
            warn!(
                asset,
                internal_available = inv.available,
                internal_reserved = inv.reserved,
                exchange_free,
                exchange_locked,
                "inventory resync found drift"
            );
        }
        inv.available = exchange_free;
        inv.reserved = exchange_locked;
    }

    pub fn snapshot(&self, asset: &str) -> Option<AssetInventory> {
        self.assets.read().get(asset).cloned()
    }

    pub fn snapshot_all(&self) -> HashMap<String, AssetInventory> {
        self.assets.read().clone()
    }
}

impl Default for InventoryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_then_release_round_trips() {
        let inv = InventoryManager::new();
        inv.hydrate_from_exchange(&[BalanceInfo {
            asset: "BTC".into(),
            free: 1.0,
            locked: 0.0,
        }]);
        inv.reserve("BTC", 0.4).unwrap();
        assert!((inv.snapshot("BTC").unwrap().available - 0.6).abs() < 1e-9);
        inv.release_reservation("BTC", 0.4);
        assert!((inv.snapshot("BTC").unwrap().available - 1.0).abs() < 1e-9);
    }

    #[test]
    fn reserve_fails_when_insufficient() {
        let inv = InventoryManager::new();
        inv.hydrate_from_exchange(&[BalanceInfo {
            asset: "BTC".into(),
            free: 0.1,
            locked: 0.0,
        }]);
        assert!(inv.reserve("BTC", 0.5).is_err());
    }

    #[test]
    fn confirm_buy_blends_weighted_average_price() {
        let inv = InventoryManager::new();
        inv.confirm_fill("BTC", true, 1.0, 50_000.0, 0.0);
        inv.confirm_fill("BTC", true, 1.0, 60_000.0, 0.0);
        let snap = inv.snapshot("BTC").unwrap();
        assert!((snap.avg_entry_price - 55_000.0).abs() < 1e-6);
        assert!((snap.available - 2.0).abs() < 1e-9);
    }

    #[test]
    fn confirm_sell_reduces_reserved() {
        let inv = InventoryManager::new();
        inv.hydrate_from_exchange(&[BalanceInfo {
            asset: "BTC".into(),
            free: 1.0,
            locked: 0.0,
        }]);
        inv.reserve("BTC", 1.0).unwrap();
        inv.confirm_fill("BTC", false, 1.0, 51_000.0, 0.0);
        assert!((inv.snapshot("BTC").unwrap().reserved - 0.0).abs() < 1e-9);
    }

    #[test]
    fn confirm_buy_debits_cash_including_fees() {
        let inv = InventoryManager::new();
        inv.seed_cash(100_000.0);
        inv.confirm_fill("BTC", true, 1.0, 50_000.0, 10.0);
        assert!((inv.cash_usd() - 49_990.0).abs() < 1e-6);
    }

    #[test]
    fn confirm_sell_credits_cash_net_of_fees() {
        let inv = InventoryManager::new();
        inv.hydrate_from_exchange(&[BalanceInfo {
            asset: "BTC".into(),
            free: 1.0,
            locked: 0.0,
        }]);
        inv.reserve("BTC", 1.0).unwrap();
        inv.confirm_fill("BTC", false, 1.0, 51_000.0, 5.0);
        assert!((inv.cash_usd() - 50_995.0).abs() < 1e-6);
    }

    #[test]
    fn can_sell_respects_dust_buffer() {
        let inv = InventoryManager::new();
        inv.hydrate_from_exchange(&[BalanceInfo {
            asset: "BTC".into(),
            free: 0.01,
            locked: 0.0,
        }]);
        assert!(inv.can_sell("BTC", 0.01));
        assert!(!inv.can_sell("BTC", 0.02));
    }
}

// =============================================================================
// Exchange Adapter — a single async trait every venue implements
// =============================================================================
//
// order_manager.rs, reconciler.rs and trading_loops.rs all talk to the
// exchange through this trait rather than to binance::client::BinanceClient
// directly, so swapping venues or running fully offline (UnavailableAdapter)
// never touches call sites.
// =============================================================================

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::binance::client::BinanceClient;
use crate::error::CoreError;
use crate::types::BalanceInfo;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub exchange_order_id: String,
    pub status: String,
    pub filled_quantity: f64,
    pub avg_fill_price: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

/// A venue that can place orders, cancel them, and report balances. Every
/// method returns [`CoreError`] so the retry executor can classify failures
/// uniformly across venues.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_balances(&self) -> Result<Vec<BalanceInfo>, CoreError>;

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: Option<f64>,
        client_order_id: &str,
    ) -> Result<PlacedOrder, CoreError>;

    async fn cancel_order(&self, symbol: &str, exchange_order_id: &str) -> Result<(), CoreError>;

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<PlacedOrder>, CoreError>;

    async fn get_order(&self, symbol: &str, exchange_order_id: &str) -> Result<PlacedOrder, CoreError>;
}

fn map_anyhow(context: &str, err: anyhow::Error) -> CoreError {
    let msg = format!("{context}: {err}");
    if crate::retry::is_retryable_message(&msg) {
        CoreError::transient(msg)
    } else {
        CoreError::fatal(msg)
    }
}

// ---------------------------------------------------------------------------
// BinanceAdapter
// ---------------------------------------------------------------------------

pub struct BinanceAdapter {
    client: BinanceClient,
}

impl BinanceAdapter {
    pub fn new(client: BinanceClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn name(&self) -> &'static str {
        "binance"
    }

    async fn get_balances(&self) -> Result<Vec<BalanceInfo>, CoreError> {
        let account = self
            .client
            .get_account()
            .await
            .map_err(|e| map_anyhow("binance get_account", e))?;

        let balances = account["balances"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::with_capacity(balances.len());
        for b in balances {
            let asset = b["asset"].as_str().unwrap_or("").to_string();
            let free: f64 = b["free"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let locked: f64 = b["locked"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            if free > 0.0 || locked > 0.0 {
                out.push(BalanceInfo { asset, free, locked });
            }
        }
        Ok(out)
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: Option<f64>,
        client_order_id: &str,
    ) -> Result<PlacedOrder, CoreError> {
        let order_type = if price.is_some() { "LIMIT" } else { "MARKET" };
        let tif = if price.is_some() { Some("GTC") } else { None };

        let body = self
            .client
            .place_order(
                symbol,
                side.as_str(),
                order_type,
                quantity,
                price,
                tif,
                Some(client_order_id),
            )
            .await
            .map_err(|e| map_anyhow("binance place_order", e))?;

        Ok(PlacedOrder {
            exchange_order_id: body["orderId"].as_u64().map(|id| id.to_string()).unwrap_or_default(),
            status: body["status"].as_str().unwrap_or("NEW").to_string(),
            filled_quantity: body["executedQty"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
            avg_fill_price: body["cummulativeQuoteQty"]
                .as_str()
                .and_then(|s| s.parse::<f64>().ok())
                .and_then(|quote| {
                    let qty: f64 = body["executedQty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                    if qty > 0.0 { Some(quote / qty) } else { None }
                }),
        })
    }

    async fn cancel_order(&self, symbol: &str, exchange_order_id: &str) -> Result<(), CoreError> {
        let order_id: u64 = exchange_order_id
            .parse()
            .map_err(|_| CoreError::invariant("non-numeric binance order id"))?;
        self.client
            .cancel_order(symbol, order_id)
            .await
            .map_err(|e| map_anyhow("binance cancel_order", e))?;
        Ok(())
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<PlacedOrder>, CoreError> {
        let orders = self
            .client
            .get_open_orders(Some(symbol))
            .await
            .map_err(|e| map_anyhow("binance get_open_orders", e))?;

        Ok(orders
            .into_iter()
            .map(|o| PlacedOrder {
                exchange_order_id: o["orderId"].as_u64().map(|id| id.to_string()).unwrap_or_default(),
                status: o["status"].as_str().unwrap_or("NEW").to_string(),
                filled_quantity: o["executedQty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                avg_fill_price: None,
            })
            .collect())
    }

    async fn get_order(&self, symbol: &str, exchange_order_id: &str) -> Result<PlacedOrder, CoreError> {
        let open = self.get_open_orders(symbol).await?;
        open.into_iter()
            .find(|o| o.exchange_order_id == exchange_order_id)
            .ok_or_else(|| CoreError::transient("order not found among open orders"))
    }
}

// ---------------------------------------------------------------------------
// CoinbaseAdapter — HMAC-SHA256 base64-encoded signing, same shape request
// ---------------------------------------------------------------------------

pub struct CoinbaseAdapter {
    api_key: String,
    secret: String,
    passphrase: String,
    base_url: String,
    client: reqwest::Client,
}

impl CoinbaseAdapter {
    pub fn new(api_key: String, secret: String, passphrase: String) -> Self {
        Self {
            api_key,
            secret,
            passphrase,
            base_url: "https://api.exchange.coinbase.com".to_string(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
        }
    }

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String, CoreError> {
        let message = format!("{timestamp}{method}{path}{body}");
        let decoded_secret = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            &self.secret,
        )
        .map_err(|e| CoreError::fatal(format!("invalid coinbase secret encoding: {e}")))?;
        let mut mac = HmacSha256::new_from_slice(&decoded_secret)
            .map_err(|e| CoreError::fatal(format!("hmac init failed: {e}")))?;
        mac.update(message.as_bytes());
        Ok(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            mac.finalize().into_bytes(),
        ))
    }
}

#[async_trait]
impl ExchangeAdapter for CoinbaseAdapter {
    fn name(&self) -> &'static str {
        "coinbase"
    }

    async fn get_balances(&self) -> Result<Vec<BalanceInfo>, CoreError> {
        let timestamp = (chrono::Utc::now().timestamp_millis() / 1000).to_string();
        let path = "/accounts";
        let signature = self.sign(&timestamp, "GET", path, "")?;

        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("CB-ACCESS-KEY", &self.api_key)
            .header("CB-ACCESS-SIGN", signature)
            .header("CB-ACCESS-TIMESTAMP", timestamp)
            .header("CB-ACCESS-PASSPHRASE", &self.passphrase)
            .send()
            .await
            .map_err(|e| CoreError::transient(format!("coinbase request failed: {e}")))?;

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CoreError::fatal(format!("coinbase response parse failed: {e}")))?;

        let accounts = body.as_array().cloned().unwrap_or_default();
        let mut out = Vec::with_capacity(accounts.len());
        for a in accounts {
            let asset = a["currency"].as_str().unwrap_or("").to_uppercase();
            let available: f64 = a["available"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let hold: f64 = a["hold"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            if available > 0.0 || hold > 0.0 {
                out.push(BalanceInfo { asset, free: available, locked: hold });
            }
        }
        Ok(out)
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: Option<f64>,
        client_order_id: &str,
    ) -> Result<PlacedOrder, CoreError> {
        let order_type = if price.is_some() { "limit" } else { "market" };
        let body = serde_json::json!({
            "client_oid": client_order_id,
            "product_id": symbol,
            "side": side.as_str().to_lowercase(),
            "type": order_type,
            "size": quantity,
            "price": price,
        })
        .to_string();

        let timestamp = (chrono::Utc::now().timestamp_millis() / 1000).to_string();
        let path = "/orders";
        let signature = self.sign(&timestamp, "POST", path, &body)?;

        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("CB-ACCESS-KEY", &self.api_key)
            .header("CB-ACCESS-SIGN", signature)
            .header("CB-ACCESS-TIMESTAMP", timestamp)
            .header("CB-ACCESS-PASSPHRASE", &self.passphrase)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| CoreError::transient(format!("coinbase order request failed: {e}")))?;

        let parsed: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CoreError::fatal(format!("coinbase order response parse failed: {e}")))?;

        debug!(symbol, "coinbase order submitted");

        Ok(PlacedOrder {
            exchange_order_id: parsed["id"].as_str().unwrap_or_default().to_string(),
            status: parsed["status"].as_str().unwrap_or("pending").to_string(),
            filled_quantity: parsed["filled_size"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
            avg_fill_price: parsed["executed_value"]
                .as_str()
                .and_then(|s| s.parse::<f64>().ok()),
        })
    }

    async fn cancel_order(&self, _symbol: &str, exchange_order_id: &str) -> Result<(), CoreError> {
        let timestamp = (chrono::Utc::now().timestamp_millis() / 1000).to_string();
        let path = format!("/orders/{exchange_order_id}");
        let signature = self.sign(&timestamp, "DELETE", &path, "")?;

        self.client
            .delete(format!("{}{}", self.base_url, path))
            .header("CB-ACCESS-KEY", &self.api_key)
            .header("CB-ACCESS-SIGN", signature)
            .header("CB-ACCESS-TIMESTAMP", timestamp)
            .header("CB-ACCESS-PASSPHRASE", &self.passphrase)
            .send()
            .await
            .map_err(|e| CoreError::transient(format!("coinbase cancel request failed: {e}")))?;
        Ok(())
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<PlacedOrder>, CoreError> {
        let timestamp = (chrono::Utc::now().timestamp_millis() / 1000).to_string();
        let path = format!("/orders?product_id={symbol}&status=open");
        let signature = self.sign(&timestamp, "GET", &path, "")?;

        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("CB-ACCESS-KEY", &self.api_key)
            .header("CB-ACCESS-SIGN", signature)
            .header("CB-ACCESS-TIMESTAMP", timestamp)
            .header("CB-ACCESS-PASSPHRASE", &self.passphrase)
            .send()
            .await
            .map_err(|e| CoreError::transient(format!("coinbase open orders request failed: {e}")))?;

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CoreError::fatal(format!("coinbase open orders parse failed: {e}")))?;

        Ok(body
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|o| PlacedOrder {
                exchange_order_id: o["id"].as_str().unwrap_or_default().to_string(),
                status: o["status"].as_str().unwrap_or("open").to_string(),
                filled_quantity: o["filled_size"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                avg_fill_price: None,
            })
            .collect())
    }

    async fn get_order(&self, symbol: &str, exchange_order_id: &str) -> Result<PlacedOrder, CoreError> {
        let open = self.get_open_orders(symbol).await?;
        open.into_iter()
            .find(|o| o.exchange_order_id == exchange_order_id)
            .ok_or_else(|| CoreError::transient("order not found among open orders"))
    }
}

// ---------------------------------------------------------------------------
// CcxtStyleAdapter — generic REST venue reached through a ccxt-compatible
// bridge endpoint, for venues without a bespoke client in this codebase.
// ---------------------------------------------------------------------------

pub struct CcxtStyleAdapter {
    bridge_base_url: String,
    venue_id: String,
    client: reqwest::Client,
}

impl CcxtStyleAdapter {
    pub fn new(bridge_base_url: String, venue_id: String) -> Self {
        Self {
            bridge_base_url,
            venue_id,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for CcxtStyleAdapter {
    fn name(&self) -> &'static str {
        "ccxt_bridge"
    }

    async fn get_balances(&self) -> Result<Vec<BalanceInfo>, CoreError> {
        let url = format!("{}/{}/balances", self.bridge_base_url, self.venue_id);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::transient(format!("ccxt bridge request failed: {e}")))?;
        let balances: Vec<BalanceInfo> = resp
            .json()
            .await
            .map_err(|e| CoreError::fatal(format!("ccxt bridge response parse failed: {e}")))?;
        Ok(balances)
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: Option<f64>,
        client_order_id: &str,
    ) -> Result<PlacedOrder, CoreError> {
        let url = format!("{}/{}/order", self.bridge_base_url, self.venue_id);
        let payload = serde_json::json!({
            "symbol": symbol,
            "side": side.as_str(),
            "quantity": quantity,
            "price": price,
            "client_order_id": client_order_id,
        });
        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| CoreError::transient(format!("ccxt bridge order failed: {e}")))?;
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CoreError::fatal(format!("ccxt bridge order parse failed: {e}")))?;

        Ok(PlacedOrder {
            exchange_order_id: body["order_id"].as_str().unwrap_or_default().to_string(),
            status: body["status"].as_str().unwrap_or("open").to_string(),
            filled_quantity: body["filled_quantity"].as_f64().unwrap_or(0.0),
            avg_fill_price: body["avg_fill_price"].as_f64(),
        })
    }

    async fn cancel_order(&self, symbol: &str, exchange_order_id: &str) -> Result<(), CoreError> {
        let url = format!(
            "{}/{}/order/{}/{}",
            self.bridge_base_url, self.venue_id, symbol, exchange_order_id
        );
        self.client
            .delete(&url)
            .send()
            .await
            .map_err(|e| CoreError::transient(format!("ccxt bridge cancel failed: {e}")))?;
        Ok(())
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<PlacedOrder>, CoreError> {
        let url = format!("{}/{}/orders/{}", self.bridge_base_url, self.venue_id, symbol);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::transient(format!("ccxt bridge open orders failed: {e}")))?;
        let raw: Vec<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| CoreError::fatal(format!("ccxt bridge open orders parse failed: {e}")))?;

        Ok(raw
            .into_iter()
            .map(|o| PlacedOrder {
                exchange_order_id: o["order_id"].as_str().unwrap_or_default().to_string(),
                status: o["status"].as_str().unwrap_or("open").to_string(),
                filled_quantity: o["filled_quantity"].as_f64().unwrap_or(0.0),
                avg_fill_price: o["avg_fill_price"].as_f64(),
            })
            .collect())
    }

    async fn get_order(&self, symbol: &str, exchange_order_id: &str) -> Result<PlacedOrder, CoreError> {
        let open = self.get_open_orders(symbol).await?;
        open.into_iter()
            .find(|o| o.exchange_order_id == exchange_order_id)
            .ok_or_else(|| CoreError::transient("order not found among open orders"))
    }
}

// ---------------------------------------------------------------------------
// UnavailableAdapter — fallback used in Demo mode or when no credentials are
// configured; reads return empty, writes degrade loudly rather than panic.
// ---------------------------------------------------------------------------

pub struct UnavailableAdapter {
    reason: String,
}

impl UnavailableAdapter {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[async_trait]
impl ExchangeAdapter for UnavailableAdapter {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    async fn get_balances(&self) -> Result<Vec<BalanceInfo>, CoreError> {
        Ok(Vec::new())
    }

    async fn place_order(
        &self,
        _symbol: &str,
        _side: OrderSide,
        _quantity: f64,
        _price: Option<f64>,
        _client_order_id: &str,
    ) -> Result<PlacedOrder, CoreError> {
        warn!(reason = %self.reason, "order rejected: no exchange adapter configured");
        Err(CoreError::degraded(format!(
            "no exchange adapter available: {}",
            self.reason
        )))
    }

    async fn cancel_order(&self, _symbol: &str, _exchange_order_id: &str) -> Result<(), CoreError> {
        Err(CoreError::degraded(format!(
            "no exchange adapter available: {}",
            self.reason
        )))
    }

    async fn get_open_orders(&self, _symbol: &str) -> Result<Vec<PlacedOrder>, CoreError> {
        Ok(Vec::new())
    }

    async fn get_order(&self, _symbol: &str, _exchange_order_id: &str) -> Result<PlacedOrder, CoreError> {
        Err(CoreError::degraded(format!(
            "no exchange adapter available: {}",
            self.reason
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unavailable_adapter_degrades_writes_but_allows_reads() {
        let adapter = UnavailableAdapter::new("demo mode");
        assert!(adapter.get_balances().await.unwrap().is_empty());
        let err = adapter
            .place_order("BTCUSDT", OrderSide::Buy, 1.0, None, "abc")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Degraded(_)));
    }

    #[test]
    fn order_side_renders_binance_style_strings() {
        assert_eq!(OrderSide::Buy.as_str(), "BUY");
        assert_eq!(OrderSide::Sell.as_str(), "SELL");
    }
}

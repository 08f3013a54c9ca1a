// =============================================================================
// Event Bus — typed pub/sub fan-out over tokio broadcast channels
// =============================================================================
//
// One broadcast channel per payload kind rather than one channel carrying an
// enum, so a subscriber only interested in fills never pays for decoding
// price ticks. Each channel caps its subscriber count; EventBus::subscribe_*
// returns an error once the ceiling is hit rather than letting an unbounded
// number of dashboard connections silently degrade broadcast throughput.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::CoreError;

const CHANNEL_CAPACITY: usize = 256;
const MAX_SUBSCRIBERS_PER_CHANNEL: u32 = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceEvent {
    pub symbol: String,
    pub price: f64,
    pub at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub price: f64,
    pub at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionEvent {
    pub symbol: String,
    pub status: String,
    pub at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub severity: String,
    pub message: String,
    pub at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricEvent {
    pub name: String,
    pub value: f64,
    pub at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentEvent {
    pub symbol: String,
    pub score: f64,
    pub at_ms: i64,
}

struct Channel<T> {
    sender: broadcast::Sender<T>,
    subscriber_count: AtomicU32,
}

impl<T: Clone> Channel<T> {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            subscriber_count: AtomicU32::new(0),
        }
    }

    fn publish(&self, event: T) {
        // A broadcast send only errs when there are zero receivers, which is
        // a normal idle state, not a failure worth logging.
        let _ = self.sender.send(event);
    }

    fn subscribe(self: &Arc<Self>) -> Result<Subscription<T>, CoreError> {
        let count = self.subscriber_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count > MAX_SUBSCRIBERS_PER_CHANNEL {
            self.subscriber_count.fetch_sub(1, Ordering::SeqCst);
            warn!(limit = MAX_SUBSCRIBERS_PER_CHANNEL, "event bus channel subscriber ceiling reached");
            return Err(CoreError::degraded("event bus channel subscriber ceiling reached"));
        }
        Ok(Subscription {
            receiver: self.sender.subscribe(),
            counter: self.clone(),
        })
    }
}

/// RAII subscription handle; dropping it releases the subscriber slot.
pub struct Subscription<T> {
    receiver: broadcast::Receiver<T>,
    counter: Arc<Channel<T>>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.counter.subscriber_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Central fan-out point for the engine's internal event stream.
pub struct EventBus {
    prices: Arc<Channel<PriceEvent>>,
    trades: Arc<Channel<TradeEvent>>,
    positions: Arc<Channel<PositionEvent>>,
    alerts: Arc<Channel<AlertEvent>>,
    metrics: Arc<Channel<MetricEvent>>,
    sentiment: Arc<Channel<SentimentEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            prices: Arc::new(Channel::new()),
            trades: Arc::new(Channel::new()),
            positions: Arc::new(Channel::new()),
            alerts: Arc::new(Channel::new()),
            metrics: Arc::new(Channel::new()),
            sentiment: Arc::new(Channel::new()),
        }
    }

    pub fn publish_price(&self, event: PriceEvent) {
        self.prices.publish(event);
    }
    pub fn publish_trade(&self, event: TradeEvent) {
        self.trades.publish(event);
    }
    pub fn publish_position(&self, event: PositionEvent) {
        self.positions.publish(event);
    }
    pub fn publish_alert(&self, event: AlertEvent) {
        self.alerts.publish(event);
    }
    pub fn publish_metric(&self, event: MetricEvent) {
        self.metrics.publish(event);
    }
    pub fn publish_sentiment(&self, event: SentimentEvent) {
        self.sentiment.publish(event);
    }

    pub fn subscribe_prices(&self) -> Result<Subscription<PriceEvent>, CoreError> {
        self.prices.subscribe()
    }
    pub fn subscribe_trades(&self) -> Result<Subscription<TradeEvent>, CoreError> {
        self.trades.subscribe()
    }
    pub fn subscribe_positions(&self) -> Result<Subscription<PositionEvent>, CoreError> {
        self.positions.subscribe()
    }
    pub fn subscribe_alerts(&self) -> Result<Subscription<AlertEvent>, CoreError> {
        self.alerts.subscribe()
    }
    pub fn subscribe_metrics(&self) -> Result<Subscription<MetricEvent>, CoreError> {
        self.metrics.subscribe()
    }
    pub fn subscribe_sentiment(&self) -> Result<Subscription<SentimentEvent>, CoreError> {
        self.sentiment.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_prices().unwrap();
        bus.publish_price(PriceEvent {
            symbol: "BTCUSDT".into(),
            price: 50_000.0,
            at_ms: 0,
        });
        let event = sub.recv().await.unwrap();
        assert_eq!(event.symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish_alert(AlertEvent {
            severity: "info".into(),
            message: "hello".into(),
            at_ms: 0,
        });
    }

    #[test]
    fn subscriber_ceiling_is_enforced() {
        let bus = EventBus::new();
        let mut subs = Vec::new();
        for _ in 0..MAX_SUBSCRIBERS_PER_CHANNEL {
            subs.push(bus.subscribe_alerts().unwrap());
        }
        assert!(bus.subscribe_alerts().is_err());
        subs.pop();
        assert!(bus.subscribe_alerts().is_ok());
    }
}

// =============================================================================
// Signal Queue — bounded FIFO with drop-oldest backpressure
// =============================================================================
//
// Sits between the strategy loop producing candidate signals and the order
// manager consuming them. Bounded so a stalled consumer (exchange outage,
// retry executor circuit open) cannot grow memory unbounded; drop-oldest
// because a five-minute-old signal is worse than no signal at all.
// =============================================================================

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedSignal {
    pub symbol: String,
    pub side: String,
    pub confidence: f64,
    pub queued_at_ms: i64,
}

pub struct SignalQueue {
    capacity: usize,
    items: Mutex<VecDeque<QueuedSignal>>,
    dropped_count: std::sync::atomic::AtomicU64,
}

impl SignalQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            dropped_count: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Push a signal. If the queue is at capacity, the oldest entry is
    /// dropped to make room and the drop counter is incremented.
    pub fn push(&self, signal: QueuedSignal) {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            items.pop_front();
            self.dropped_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            warn!(capacity = self.capacity, "signal queue full — dropped oldest entry");
        }
        items.push_back(signal);
    }

    pub fn pop(&self) -> Option<QueuedSignal> {
        self.items.lock().pop_front()
    }

    /// Look at the oldest queued signal without removing it.
    pub fn peek(&self) -> Option<QueuedSignal> {
        self.items.lock().front().cloned()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn drain(&self) -> Vec<QueuedSignal> {
        self.items.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(symbol: &str) -> QueuedSignal {
        QueuedSignal {
            symbol: symbol.to_string(),
            side: "BUY".to_string(),
            confidence: 0.7,
            queued_at_ms: 0,
        }
    }

    #[test]
    fn fifo_ordering_is_preserved() {
        let q = SignalQueue::new(10);
        q.push(sig("A"));
        q.push(sig("B"));
        assert_eq!(q.pop().unwrap().symbol, "A");
        assert_eq!(q.pop().unwrap().symbol, "B");
        assert!(q.pop().is_none());
    }

    #[test]
    fn drops_oldest_when_full() {
        let q = SignalQueue::new(2);
        q.push(sig("A"));
        q.push(sig("B"));
        q.push(sig("C"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap().symbol, "B");
        assert_eq!(q.pop().unwrap().symbol, "C");
        assert_eq!(q.dropped_count(), 1);
    }

    #[test]
    fn peek_returns_oldest_without_removing_it() {
        let q = SignalQueue::new(10);
        q.push(sig("A"));
        q.push(sig("B"));
        assert_eq!(q.peek().unwrap().symbol, "A");
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap().symbol, "A");
    }

    #[test]
    fn peek_on_empty_queue_returns_none() {
        let q = SignalQueue::new(10);
        assert!(q.peek().is_none());
    }

    #[test]
    fn drain_empties_the_queue() {
        let q = SignalQueue::new(10);
        q.push(sig("A"));
        q.push(sig("B"));
        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert!(q.is_empty());
    }
}

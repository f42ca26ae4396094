//! Per-connection counters and rolling histories.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use log::info;
use serde::Serialize;

const LATENCY_HISTORY: usize = 1000;
const DROP_HISTORY: usize = 500;

/// Send/receive counts for one wire class.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ClassCounters {
    pub sent: u64,
    pub received: u64,
}

/// One dropped outbound message.
#[derive(Debug, Clone)]
pub struct DropEvent {
    pub at: SystemTime,
    pub class_name: String,
}

/// Serializable point-in-time view of a connection's counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    pub send_errors: u64,
    pub receive_errors: u64,
    pub would_block: u64,
    pub avg_receive_latency_us: f64,
    pub recent_drops: usize,
    pub per_class: BTreeMap<String, ClassCounters>,
}

#[derive(Default)]
struct StatsInner {
    sent: u64,
    received: u64,
    dropped: u64,
    send_errors: u64,
    receive_errors: u64,
    would_block: u64,
    latencies: VecDeque<Duration>,
    drop_events: VecDeque<DropEvent>,
    per_class: BTreeMap<String, ClassCounters>,
}

/// Monotonic counters plus bounded rolling histories (last 1000 receive
/// latencies, last 500 drop events) for one connection. Counters reset only
/// on explicit request.
pub struct ConnectionStats {
    inner: Mutex<StatsInner>,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsInner::default()),
        }
    }

    pub fn record_sent(&self, class_name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.sent += 1;
        inner.per_class.entry(class_name.to_string()).or_default().sent += 1;
    }

    pub fn record_received(&self, class_name: &str, latency: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.received += 1;
        inner
            .per_class
            .entry(class_name.to_string())
            .or_default()
            .received += 1;
        if inner.latencies.len() == LATENCY_HISTORY {
            inner.latencies.pop_front();
        }
        inner.latencies.push_back(latency);
    }

    pub fn record_dropped(&self, class_name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.dropped += 1;
        if inner.drop_events.len() == DROP_HISTORY {
            inner.drop_events.pop_front();
        }
        inner.drop_events.push_back(DropEvent {
            at: SystemTime::now(),
            class_name: class_name.to_string(),
        });
    }

    pub fn record_send_error(&self) {
        self.inner.lock().unwrap().send_errors += 1;
    }

    pub fn record_receive_error(&self) {
        self.inner.lock().unwrap().receive_errors += 1;
    }

    pub fn record_would_block(&self) {
        self.inner.lock().unwrap().would_block += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock().unwrap();
        let avg_receive_latency_us = if inner.latencies.is_empty() {
            0.0
        } else {
            let total: Duration = inner.latencies.iter().sum();
            total.as_micros() as f64 / inner.latencies.len() as f64
        };
        StatsSnapshot {
            sent: inner.sent,
            received: inner.received,
            dropped: inner.dropped,
            send_errors: inner.send_errors,
            receive_errors: inner.receive_errors,
            would_block: inner.would_block,
            avg_receive_latency_us,
            recent_drops: inner.drop_events.len(),
            per_class: inner.per_class.clone(),
        }
    }

    pub fn recent_drop_events(&self) -> Vec<DropEvent> {
        self.inner.lock().unwrap().drop_events.iter().cloned().collect()
    }

    /// Zeroes every counter and history. Explicit request only.
    pub fn reset(&self) {
        *self.inner.lock().unwrap() = StatsInner::default();
    }

    pub fn log(&self, name: &str) {
        let snapshot = self.snapshot();
        info!(
            "[{name}] connection stats: {}",
            serde_json::to_string(&snapshot).unwrap_or_default()
        );
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_history_is_bounded() {
        let stats = ConnectionStats::new();
        for _ in 0..(LATENCY_HISTORY + 50) {
            stats.record_received("Tick", Duration::from_micros(10));
        }
        let inner = stats.inner.lock().unwrap();
        assert_eq!(inner.latencies.len(), LATENCY_HISTORY);
        assert_eq!(inner.received, (LATENCY_HISTORY + 50) as u64);
    }

    #[test]
    fn drop_history_is_bounded_but_counter_is_not() {
        let stats = ConnectionStats::new();
        for _ in 0..(DROP_HISTORY + 10) {
            stats.record_dropped("Tick");
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.dropped, (DROP_HISTORY + 10) as u64);
        assert_eq!(snapshot.recent_drops, DROP_HISTORY);
    }

    #[test]
    fn reset_zeroes_everything() {
        let stats = ConnectionStats::new();
        stats.record_sent("Order");
        stats.record_would_block();
        stats.reset();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sent, 0);
        assert_eq!(snapshot.would_block, 0);
        assert!(snapshot.per_class.is_empty());
    }
}

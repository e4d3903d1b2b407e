//! Counters for change feed traffic

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Snapshot of change feed counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFeedStats {
    pub events_published: u64,
    pub events_received: u64,
    pub errors: u64,
}

/// Thread-safe counters shared between a publisher or subscriber and its tasks
#[derive(Clone, Default)]
pub struct StatsCollector {
    events_published: Arc<AtomicU64>,
    events_received: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_publish(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_receive(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self) -> ChangeFeedStats {
        ChangeFeedStats {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_starts_empty() {
        let collector = StatsCollector::new();
        assert_eq!(collector.snapshot(), ChangeFeedStats::default());
    }

    #[test]
    fn test_collector_counts() {
        let collector = StatsCollector::new();
        collector.record_publish();
        collector.record_publish();
        collector.record_receive();
        collector.record_error();

        let stats = collector.snapshot();
        assert_eq!(stats.events_published, 2);
        assert_eq!(stats.events_received, 1);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn test_clones_share_counters() {
        let collector = StatsCollector::new();
        let clone = collector.clone();
        clone.record_receive();
        assert_eq!(collector.snapshot().events_received, 1);
    }
}

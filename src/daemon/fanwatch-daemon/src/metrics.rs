//! Metrics collection and reporting
//! Follows SRP: Only responsible for metrics collection and export

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use fanwatch_core::{ChangeEvent, ChangeFlags};
use fanwatch_system::RegistryStats;
use metrics::{counter, gauge};

/// Metrics collector for watch statistics
pub struct MetricsCollector {
    start_time: Instant,
    events_seen: AtomicU64,
    events_emitted: AtomicU64,
    events_filtered: AtomicU64,
    errors_count: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            events_seen: AtomicU64::new(0),
            events_emitted: AtomicU64::new(0),
            events_filtered: AtomicU64::new(0),
            errors_count: AtomicU64::new(0),
        }
    }

    /// Record an event received from the watch, before filtering
    pub fn record_event(&self, event: &ChangeEvent) {
        counter!("fanwatch_events_total").increment(1);
        counter!("fanwatch_events_by_action_total", "action" => action_label(event.flags))
            .increment(1);
        self.events_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emitted(&self) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event dropped by the include/exclude patterns
    pub fn record_filtered(&self) {
        counter!("fanwatch_events_filtered_total").increment(1);
        self.events_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        counter!("fanwatch_errors_total").increment(1);
        self.errors_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_registry_stats(&self, stats: &RegistryStats) {
        gauge!("fanwatch_active_path_sets").set(stats.path_sets as f64);
        gauge!("fanwatch_subscribers").set(stats.subscribers as f64);
    }

    /// Get current statistics
    pub fn get_stats(&self) -> MetricsStats {
        MetricsStats {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            events_seen: self.events_seen.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            events_filtered: self.events_filtered.load(Ordering::Relaxed),
            errors_count: self.errors_count.load(Ordering::Relaxed),
        }
    }

    /// Calculate events per second
    pub fn events_per_second(&self) -> f64 {
        let events = self.events_seen.load(Ordering::Relaxed);
        let uptime = self.start_time.elapsed().as_secs_f64();

        if uptime > 0.0 {
            events as f64 / uptime
        } else {
            0.0
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsStats {
    pub uptime_seconds: u64,
    pub events_seen: u64,
    pub events_emitted: u64,
    pub events_filtered: u64,
    pub errors_count: u64,
}

/// Single label for an event's action facets, most significant first
fn action_label(flags: ChangeFlags) -> &'static str {
    if flags.needs_rescan() {
        "rescan"
    } else if flags.is_created() {
        "created"
    } else if flags.is_removed() {
        "removed"
    } else if flags.is_renamed() {
        "renamed"
    } else if flags.is_modified() {
        "modified"
    } else if flags.is_metadata_change() {
        "metadata"
    } else {
        "other"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector() {
        let collector = MetricsCollector::new();

        let event = ChangeEvent::new(1, "/test/file.txt", ChangeFlags::CREATED);
        collector.record_event(&event);
        collector.record_emitted();

        let other = ChangeEvent::new(2, "/test/file.log", ChangeFlags::MODIFIED);
        collector.record_event(&other);
        collector.record_filtered();
        collector.record_error();

        let stats = collector.get_stats();
        assert_eq!(stats.events_seen, 2);
        assert_eq!(stats.events_emitted, 1);
        assert_eq!(stats.events_filtered, 1);
        assert_eq!(stats.errors_count, 1);
    }

    #[test]
    fn test_action_label() {
        assert_eq!(action_label(ChangeFlags::CREATED | ChangeFlags::IS_FILE), "created");
        assert_eq!(
            action_label(ChangeFlags::CREATED | ChangeFlags::REMOVED),
            "created"
        );
        assert_eq!(action_label(ChangeFlags::RENAMED), "renamed");
        assert_eq!(action_label(ChangeFlags::INODE_META_MOD), "metadata");
        assert_eq!(action_label(ChangeFlags::MUST_SCAN_SUB_DIRS), "rescan");
        assert_eq!(action_label(ChangeFlags::IS_DIR), "other");
    }
}

//! Per-buffer statistics
//!
//! Counters are plain atomics bumped by the single reader thread of each
//! buffer and polled on demand from anywhere else. Nothing is pushed.

use crate::BufferId;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Counters for one shared buffer
#[derive(Debug, Default)]
pub struct BufferMetrics {
    /// Events handed to the consumer
    pub delivered_events: AtomicU64,
    /// Events the producer reported as dropped
    pub lost_events: AtomicU64,
    /// Lost-count notification records seen
    pub lost_records: AtomicU64,
    /// Malformed or truncated records
    pub framing_errors: AtomicU64,
    /// Records of an unrecognized kind
    pub unknown_records: AtomicU64,
    /// Events rewritten from a legacy layout
    pub converted_events: AtomicU64,
    /// Events dropped because conversion failed
    pub conversion_failures: AtomicU64,
    /// Bytes released back to the producer
    pub bytes_committed: AtomicU64,
    /// Read attempts that returned a non-empty span
    pub reads: AtomicU64,
}

impl BufferMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> BufferStats {
        BufferStats {
            delivered_events: self.delivered_events.load(Ordering::Relaxed),
            lost_events: self.lost_events.load(Ordering::Relaxed),
            lost_records: self.lost_records.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            unknown_records: self.unknown_records.load(Ordering::Relaxed),
            converted_events: self.converted_events.load(Ordering::Relaxed),
            conversion_failures: self.conversion_failures.load(Ordering::Relaxed),
            bytes_committed: self.bytes_committed.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of `BufferMetrics`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub delivered_events: u64,
    pub lost_events: u64,
    pub lost_records: u64,
    pub framing_errors: u64,
    pub unknown_records: u64,
    pub converted_events: u64,
    pub conversion_failures: u64,
    pub bytes_committed: u64,
    pub reads: u64,
}

impl BufferStats {
    fn accumulate(&mut self, other: &BufferStats) {
        self.delivered_events += other.delivered_events;
        self.lost_events += other.lost_events;
        self.lost_records += other.lost_records;
        self.framing_errors += other.framing_errors;
        self.unknown_records += other.unknown_records;
        self.converted_events += other.converted_events;
        self.conversion_failures += other.conversion_failures;
        self.bytes_committed += other.bytes_committed;
        self.reads += other.reads;
    }
}

/// Registry of buffer counters
#[derive(Debug)]
pub struct MetricsCollector {
    /// When the collector was started
    start_time: Instant,
    /// Buffer id -> counters
    buffers: RwLock<BTreeMap<BufferId, Arc<BufferMetrics>>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            buffers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Counters for `buffer`, created on first use
    pub fn buffer(&self, buffer: BufferId) -> Arc<BufferMetrics> {
        if let Some(existing) = self.buffers.read().get(&buffer) {
            return existing.clone();
        }
        self.buffers
            .write()
            .entry(buffer)
            .or_insert_with(|| Arc::new(BufferMetrics::new()))
            .clone()
    }

    /// Snapshot of one buffer
    pub fn stats(&self, buffer: BufferId) -> Option<BufferStats> {
        self.buffers.read().get(&buffer).map(|m| m.snapshot())
    }

    /// Snapshot of every buffer
    pub fn all_stats(&self) -> BTreeMap<BufferId, BufferStats> {
        self.buffers
            .read()
            .iter()
            .map(|(id, m)| (*id, m.snapshot()))
            .collect()
    }

    /// Sum over every buffer
    pub fn totals(&self) -> BufferStats {
        let mut total = BufferStats::default();
        for stats in self.all_stats().values() {
            total.accumulate(stats);
        }
        total
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP syscap_uptime_seconds Time since the collector started\n");
        output.push_str("# TYPE syscap_uptime_seconds gauge\n");
        output.push_str(&format!(
            "syscap_uptime_seconds {}\n\n",
            self.uptime_seconds()
        ));

        let stats = self.all_stats();
        let series: [(&str, &str, fn(&BufferStats) -> u64); 9] = [
            ("syscap_events_delivered_total", "Events delivered to the consumer", |s| s.delivered_events),
            ("syscap_events_lost_total", "Events dropped by the producer", |s| s.lost_events),
            ("syscap_lost_records_total", "Lost-count notifications seen", |s| s.lost_records),
            ("syscap_framing_errors_total", "Malformed or truncated records", |s| s.framing_errors),
            ("syscap_unknown_records_total", "Records of an unrecognized kind", |s| s.unknown_records),
            ("syscap_events_converted_total", "Events rewritten from a legacy layout", |s| s.converted_events),
            ("syscap_conversion_failures_total", "Events dropped by a failed conversion", |s| s.conversion_failures),
            ("syscap_bytes_committed_total", "Bytes released back to the producer", |s| s.bytes_committed),
            ("syscap_reads_total", "Non-empty buffer reads", |s| s.reads),
        ];

        for (name, help, value) in series {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            for (id, s) in &stats {
                output.push_str(&format!("{}{{buffer=\"{}\"}} {}\n", name, id, value(s)));
            }
            output.push('\n');
        }

        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        let buffers: BTreeMap<String, BufferStats> = self
            .all_stats()
            .into_iter()
            .map(|(id, s)| (id.to_string(), s))
            .collect();

        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "totals": self.totals(),
            "buffers": buffers,
        })
    }
}

/// Shared metrics instance
pub type SharedMetrics = Arc<MetricsCollector>;

/// Create a new shared metrics collector
pub fn create_metrics() -> SharedMetrics {
    Arc::new(MetricsCollector::new())
}

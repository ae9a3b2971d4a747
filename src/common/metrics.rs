//! Metrics collection
//!
//! Lock-free counters, gauges and a latency histogram, gathered in a
//! [`MetricsRegistry`] that is shared by reference between components and
//! rendered in Prometheus text format for external monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with default latency buckets
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    /// Create a histogram with custom bucket boundaries
    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in the histogram
    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // stored as microseconds
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64() * 1000.0);
    }

    /// Cumulative `(upper bound, count)` pairs, ending with `+Inf`
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current values
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Process-wide counters, shared as `Arc<MetricsRegistry>`
#[derive(Debug)]
pub struct MetricsRegistry {
    // Coordinator
    pub assignments_total: Counter,
    pub unassignments_total: Counter,
    pub selection_failures_total: Counter,

    // Consensus
    pub proposals_total: Counter,
    pub proposal_timeouts_total: Counter,
    pub elections_total: Counter,
    pub leader_changes_total: Counter,
    pub commit_latency: Histogram,

    // Snapshots & logs
    pub snapshots_total: Counter,
    pub snapshot_failures_total: Counter,
    pub compaction_failures_total: Counter,
    pub log_rotations_total: Counter,

    // Sessions
    pub sessions_registered_total: Counter,
    pub sessions_failed_total: Counter,
    pub tasks_reassigned_total: Counter,
    pub active_sessions: Gauge,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            assignments_total: Counter::new(),
            unassignments_total: Counter::new(),
            selection_failures_total: Counter::new(),
            proposals_total: Counter::new(),
            proposal_timeouts_total: Counter::new(),
            elections_total: Counter::new(),
            leader_changes_total: Counter::new(),
            commit_latency: Histogram::new(),
            snapshots_total: Counter::new(),
            snapshot_failures_total: Counter::new(),
            compaction_failures_total: Counter::new(),
            log_rotations_total: Counter::new(),
            sessions_registered_total: Counter::new(),
            sessions_failed_total: Counter::new(),
            tasks_reassigned_total: Counter::new(),
            active_sessions: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn counters(&self) -> [(&'static str, &'static str, u64); 15] {
        [
            ("assignments_total", "Agents assigned to workers", self.assignments_total.get()),
            ("unassignments_total", "Agents released from workers", self.unassignments_total.get()),
            ("selection_failures_total", "Worker selections that found no candidate", self.selection_failures_total.get()),
            ("proposals_total", "Commands proposed to the replicated log", self.proposals_total.get()),
            ("proposal_timeouts_total", "Proposals that timed out before commit", self.proposal_timeouts_total.get()),
            ("elections_total", "Elections started by this replica", self.elections_total.get()),
            ("leader_changes_total", "Observed leader changes", self.leader_changes_total.get()),
            ("snapshots_total", "Snapshots persisted", self.snapshots_total.get()),
            ("snapshot_failures_total", "Snapshot attempts that failed", self.snapshot_failures_total.get()),
            ("compaction_failures_total", "Log compactions that failed after a snapshot", self.compaction_failures_total.get()),
            ("log_rotations_total", "Log segment rotations", self.log_rotations_total.get()),
            ("sessions_registered_total", "Sessions registered", self.sessions_registered_total.get()),
            ("sessions_failed_total", "Sessions declared failed by lease expiry", self.sessions_failed_total.get()),
            ("tasks_reassigned_total", "Tasks handed off from failed sessions", self.tasks_reassigned_total.get()),
            ("uptime_seconds", "Process uptime in seconds", self.uptime_seconds()),
        ]
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();

        for (name, help, value) in self.counters() {
            let kind = if name == "uptime_seconds" { "gauge" } else { "counter" };
            let _ = writeln!(out, "# HELP minifleet_{} {}", name, help);
            let _ = writeln!(out, "# TYPE minifleet_{} {}", name, kind);
            let _ = writeln!(out, "minifleet_{} {}", name, value);
        }

        out.push_str("# HELP minifleet_active_sessions Sessions currently tracked as active\n");
        out.push_str("# TYPE minifleet_active_sessions gauge\n");
        let _ = writeln!(out, "minifleet_active_sessions {}", self.active_sessions.get());

        out.push_str("# HELP minifleet_commit_latency_ms Proposal commit latency in milliseconds\n");
        out.push_str("# TYPE minifleet_commit_latency_ms histogram\n");
        for (le, count) in self.commit_latency.get_buckets() {
            if le.is_infinite() {
                let _ = writeln!(out, "minifleet_commit_latency_ms_bucket{{le=\"+Inf\"}} {}", count);
            } else {
                let _ = writeln!(out, "minifleet_commit_latency_ms_bucket{{le=\"{}\"}} {}", le, count);
            }
        }
        let _ = writeln!(out, "minifleet_commit_latency_ms_sum {}", self.commit_latency.sum());
        let _ = writeln!(out, "minifleet_commit_latency_ms_count {}", self.commit_latency.count());

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

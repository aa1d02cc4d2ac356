//! Prometheus metrics for the coordinator
//!
//! Counters, gauges and a histogram rendered in Prometheus text format.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Counter metric (monotonically increasing)
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Counter {
    /// Create a new counter
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
            help,
        }
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by delta
    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Gauge metric (can go up or down)
pub struct Gauge {
    value: AtomicI64,
    name: &'static str,
    help: &'static str,
}

impl Gauge {
    /// Create a new gauge
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name,
            help,
        }
    }

    /// Set value
    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

const TICK_BUCKETS: [f64; 10] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Histogram for latency measurements
pub struct Histogram {
    buckets: [AtomicU64; TICK_BUCKETS.len()],
    sum_micros: AtomicU64,
    count: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Histogram {
    /// Create with the tick latency buckets
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            buckets: [ZERO; TICK_BUCKETS.len()],
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name,
            help,
        }
    }

    /// Observe a duration
    pub fn observe(&self, elapsed: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);

        let secs = elapsed.as_secs_f64();
        for (bound, count) in TICK_BUCKETS.iter().zip(&self.buckets) {
            if secs <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Number of observations
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        let mut output = format!(
            "# HELP {} {}\n# TYPE {} histogram\n",
            self.name, self.help, self.name
        );

        for (bound, count) in TICK_BUCKETS.iter().zip(&self.buckets) {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name,
                bound,
                count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", self.name, self.count()));

        let sum_secs = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!("{}_sum {}\n", self.name, sum_secs));
        output.push_str(&format!("{}_count {}\n", self.name, self.count()));

        output
    }
}

/// Coordinator metrics
pub mod standard {
    use super::*;

    pub static REGISTERED_RUNNERS: Gauge =
        Gauge::new("shardlease_registered_runners", "Number of live registered runners");

    pub static ASSIGNED_SHARDS: Gauge =
        Gauge::new("shardlease_assigned_shards", "Shards with a confirmed owner");

    pub static UNASSIGNED_SHARDS: Gauge =
        Gauge::new("shardlease_unassigned_shards", "Shards without an owner");

    pub static SHARD_MOVES: Counter =
        Counter::new("shardlease_shard_moves_total", "Shards moved between runners by rebalancing");

    pub static TICK_FAILURES: Counter =
        Counter::new("shardlease_tick_failures_total", "Reconciliation ticks aborted by an error");

    pub static PARTIAL_GRANTS: Counter =
        Counter::new("shardlease_partial_grants_total", "Acquire calls granting fewer shards than requested");

    pub static TICK_DURATION: Histogram =
        Histogram::new("shardlease_tick_duration_seconds", "Reconciliation tick latency");
}

/// Render all coordinator metrics
pub fn gather_coordinator_metrics() -> String {
    let mut output = String::new();

    output.push_str(&standard::REGISTERED_RUNNERS.to_prometheus());
    output.push_str(&standard::ASSIGNED_SHARDS.to_prometheus());
    output.push_str(&standard::UNASSIGNED_SHARDS.to_prometheus());

    output.push_str(&standard::SHARD_MOVES.to_prometheus());
    output.push_str(&standard::TICK_FAILURES.to_prometheus());
    output.push_str(&standard::PARTIAL_GRANTS.to_prometheus());

    output.push_str(&standard::TICK_DURATION.to_prometheus());

    output
}

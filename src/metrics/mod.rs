//! Metrics for the request pipeline
//!
//! Counters, gauges, and timers are kept in a process-wide registry keyed by
//! dotted metric names, updated lock-free from hot paths. The request-complete
//! publisher derives the per-request timing metrics from the passport.

mod publisher;

pub use publisher::{BasicRequestMetricsPublisher, RequestMetricsPublisher};

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Well-known metric names
pub mod names {
    pub const TIMING_REQUEST_TOTAL: &str = "zuul.timings.request.total";
    pub const TIMING_REQUEST_PROXY: &str = "zuul.timings.request.proxy";
    pub const TIMING_REQUEST_INTERNAL: &str = "zuul.timings.request.internal";
    pub const TIMING_REQUEST_ADDED: &str = "zuul.timings.request.added";

    pub const FILTER_CONCURRENCY_CURRENT: &str = "zuul.filter.concurrency.current";
    pub const FILTER_CONCURRENCY_REJECTED: &str = "zuul.filter.concurrency.rejected";

    pub const CONNECTIONS_ACCEPTED: &str = "zuul.server.connections.accepted";
    pub const CONNECTIONS_ACTIVE: &str = "zuul.server.connections.active";
    pub const CONNECTIONS_THROTTLED: &str = "zuul.server.connections.throttled";

    pub const ORIGIN_ATTEMPTS: &str = "zuul.origin.attempts";
    pub const ORIGIN_RETRIES: &str = "zuul.origin.retries";
    pub const ORIGIN_CONNECT_FAILURES: &str = "zuul.origin.connect.failures";
}

#[derive(Debug, Default)]
struct TimerCell {
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl TimerCell {
    fn record(&self, ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }
}

/// Process-wide metric registry
///
/// Cloning is cheap and all clones share the same underlying values.
#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    counters: DashMap<String, Arc<AtomicU64>>,
    gauges: DashMap<String, Arc<AtomicI64>>,
    timers: DashMap<String, Arc<TimerCell>>,
}

impl MetricsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn counter_cell(&self, name: &str) -> Arc<AtomicU64> {
        if let Some(cell) = self.inner.counters.get(name) {
            return Arc::clone(&cell);
        }
        Arc::clone(
            &self
                .inner
                .counters
                .entry(name.to_string())
                .or_default(),
        )
    }

    fn gauge_cell(&self, name: &str) -> Arc<AtomicI64> {
        if let Some(cell) = self.inner.gauges.get(name) {
            return Arc::clone(&cell);
        }
        Arc::clone(&self.inner.gauges.entry(name.to_string()).or_default())
    }

    fn timer_cell(&self, name: &str) -> Arc<TimerCell> {
        if let Some(cell) = self.inner.timers.get(name) {
            return Arc::clone(&cell);
        }
        Arc::clone(&self.inner.timers.entry(name.to_string()).or_default())
    }

    #[inline]
    pub fn increment_counter(&self, name: &str) {
        self.add_to_counter(name, 1);
    }

    #[inline]
    pub fn add_to_counter(&self, name: &str, delta: u64) {
        self.counter_cell(name).fetch_add(delta, Ordering::Relaxed);
    }

    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.inner
            .counters
            .get(name)
            .map(|cell| cell.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    #[inline]
    pub fn set_gauge(&self, name: &str, value: i64) {
        self.gauge_cell(name).store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_to_gauge(&self, name: &str, delta: i64) {
        self.gauge_cell(name).fetch_add(delta, Ordering::Relaxed);
    }

    #[must_use]
    pub fn gauge(&self, name: &str) -> i64 {
        self.inner
            .gauges
            .get(name)
            .map(|cell| cell.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record one timed observation in milliseconds
    #[inline]
    pub fn record_timer(&self, name: &str, ms: u64) {
        self.timer_cell(name).record(ms);
    }

    #[must_use]
    pub fn timer(&self, name: &str) -> Option<TimerSnapshot> {
        self.inner.timers.get(name).map(|cell| TimerSnapshot {
            count: cell.count.load(Ordering::Relaxed),
            total_ms: cell.total_ms.load(Ordering::Relaxed),
            max_ms: cell.max_ms.load(Ordering::Relaxed),
        })
    }

    /// Consistent-enough point-in-time view, sorted by name for display
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .inner
            .counters
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        let gauges = self
            .inner
            .gauges
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        let timers = self
            .inner
            .timers
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    TimerSnapshot {
                        count: e.value().count.load(Ordering::Relaxed),
                        total_ms: e.value().total_ms.load(Ordering::Relaxed),
                        max_ms: e.value().max_ms.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            counters,
            gauges,
            timers,
        }
    }
}

/// Aggregate view of one timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSnapshot {
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

impl TimerSnapshot {
    #[must_use]
    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.count as f64
        }
    }
}

/// Point-in-time copy of every metric
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
    pub timers: BTreeMap<String, TimerSnapshot>,
}

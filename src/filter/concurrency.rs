//! Per-filter concurrency limiting
//!
//! Each (filter name, type) pair carries its own in-flight counter; the
//! limit and the protection flag are dynamic properties read at acquisition
//! time. A rejected acquisition leaves the counter untouched, so admitted
//! applications never exceed the limit.

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::DynamicProperties;
use crate::error::ProxyError;
use crate::filter::FilterType;
use crate::metrics::{names, MetricsRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FilterKey {
    name: String,
    filter_type: &'static str,
}

impl FilterKey {
    fn new(name: &str, filter_type: FilterType) -> Self {
        Self {
            name: name.to_string(),
            filter_type: filter_type.as_str(),
        }
    }
}

/// Tracks in-flight filter applications and enforces per-filter limits
#[derive(Debug, Default)]
pub struct ConcurrencyGuard {
    metrics: MetricsRegistry,
    current: DashMap<FilterKey, Arc<AtomicI64>>,
    rejections: DashMap<FilterKey, Arc<AtomicU64>>,
}

impl ConcurrencyGuard {
    #[must_use]
    pub fn new(metrics: MetricsRegistry) -> Self {
        Self {
            metrics,
            current: DashMap::new(),
            rejections: DashMap::new(),
        }
    }

    fn current_cell(&self, key: &FilterKey) -> Arc<AtomicI64> {
        if let Some(cell) = self.current.get(key) {
            return Arc::clone(&cell);
        }
        Arc::clone(&self.current.entry(key.clone()).or_default())
    }

    fn rejection_cell(&self, key: &FilterKey) -> Arc<AtomicU64> {
        if let Some(cell) = self.rejections.get(key) {
            return Arc::clone(&cell);
        }
        Arc::clone(&self.rejections.entry(key.clone()).or_default())
    }

    /// Admit one application of the filter, or reject at the limit
    ///
    /// The permit releases the slot on drop. When the protection flag is
    /// off, admission is unconditional but still counted.
    pub fn try_acquire(
        &self,
        name: &str,
        filter_type: FilterType,
        properties: &DynamicProperties,
    ) -> Result<ConcurrencyPermit, ProxyError> {
        let key = FilterKey::new(name, filter_type);
        let cell = self.current_cell(&key);
        let limit = properties.filter_concurrency_limit(name, filter_type.as_str());

        let previous = cell.fetch_add(1, Ordering::AcqRel);
        if properties.filter_concurrency_protect() && previous >= limit {
            cell.fetch_sub(1, Ordering::AcqRel);
            self.rejection_cell(&key).fetch_add(1, Ordering::Relaxed);
            self.metrics
                .increment_counter(names::FILTER_CONCURRENCY_REJECTED);
            return Err(ProxyError::FilterConcurrencyExceeded {
                filter: name.to_string(),
                limit,
            });
        }

        self.metrics.add_to_gauge(names::FILTER_CONCURRENCY_CURRENT, 1);
        Ok(ConcurrencyPermit {
            cell,
            metrics: self.metrics.clone(),
        })
    }

    /// In-flight applications of the filter right now
    #[must_use]
    pub fn current(&self, name: &str, filter_type: FilterType) -> i64 {
        self.current
            .get(&FilterKey::new(name, filter_type))
            .map(|cell| cell.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Rejections recorded for the filter since startup
    #[must_use]
    pub fn rejections(&self, name: &str, filter_type: FilterType) -> u64 {
        self.rejections
            .get(&FilterKey::new(name, filter_type))
            .map(|cell| cell.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// Releases the concurrency slot on drop
#[derive(Debug)]
pub struct ConcurrencyPermit {
    cell: Arc<AtomicI64>,
    metrics: MetricsRegistry,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.cell.fetch_sub(1, Ordering::AcqRel);
        self.metrics.add_to_gauge(names::FILTER_CONCURRENCY_CURRENT, -1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::keys;

    fn limited(properties: &DynamicProperties, name: &str, limit: i64) {
        properties.set_int(
            keys::filter_concurrency_limit(name, FilterType::Inbound.as_str()),
            limit,
        );
    }

    #[test]
    fn test_permit_releases_on_drop() {
        let guard = ConcurrencyGuard::new(MetricsRegistry::new());
        let properties = DynamicProperties::new();

        let permit = guard
            .try_acquire("Routes", FilterType::Inbound, &properties)
            .unwrap();
        assert_eq!(guard.current("Routes", FilterType::Inbound), 1);

        drop(permit);
        assert_eq!(guard.current("Routes", FilterType::Inbound), 0);
    }

    #[test]
    fn test_rejection_at_limit() {
        let metrics = MetricsRegistry::new();
        let guard = ConcurrencyGuard::new(metrics.clone());
        let properties = DynamicProperties::new();
        limited(&properties, "Slow", 1);

        let _held = guard
            .try_acquire("Slow", FilterType::Inbound, &properties)
            .unwrap();
        let rejected = guard.try_acquire("Slow", FilterType::Inbound, &properties);

        assert!(matches!(
            rejected,
            Err(ProxyError::FilterConcurrencyExceeded { limit: 1, .. })
        ));
        assert_eq!(guard.rejections("Slow", FilterType::Inbound), 1);
        assert_eq!(metrics.counter(names::FILTER_CONCURRENCY_REJECTED), 1);
        // The rejected attempt must not consume a slot
        assert_eq!(guard.current("Slow", FilterType::Inbound), 1);
    }

    #[test]
    fn test_slot_freed_after_rejection() {
        let guard = ConcurrencyGuard::new(MetricsRegistry::new());
        let properties = DynamicProperties::new();
        limited(&properties, "Slow", 1);

        let held = guard
            .try_acquire("Slow", FilterType::Inbound, &properties)
            .unwrap();
        assert!(guard.try_acquire("Slow", FilterType::Inbound, &properties).is_err());

        drop(held);
        assert!(guard.try_acquire("Slow", FilterType::Inbound, &properties).is_ok());
    }

    #[test]
    fn test_protection_disabled_admits_past_limit() {
        let guard = ConcurrencyGuard::new(MetricsRegistry::new());
        let properties = DynamicProperties::new();
        limited(&properties, "Slow", 1);
        properties.set_bool(keys::FILTER_CONCURRENCY_PROTECT, false);

        let _a = guard
            .try_acquire("Slow", FilterType::Inbound, &properties)
            .unwrap();
        let _b = guard
            .try_acquire("Slow", FilterType::Inbound, &properties)
            .unwrap();
        assert_eq!(guard.current("Slow", FilterType::Inbound), 2);
    }

    #[test]
    fn test_counters_are_per_filter_and_type() {
        let guard = ConcurrencyGuard::new(MetricsRegistry::new());
        let properties = DynamicProperties::new();

        let _a = guard
            .try_acquire("Routes", FilterType::Inbound, &properties)
            .unwrap();
        let _b = guard
            .try_acquire("Routes", FilterType::Outbound, &properties)
            .unwrap();

        assert_eq!(guard.current("Routes", FilterType::Inbound), 1);
        assert_eq!(guard.current("Routes", FilterType::Outbound), 1);
        assert_eq!(guard.current("Other", FilterType::Inbound), 0);
    }

    #[test]
    fn test_global_gauge_tracks_all_filters() {
        let metrics = MetricsRegistry::new();
        let guard = ConcurrencyGuard::new(metrics.clone());
        let properties = DynamicProperties::new();

        let a = guard
            .try_acquire("A", FilterType::Inbound, &properties)
            .unwrap();
        let b = guard
            .try_acquire("B", FilterType::Outbound, &properties)
            .unwrap();
        assert_eq!(metrics.gauge(names::FILTER_CONCURRENCY_CURRENT), 2);

        drop(a);
        drop(b);
        assert_eq!(metrics.gauge(names::FILTER_CONCURRENCY_CURRENT), 0);
    }
}

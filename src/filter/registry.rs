//! Filter registry with immutable sorted snapshots
//!
//! Registration swaps in a fresh snapshot with the chains pre-sorted by
//! (order, name), so the per-request path is a single atomic load with no
//! sorting and no locks. The version number changes on every mutation;
//! anything caching a snapshot can compare versions to notice staleness.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::filter::{Endpoint, ErrorFilter, Filter, FilterType, RequestFilter, ResponseFilter};

/// Immutable view of every registered filter
pub struct RegistrySnapshot {
    version: u64,
    inbound: Vec<Arc<dyn RequestFilter>>,
    outbound: Vec<Arc<dyn ResponseFilter>>,
    error: Vec<Arc<dyn ErrorFilter>>,
    endpoints: HashMap<String, Arc<dyn Endpoint>>,
}

impl RegistrySnapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            inbound: Vec::new(),
            outbound: Vec::new(),
            error: Vec::new(),
            endpoints: HashMap::new(),
        }
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Inbound chain, sorted by (order, name)
    #[must_use]
    pub fn inbound(&self) -> &[Arc<dyn RequestFilter>] {
        &self.inbound
    }

    /// Outbound chain, sorted by (order, name)
    #[must_use]
    pub fn outbound(&self) -> &[Arc<dyn ResponseFilter>] {
        &self.outbound
    }

    /// Error chain, sorted by (order, name)
    #[must_use]
    pub fn error(&self) -> &[Arc<dyn ErrorFilter>] {
        &self.error
    }

    #[must_use]
    pub fn endpoint(&self, name: &str) -> Option<Arc<dyn Endpoint>> {
        self.endpoints.get(name).cloned()
    }

    #[must_use]
    pub fn endpoint_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.endpoints.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inbound.len() + self.outbound.len() + self.error.len() + self.endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sorted<T: Filter + ?Sized>(mut filters: Vec<Arc<T>>) -> Vec<Arc<T>> {
    filters.sort_by(|a, b| {
        a.order()
            .cmp(&b.order())
            .then_with(|| a.name().cmp(b.name()))
    });
    filters
}

fn replace_by_name<T: Filter + ?Sized>(filters: &[Arc<T>], incoming: Arc<T>) -> Vec<Arc<T>> {
    let mut next: Vec<Arc<T>> = filters
        .iter()
        .filter(|f| f.name() != incoming.name())
        .cloned()
        .collect();
    next.push(incoming);
    sorted(next)
}

/// Shared registry of all filters; clones see the same filters
#[derive(Clone)]
pub struct FilterRegistry {
    snapshot: Arc<ArcSwap<RegistrySnapshot>>,
}

impl FilterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            snapshot: Arc::new(ArcSwap::from_pointee(RegistrySnapshot::empty())),
        }
    }

    /// Current snapshot; holds the chains alive for as long as it is kept
    #[must_use]
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.snapshot.load().version
    }

    pub fn register_inbound(&self, filter: Arc<dyn RequestFilter>) {
        check_declared_type(&*filter, FilterType::Inbound);
        info!(filter = filter.name(), order = filter.order(), "registering inbound filter");
        self.swap(|old| RegistrySnapshot {
            version: old.version + 1,
            inbound: replace_by_name(&old.inbound, Arc::clone(&filter)),
            outbound: old.outbound.clone(),
            error: old.error.clone(),
            endpoints: old.endpoints.clone(),
        });
    }

    pub fn register_outbound(&self, filter: Arc<dyn ResponseFilter>) {
        check_declared_type(&*filter, FilterType::Outbound);
        info!(filter = filter.name(), order = filter.order(), "registering outbound filter");
        self.swap(|old| RegistrySnapshot {
            version: old.version + 1,
            inbound: old.inbound.clone(),
            outbound: replace_by_name(&old.outbound, Arc::clone(&filter)),
            error: old.error.clone(),
            endpoints: old.endpoints.clone(),
        });
    }

    pub fn register_error(&self, filter: Arc<dyn ErrorFilter>) {
        check_declared_type(&*filter, FilterType::Error);
        info!(filter = filter.name(), order = filter.order(), "registering error filter");
        self.swap(|old| RegistrySnapshot {
            version: old.version + 1,
            inbound: old.inbound.clone(),
            outbound: old.outbound.clone(),
            error: replace_by_name(&old.error, Arc::clone(&filter)),
            endpoints: old.endpoints.clone(),
        });
    }

    pub fn register_endpoint(&self, filter: Arc<dyn Endpoint>) {
        check_declared_type(&*filter, FilterType::Endpoint);
        info!(filter = filter.name(), "registering endpoint");
        self.swap(|old| {
            let mut endpoints = old.endpoints.clone();
            endpoints.insert(filter.name().to_string(), Arc::clone(&filter));
            RegistrySnapshot {
                version: old.version + 1,
                inbound: old.inbound.clone(),
                outbound: old.outbound.clone(),
                error: old.error.clone(),
                endpoints,
            }
        });
    }

    /// Remove the named filter of the given type; true when something left
    pub fn remove(&self, name: &str, filter_type: FilterType) -> bool {
        let before = self.snapshot.load().len();
        self.swap(|old| {
            let mut next = RegistrySnapshot {
                version: old.version + 1,
                inbound: old.inbound.clone(),
                outbound: old.outbound.clone(),
                error: old.error.clone(),
                endpoints: old.endpoints.clone(),
            };
            match filter_type {
                FilterType::Inbound => next.inbound.retain(|f| f.name() != name),
                FilterType::Outbound => next.outbound.retain(|f| f.name() != name),
                FilterType::Error => next.error.retain(|f| f.name() != name),
                FilterType::Endpoint => {
                    next.endpoints.remove(name);
                }
            }
            next
        });
        self.snapshot.load().len() < before
    }

    fn swap(&self, build: impl Fn(&RegistrySnapshot) -> RegistrySnapshot) {
        self.snapshot.rcu(|old| build(old));
    }
}

fn check_declared_type<T: Filter + ?Sized>(filter: &T, expected: FilterType) {
    if filter.filter_type() != expected {
        warn!(
            filter = filter.name(),
            declared = %filter.filter_type(),
            registered_as = %expected,
            "filter declares a different type than the chain it was registered into"
        );
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//! Runtime-tunable properties read at request time
//!
//! Unlike the TOML file, which is parsed once at startup, these properties
//! are consulted on every decision point that uses them. The backing map is
//! swapped atomically so an operator update never blocks a request path:
//! readers load the current snapshot lock-free and writers publish a new map.
//!
//! Property names follow the long-established `zuul.*` key scheme so
//! existing property sources and dashboards keep working.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::constants::limits;

/// Well-known property keys
pub mod keys {
    /// Prefer epoll-specific socket options where the platform has them
    pub const SOCKET_EPOLL: &str = "zuul.server.netty.socket.epoll";
    /// Pick the least-loaded worker event-loop instead of round-robin
    pub const EVENTLOOPS_USE_LEASTCONNS: &str = "zuul.server.eventloops.use_leastconns";
    /// Hex-dump the PROXY protocol preamble when decoding it
    pub const DUMP_PROXY_PREAMBLE: &str = "zuul.haproxy.dump.bytebuf";
    /// Maximum buffered body size for any message
    pub const MESSAGE_BODY_MAX_SIZE: &str = "zuul.message.body.max.size";
    /// Maximum buffered body size for responses, overriding the message-wide cap
    pub const RESPONSE_BODY_MAX_SIZE: &str = "zuul.HttpResponseMessage.body.max.size";
    /// Master switch for per-filter concurrency protection
    pub const FILTER_CONCURRENCY_PROTECT: &str = "zuul.filter.concurrency.protect.enabled";

    /// Key disabling one filter: `zuul.<name>.<type>.disable`
    #[must_use]
    pub fn filter_disable(filter_name: &str, filter_type: &str) -> String {
        format!("zuul.{}.{}.disable", filter_name, filter_type)
    }

    /// Key capping one filter's concurrency: `zuul.<name>.<type>.concurrency.limit`
    #[must_use]
    pub fn filter_concurrency_limit(filter_name: &str, filter_type: &str) -> String {
        format!("zuul.{}.{}.concurrency.limit", filter_name, filter_type)
    }
}

/// A single property value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
}

/// Lock-free registry of runtime-tunable properties
///
/// One instance is shared (via `Arc`) between the server, every worker, and
/// the filter runtime. Tests construct their own instance, so flipping a
/// property in one test never leaks into another.
#[derive(Debug, Default)]
pub struct DynamicProperties {
    values: ArcSwap<HashMap<String, PropertyValue>>,
}

impl DynamicProperties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a boolean property, falling back to `default` when the key is
    /// absent or holds a non-boolean value
    #[must_use]
    pub fn bool_prop(&self, key: &str, default: bool) -> bool {
        match self.values.load().get(key) {
            Some(PropertyValue::Bool(v)) => *v,
            _ => default,
        }
    }

    /// Read an integer property, falling back to `default` when the key is
    /// absent or holds a non-integer value
    #[must_use]
    pub fn int_prop(&self, key: &str, default: i64) -> i64 {
        match self.values.load().get(key) {
            Some(PropertyValue::Int(v)) => *v,
            _ => default,
        }
    }

    /// Set a boolean property, publishing a new snapshot
    pub fn set_bool(&self, key: impl Into<String>, value: bool) {
        self.insert(key.into(), PropertyValue::Bool(value));
    }

    /// Set an integer property, publishing a new snapshot
    pub fn set_int(&self, key: impl Into<String>, value: i64) {
        self.insert(key.into(), PropertyValue::Int(value));
    }

    /// Remove a property so readers fall back to its default
    pub fn remove(&self, key: &str) {
        self.values.rcu(|map| {
            let mut next = HashMap::clone(map);
            next.remove(key);
            next
        });
    }

    fn insert(&self, key: String, value: PropertyValue) {
        self.values.rcu(|map| {
            let mut next = HashMap::clone(map);
            next.insert(key.clone(), value);
            next
        });
    }

    // Typed accessors for the well-known keys, with their documented defaults.

    /// Whether to apply epoll-specific socket options (Linux only)
    #[must_use]
    pub fn socket_epoll(&self) -> bool {
        self.bool_prop(keys::SOCKET_EPOLL, true)
    }

    /// Whether new connections go to the least-loaded worker instead of
    /// round-robin
    #[must_use]
    pub fn use_leastconns(&self) -> bool {
        self.bool_prop(keys::EVENTLOOPS_USE_LEASTCONNS, false)
    }

    /// Whether to hex-dump PROXY protocol preambles at decode time
    #[must_use]
    pub fn dump_proxy_preamble(&self) -> bool {
        self.bool_prop(keys::DUMP_PROXY_PREAMBLE, false)
    }

    /// Maximum buffered body size for request messages, in bytes
    #[must_use]
    pub fn body_max_size(&self) -> usize {
        let raw = self.int_prop(keys::MESSAGE_BODY_MAX_SIZE, limits::BODY_MAX_SIZE as i64);
        usize::try_from(raw).unwrap_or(limits::BODY_MAX_SIZE)
    }

    /// Maximum buffered body size for response messages, in bytes
    ///
    /// Falls back to the message-wide cap when unset.
    #[must_use]
    pub fn response_body_max_size(&self) -> usize {
        let raw = self.int_prop(keys::RESPONSE_BODY_MAX_SIZE, limits::BODY_MAX_SIZE as i64);
        usize::try_from(raw).unwrap_or(limits::BODY_MAX_SIZE)
    }

    /// Whether per-filter concurrency limits are enforced at all
    #[must_use]
    pub fn filter_concurrency_protect(&self) -> bool {
        self.bool_prop(keys::FILTER_CONCURRENCY_PROTECT, true)
    }

    /// Whether the named filter is currently disabled
    #[must_use]
    pub fn filter_disabled(&self, filter_name: &str, filter_type: &str) -> bool {
        self.bool_prop(&keys::filter_disable(filter_name, filter_type), false)
    }

    /// Concurrency cap for the named filter
    #[must_use]
    pub fn filter_concurrency_limit(&self, filter_name: &str, filter_type: &str) -> i64 {
        self.int_prop(
            &keys::filter_concurrency_limit(filter_name, filter_type),
            limits::FILTER_CONCURRENCY as i64,
        )
    }
}

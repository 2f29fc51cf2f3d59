//! Default values for configuration fields
//!
//! This module centralizes all default value functions used in serde
//! deserialization.

use crate::constants::{pool, timeout};
use crate::types::MaxConnections;
use std::time::Duration;

/// Default listen host (all interfaces)
#[inline]
pub fn listen_host() -> String {
    "0.0.0.0".to_string()
}

/// Default server name for listeners
#[inline]
pub fn server_name() -> String {
    "edge".to_string()
}

/// Default maximum pooled connections per origin server
#[inline]
pub fn max_connections_per_server() -> MaxConnections {
    MaxConnections::new(pool::DEFAULT_MAX_CONNECTIONS).expect("default pool size is non-zero")
}

/// Default total attempt budget per request (first try plus one retry)
#[inline]
pub fn max_retries() -> u32 {
    2
}

/// Default response statuses that consume a retry
#[inline]
pub fn retryable_statuses() -> Vec<u16> {
    vec![503]
}

/// Default connect timeout for origin servers
#[inline]
pub fn origin_connect_timeout() -> Duration {
    timeout::ORIGIN_CONNECT
}

/// Default read timeout while awaiting an origin response head
#[inline]
pub fn origin_read_timeout() -> Duration {
    timeout::ORIGIN_READ
}

/// Default overall per-request deadline
#[inline]
pub fn request_deadline() -> Duration {
    timeout::REQUEST_DEADLINE
}

/// Default shutdown drain window
#[inline]
pub fn shutdown_drain() -> Duration {
    timeout::SHUTDOWN_DRAIN
}

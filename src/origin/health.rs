//! Per-server health accounting
//!
//! Each server behind an origin keeps rolling counters fed by the origin's
//! request callbacks. Snapshots are cheap and lock-free.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Rolling counters for one origin server
#[derive(Debug, Default)]
pub struct ServerHealth {
    attempts: AtomicU64,
    successes: AtomicU64,
    connect_failures: AtomicU64,
    read_timeouts: AtomicU64,
}

impl ServerHealth {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_timeout(&self) {
        self.read_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> ServerHealthSnapshot {
        ServerHealthSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            read_timeouts: self.read_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of one server's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerHealthSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub connect_failures: u64,
    pub read_timeouts: u64,
}

impl fmt::Display for ServerHealthSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempts={} successes={} connect_failures={} read_timeouts={}",
            self.attempts, self.successes, self.connect_failures, self.read_timeouts
        )
    }
}

//! Constants used throughout the edge proxy
//!
//! This module centralizes magic numbers and default values
//! to improve maintainability and reduce duplication.

use std::time::Duration;

/// Buffer size constants
///
/// Sizes are chosen for HTTP edge workloads:
/// - Request heads are small (< 16KB in practice)
/// - Bodies stream through in chunks and are only buffered on demand
pub mod buffer {
    /// Read buffer for the inbound codec (16KB)
    /// Large enough to hold a full request head in one read for the
    /// common case, small enough to keep per-connection memory flat
    pub const READ_CHUNK: usize = 16 * 1024;

    /// Maximum accepted size of a request or response head (32KB)
    /// Heads larger than this are rejected before header parsing
    pub const HEAD_MAX: usize = 32 * 1024;

    /// Header slots handed to the head parser
    pub const MAX_HEADERS: usize = 100;

    /// Initial capacity for body accumulation when a filter buffers (8KB)
    pub const BODY_INITIAL: usize = 8192;

    /// Upper bound on bytes included in a decode-failure hex dump
    pub const DUMP_MAX: usize = 256;

    // Compile-time validation

    /// A full head must fit in the read path
    const _HEAD_FITS: () = assert!(HEAD_MAX >= READ_CHUNK, "HEAD_MAX must cover READ_CHUNK");
}

/// Default limits for dynamic properties
///
/// These are the fallbacks used when the property registry has no
/// override for a key; see `config::dynamic` for the key names.
pub mod limits {
    /// Default per-message body cap in bytes (25.6MB)
    pub const BODY_MAX_SIZE: usize = 25_600_000;

    /// Default per-filter concurrency limit
    pub const FILTER_CONCURRENCY: i64 = 4000;

    const _BODY_NONZERO: () = assert!(BODY_MAX_SIZE > 0, "body cap must be positive");
    const _CONC_NONZERO: () = assert!(FILTER_CONCURRENCY > 0, "concurrency limit must be positive");
}

/// Socket tuning constants
pub mod socket {
    /// TCP receive buffer for origin connections (1MB)
    pub const ORIGIN_RECV_BUFFER: usize = 1024 * 1024;

    /// TCP send buffer for origin connections (1MB)
    pub const ORIGIN_SEND_BUFFER: usize = 1024 * 1024;

    /// Listener accept backlog
    pub const ACCEPT_BACKLOG: i32 = 1024;
}

/// Timeout constants
pub mod timeout {
    use super::Duration;

    /// Default connect timeout for origin servers
    pub const ORIGIN_CONNECT: Duration = Duration::from_secs(10);

    /// Default read timeout while awaiting an origin response
    pub const ORIGIN_READ: Duration = Duration::from_secs(30);

    /// Default overall per-request deadline
    pub const REQUEST_DEADLINE: Duration = Duration::from_secs(60);

    /// Drain window granted to in-flight connections on shutdown
    pub const SHUTDOWN_DRAIN: Duration = Duration::from_secs(20);
}

/// Origin connection pool constants
pub mod pool {
    /// Default maximum pooled connections per origin server
    pub const DEFAULT_MAX_CONNECTIONS: usize = 32;

    /// Pool get timeout for acquiring a pooled connection
    pub const GET_TIMEOUT_SECS: u64 = 5;

    /// Buffer size for TCP peek during recycle health checks
    /// Only 1 byte needed to detect if the connection is readable/closed
    pub const TCP_PEEK_BUFFER_SIZE: usize = 1;
}

/// Worker pool constants
pub mod worker {
    /// Capacity of each worker's inbound hand-off channel
    /// Accepts queue here while the worker is busy; beyond this the
    /// acceptor applies backpressure rather than growing memory
    pub const HANDOFF_CAPACITY: usize = 1024;
}

#[cfg(test)]
#[allow(clippy::assertions_on_constants)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_relationships() {
        // A head must be parseable from buffered reads
        assert!(buffer::HEAD_MAX >= buffer::READ_CHUNK);
        assert!(buffer::BODY_INITIAL <= buffer::READ_CHUNK);
        assert!(buffer::DUMP_MAX < buffer::READ_CHUNK);
    }

    #[test]
    fn test_default_limits() {
        assert_eq!(limits::BODY_MAX_SIZE, 25_600_000);
        assert_eq!(limits::FILTER_CONCURRENCY, 4000);
    }

    #[test]
    fn test_timeouts() {
        // The overall deadline must cover at least one connect + read cycle
        assert!(timeout::REQUEST_DEADLINE >= timeout::ORIGIN_CONNECT);
        assert!(timeout::REQUEST_DEADLINE >= timeout::ORIGIN_READ);
        assert_eq!(timeout::SHUTDOWN_DRAIN, Duration::from_secs(20));
    }

    #[test]
    fn test_socket_buffers_symmetric() {
        assert_eq!(socket::ORIGIN_RECV_BUFFER, socket::ORIGIN_SEND_BUFFER);
    }
}

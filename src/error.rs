//! Error types for the edge proxy
//!
//! This module provides detailed error types for the request lifecycle,
//! making it easier to diagnose and handle different failure scenarios.

use std::fmt;
use std::time::Duration;

/// Errors that can occur while carrying a request through the proxy
#[derive(Debug)]
#[non_exhaustive]
pub enum ProxyError {
    /// Connection rejected by the global inbound-connection cap
    ConnectionThrottled { cap: usize },

    /// PROXY protocol preamble could not be decoded
    ProxyProtocolDecode { reason: String },

    /// Request head exceeded the configured maximum
    HeadTooLarge { limit: usize },

    /// Request head could not be parsed
    HttpParse { reason: String },

    /// Buffered body exceeded the configured maximum
    BodyTooLarge { limit: usize, observed: usize },

    /// Filter skipped because its concurrency limit was reached
    FilterConcurrencyExceeded { filter: String, limit: i64 },

    /// Uncaught failure inside a filter's apply
    FilterApplication {
        filter: String,
        source: anyhow::Error,
    },

    /// TCP connect to an origin server failed
    OriginConnectFailure {
        origin: String,
        host: String,
        port: u16,
        source: std::io::Error,
    },

    /// Origin did not produce a response head within the read timeout
    OriginReadTimeout { origin: String, after: Duration },

    /// I/O error while exchanging bytes with an origin
    OriginIo {
        origin: String,
        source: std::io::Error,
    },

    /// Origin connection pool exhausted
    PoolExhausted { origin: String, max_size: usize },

    /// Inbound channel closed before the response was written
    ClientCancelled,

    /// I/O error on the inbound channel
    IoError(std::io::Error),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionThrottled { cap } => {
                write!(f, "Inbound connection throttled (cap: {})", cap)
            }
            Self::ProxyProtocolDecode { reason } => {
                write!(f, "PROXY protocol decode failed: {}", reason)
            }
            Self::HeadTooLarge { limit } => {
                write!(f, "Request head exceeds {} bytes", limit)
            }
            Self::HttpParse { reason } => write!(f, "Malformed HTTP head: {}", reason),
            Self::BodyTooLarge { limit, observed } => {
                write!(f, "Body of {} bytes exceeds cap of {} bytes", observed, limit)
            }
            Self::FilterConcurrencyExceeded { filter, limit } => {
                write!(
                    f,
                    "Filter '{}' rejected at concurrency limit {}",
                    filter, limit
                )
            }
            Self::FilterApplication { filter, source } => {
                write!(f, "Filter '{}' failed: {}", filter, source)
            }
            Self::OriginConnectFailure {
                origin,
                host,
                port,
                source,
            } => {
                write!(
                    f,
                    "Failed to connect to origin '{}' at {}:{}: {}",
                    origin, host, port, source
                )
            }
            Self::OriginReadTimeout { origin, after } => {
                write!(
                    f,
                    "Origin '{}' did not respond within {:?}",
                    origin, after
                )
            }
            Self::OriginIo { origin, source } => {
                write!(f, "I/O error with origin '{}': {}", origin, source)
            }
            Self::PoolExhausted { origin, max_size } => {
                write!(
                    f,
                    "Connection pool exhausted for origin '{}' (max size: {})",
                    origin, max_size
                )
            }
            Self::ClientCancelled => write!(f, "Client closed the connection early"),
            Self::IoError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::FilterApplication { source, .. } => Some(source.as_ref()),
            Self::OriginConnectFailure { source, .. } => Some(source),
            Self::OriginIo { source, .. } => Some(source),
            Self::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl ProxyError {
    /// Check if another origin attempt may fix this error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OriginConnectFailure { .. }
                | Self::OriginReadTimeout { .. }
                | Self::OriginIo { .. }
                | Self::PoolExhausted { .. }
        )
    }

    /// Check if this is a client disconnection
    #[must_use]
    pub fn is_client_disconnect(&self) -> bool {
        match self {
            Self::ClientCancelled => true,
            Self::IoError(e) => {
                matches!(
                    e.kind(),
                    std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::UnexpectedEof
                )
            }
            _ => false,
        }
    }

    /// Status code of the synthesized response, if one is owed at all
    ///
    /// Pre-HTTP failures (throttle, PROXY decode) and client cancellation
    /// close the channel without a response and return None here.
    #[must_use]
    pub const fn response_status(&self) -> Option<u16> {
        match self {
            Self::HeadTooLarge { .. } => Some(431),
            Self::HttpParse { .. } => Some(400),
            Self::BodyTooLarge { .. } => Some(413),
            Self::FilterApplication { .. } => Some(500),
            Self::OriginConnectFailure { .. } | Self::OriginIo { .. } | Self::PoolExhausted { .. } => {
                Some(502)
            }
            Self::OriginReadTimeout { .. } => Some(504),
            Self::ConnectionThrottled { .. }
            | Self::ProxyProtocolDecode { .. }
            | Self::ClientCancelled => None,
            // Per-filter rejection falls back to the filter's default output
            Self::FilterConcurrencyExceeded { .. } => None,
            Self::IoError(_) => None,
        }
    }

    /// Short variant label used in attempt records and the complete log line
    #[must_use]
    pub const fn kind_label(&self) -> &'static str {
        match self {
            Self::ConnectionThrottled { .. } => "CONNECTION_THROTTLED",
            Self::ProxyProtocolDecode { .. } => "PROXY_PROTOCOL_DECODE",
            Self::HeadTooLarge { .. } => "HEAD_TOO_LARGE",
            Self::HttpParse { .. } => "HTTP_PARSE",
            Self::BodyTooLarge { .. } => "BODY_TOO_LARGE",
            Self::FilterConcurrencyExceeded { .. } => "FILTER_CONCURRENCY_EXCEEDED",
            Self::FilterApplication { .. } => "FILTER_APPLICATION",
            Self::OriginConnectFailure { .. } => "ORIGIN_CONNECT_FAILURE",
            Self::OriginReadTimeout { .. } => "ORIGIN_READ_TIMEOUT",
            Self::OriginIo { .. } => "ORIGIN_IO",
            Self::PoolExhausted { .. } => "POOL_EXHAUSTED",
            Self::ClientCancelled => "CLIENT_CANCELLED",
            Self::IoError(_) => "IO_ERROR",
        }
    }

    /// Get the appropriate log level for this error
    #[must_use]
    pub fn log_level(&self) -> tracing::Level {
        match self {
            // Client disconnects are normal churn
            Self::ClientCancelled => tracing::Level::DEBUG,
            Self::IoError(e) if e.kind() == std::io::ErrorKind::BrokenPipe => tracing::Level::DEBUG,
            Self::IoError(_) => tracing::Level::WARN,
            // Malformed input from untrusted peers is expected at the edge
            Self::ProxyProtocolDecode { .. } | Self::HttpParse { .. } | Self::HeadTooLarge { .. } => {
                tracing::Level::WARN
            }
            // A failing filter is a code defect
            Self::FilterApplication { .. } => tracing::Level::ERROR,
            // Origin trouble might be transient
            Self::OriginConnectFailure { .. }
            | Self::OriginReadTimeout { .. }
            | Self::OriginIo { .. }
            | Self::PoolExhausted { .. } => tracing::Level::WARN,
            _ => tracing::Level::WARN,
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err)
    }
}

// Note: no From<ProxyError> for anyhow::Error is needed;
// anyhow has a blanket impl for all std::error::Error types.

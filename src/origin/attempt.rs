//! Per-attempt records for the request-complete log
//!
//! Every try against an origin server appends one record to the context;
//! the request-complete log line serializes the whole list so a single
//! log entry shows how a request travelled through retries.

use std::fmt;
use std::time::Duration;

use crate::constants::timeout;
use crate::error::ProxyError;

/// One try against one origin server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestAttempt {
    attempt: u32,
    origin: String,
    host: String,
    port: u16,
    status: Option<u16>,
    duration_ms: u64,
    error: Option<String>,
    exception_type: Option<&'static str>,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl RequestAttempt {
    #[must_use]
    pub fn new(attempt: u32, origin: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            attempt,
            origin: origin.into(),
            host: host.into(),
            port,
            status: None,
            duration_ms: 0,
            error: None,
            exception_type: None,
            connect_timeout: timeout::ORIGIN_CONNECT,
            read_timeout: timeout::ORIGIN_READ,
        }
    }

    /// Record the timeouts in force for this attempt
    #[must_use]
    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn set_duration(&mut self, duration: Duration) {
        self.duration_ms = duration.as_millis() as u64;
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    #[must_use]
    pub fn exception_type(&self) -> Option<&'static str> {
        self.exception_type
    }

    /// Complete this attempt with the error that ended it
    pub fn record_error(&mut self, error: &ProxyError) {
        self.error = Some(error.to_string());
        self.exception_type = Some(error.kind_label());
    }
}

impl fmt::Display for RequestAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{attempt={}, origin={}, server={}:{}, ",
            self.attempt, self.origin, self.host, self.port
        )?;
        match self.status {
            Some(status) => write!(f, "status={status}, ")?,
            None => write!(f, "status=-, ")?,
        }
        write!(f, "duration={}ms", self.duration_ms)?;
        if let Some(exception) = self.exception_type {
            write!(f, ", exception={exception}")?;
        }
        if let Some(error) = &self.error {
            write!(f, ", error=\"{error}\"")?;
        }
        write!(
            f,
            ", connect_timeout={}ms, read_timeout={}ms}}",
            self.connect_timeout.as_millis(),
            self.read_timeout.as_millis()
        )
    }
}

/// Ordered log of every attempt one request made
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestAttempts {
    attempts: Vec<RequestAttempt>,
}

impl RequestAttempts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, attempt: RequestAttempt) {
        self.attempts.push(attempt);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn last_mut(&mut self) -> Option<&mut RequestAttempt> {
        self.attempts.last_mut()
    }

    #[must_use]
    pub fn last(&self) -> Option<&RequestAttempt> {
        self.attempts.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequestAttempt> {
        self.attempts.iter()
    }
}

impl fmt::Display for RequestAttempts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, attempt) in self.attempts.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{attempt}")?;
        }
        write!(f, "]")
    }
}

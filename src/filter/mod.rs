//! Filter runtime
//!
//! Requests pass through an ordered chain of inbound filters, one endpoint,
//! and an ordered chain of outbound filters; error filters produce a
//! response when any of that fails. Filters are registered in a shared
//! registry and consulted through immutable sorted snapshots.

pub mod chain;
pub mod concurrency;
pub mod registry;

pub use chain::{BodySource, BufferedBodySource, EmptyBodySource, FilterChainRunner};
pub use concurrency::{ConcurrencyGuard, ConcurrencyPermit};
pub use registry::{FilterRegistry, RegistrySnapshot};

use async_trait::async_trait;
use std::fmt;

use crate::message::{BodyChunk, HttpRequestMessage, HttpResponseMessage};

/// Endpoint used when no filter selected another one
pub const PROXY_ENDPOINT: &str = "ProxyEndpoint";

/// Result of one filter application
pub type FilterResult<T = ()> = anyhow::Result<T>;

/// Where in the pipeline a filter runs
///
/// The wire label (`as_str`) is the `<type>` segment of the per-filter
/// dynamic property keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterType {
    Inbound,
    Endpoint,
    Outbound,
    Error,
}

impl FilterType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Endpoint => "endpoint",
            Self::Outbound => "outbound",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a filter completes inline or may await
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSyncType {
    Sync,
    Async,
}

/// Identity and scheduling metadata common to every filter
///
/// The runner reads the per-filter disable and concurrency-limit properties
/// itself, keyed by `name` and `filter_type`, so implementations carry no
/// config plumbing.
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    /// Position in the chain; lower runs first, ties broken by name
    fn order(&self) -> i32;

    fn filter_type(&self) -> FilterType;

    fn sync_type(&self) -> FilterSyncType {
        FilterSyncType::Sync
    }

    /// Run even after a filter requested short-circuit
    fn override_stop_filter_processing(&self) -> bool {
        false
    }
}

/// Filter applied to the request before routing
#[async_trait]
pub trait RequestFilter: Filter {
    fn should_filter(&self, _request: &HttpRequestMessage) -> bool {
        true
    }

    /// Whether the whole body must be buffered before `apply`
    fn needs_body_buffered(&self, _request: &HttpRequestMessage) -> bool {
        false
    }

    async fn apply(&self, request: &mut HttpRequestMessage) -> FilterResult;

    /// Replacement input when `apply` fails or concurrency rejects
    ///
    /// None keeps the message as it stands.
    fn default_output(&self, _request: &HttpRequestMessage) -> Option<HttpRequestMessage> {
        None
    }

    /// Transform one body chunk in flight
    fn process_content_chunk(&self, _request: &HttpRequestMessage, chunk: BodyChunk) -> BodyChunk {
        chunk
    }
}

/// Filter applied to the response after routing
#[async_trait]
pub trait ResponseFilter: Filter {
    fn should_filter(&self, _response: &HttpResponseMessage) -> bool {
        true
    }

    fn needs_body_buffered(&self, _response: &HttpResponseMessage) -> bool {
        false
    }

    async fn apply(&self, response: &mut HttpResponseMessage) -> FilterResult;

    fn default_output(&self, _response: &HttpResponseMessage) -> Option<HttpResponseMessage> {
        None
    }

    fn process_content_chunk(
        &self,
        _response: &HttpResponseMessage,
        chunk: BodyChunk,
    ) -> BodyChunk {
        chunk
    }
}

/// What the endpoint hands back: a response head plus, when the endpoint
/// streams, the rest of the body still arriving from upstream
pub struct EndpointOutcome {
    pub response: HttpResponseMessage,
    pub remaining_body: Option<Box<dyn BodySource + Send>>,
}

impl EndpointOutcome {
    /// Outcome for a response whose body is fully present
    #[must_use]
    pub fn buffered(response: HttpResponseMessage) -> Self {
        Self {
            response,
            remaining_body: None,
        }
    }
}

impl fmt::Debug for EndpointOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointOutcome")
            .field("response", &self.response)
            .field("streaming", &self.remaining_body.is_some())
            .finish()
    }
}

/// Terminal stage that turns the request into a response
#[async_trait]
pub trait Endpoint: Filter {
    /// Whether the request body must be buffered before `apply`
    fn needs_body_buffered(&self, _request: &HttpRequestMessage) -> bool {
        false
    }

    async fn apply(&self, request: &mut HttpRequestMessage) -> FilterResult<EndpointOutcome>;
}

/// Produces a response after a pipeline failure
#[async_trait]
pub trait ErrorFilter: Filter {
    fn should_filter(&self, _request: &HttpRequestMessage) -> bool {
        true
    }

    async fn apply(&self, request: &mut HttpRequestMessage) -> FilterResult<HttpResponseMessage>;
}

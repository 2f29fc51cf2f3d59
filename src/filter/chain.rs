//! Chain execution over the registered filters
//!
//! The runner drives one side of the pipeline at a time: the inbound chain,
//! the endpoint, the outbound chain, and the error chain. Filter failures
//! never abort a chain; they substitute the filter's default output and the
//! request carries on. The only hard stops are body-cap violations and
//! errors from the wire itself.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use crate::error::ProxyError;
use crate::filter::{
    ConcurrencyGuard, EndpointOutcome, FilterRegistry, FilterType, RequestFilter, ResponseFilter,
    PROXY_ENDPOINT,
};
use crate::message::{
    BodyChunk, HttpMessage, HttpRequestMessage, HttpResponseMessage,
};
use crate::passport::PassportState;

/// Supplies body chunks as they arrive from the wire
#[async_trait]
pub trait BodySource: Send {
    /// Next chunk, or None when the body is exhausted
    async fn next_chunk(&mut self) -> Result<Option<BodyChunk>, ProxyError>;
}

/// Source for messages that have no further body
#[derive(Debug, Default)]
pub struct EmptyBodySource;

#[async_trait]
impl BodySource for EmptyBodySource {
    async fn next_chunk(&mut self) -> Result<Option<BodyChunk>, ProxyError> {
        Ok(None)
    }
}

/// Source over chunks already in memory
#[derive(Debug, Default)]
pub struct BufferedBodySource {
    chunks: VecDeque<BodyChunk>,
}

impl BufferedBodySource {
    #[must_use]
    pub fn new(chunks: Vec<BodyChunk>) -> Self {
        Self {
            chunks: chunks.into(),
        }
    }
}

#[async_trait]
impl BodySource for BufferedBodySource {
    async fn next_chunk(&mut self) -> Result<Option<BodyChunk>, ProxyError> {
        Ok(self.chunks.pop_front())
    }
}

/// Buffer the rest of a message's body from the source, within its cap
///
/// An advertised Content-Length beyond the cap fails before reading a
/// single byte.
pub async fn buffer_remaining_body<M: HttpMessage + Send>(
    message: &mut M,
    source: &mut (dyn BodySource + '_),
) -> Result<(), ProxyError> {
    let limit = message.max_body_size();
    if let Some(advertised) = message
        .headers()
        .first("content-length")
        .and_then(|v| v.parse::<usize>().ok())
    {
        if advertised > limit {
            return Err(ProxyError::BodyTooLarge {
                limit,
                observed: advertised,
            });
        }
    }

    while !message.has_complete_body() {
        match source.next_chunk().await? {
            Some(chunk) => {
                let observed = message.body_length() + chunk.len();
                if observed > limit {
                    return Err(ProxyError::BodyTooLarge { limit, observed });
                }
                message.buffer_body_chunk(chunk);
            }
            None => {
                message.finish_buffering_if_incomplete();
            }
        }
    }
    Ok(())
}

/// Executes filter chains against messages
#[derive(Clone)]
pub struct FilterChainRunner {
    registry: FilterRegistry,
    concurrency: Arc<ConcurrencyGuard>,
}

impl FilterChainRunner {
    #[must_use]
    pub fn new(registry: FilterRegistry, concurrency: Arc<ConcurrencyGuard>) -> Self {
        Self {
            registry,
            concurrency,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &FilterRegistry {
        &self.registry
    }

    /// Run the inbound chain over the request
    ///
    /// `source` supplies body chunks if some filter demands a buffered body.
    pub async fn run_inbound(
        &self,
        request: &mut HttpRequestMessage,
        source: &mut (dyn BodySource + '_),
    ) -> Result<(), ProxyError> {
        let snapshot = self.registry.snapshot();
        let context = Arc::clone(request.context());
        context.passport().add(PassportState::FiltersInboundStart);

        let result: Result<(), ProxyError> = async {
            for filter in snapshot.inbound() {
                if context.is_stop_filter_processing() && !filter.override_stop_filter_processing()
                {
                    trace!(filter = filter.name(), "skipped after short-circuit");
                    continue;
                }
                if context
                    .properties()
                    .filter_disabled(filter.name(), FilterType::Inbound.as_str())
                {
                    debug!(filter = filter.name(), "filter disabled by property");
                    continue;
                }
                if filter.needs_body_buffered(request) && !request.has_complete_body() {
                    buffer_remaining_body(request, source).await?;
                }
                if !filter.should_filter(request) {
                    continue;
                }

                let permit = match self.concurrency.try_acquire(
                    filter.name(),
                    FilterType::Inbound,
                    context.properties(),
                ) {
                    Ok(permit) => permit,
                    Err(rejection) => {
                        warn!(filter = filter.name(), %rejection, "inbound filter rejected");
                        if let Some(replacement) = filter.default_output(request) {
                            *request = replacement;
                        }
                        continue;
                    }
                };

                match filter.apply(request).await {
                    Ok(()) => {
                        if request.has_body() {
                            run_request_chunks_through(filter.as_ref(), request);
                        }
                    }
                    Err(failure) => {
                        error!(filter = filter.name(), error = %failure, "inbound filter failed");
                        context.record_filter_failure(filter.name(), failure.to_string());
                        if let Some(replacement) = filter.default_output(request) {
                            *request = replacement;
                        }
                    }
                }
                drop(permit);
            }
            Ok(())
        }
        .await;

        context.passport().add(PassportState::FiltersInboundEnd);
        result
    }

    /// Run the endpoint stage
    ///
    /// A response staged by a short-circuiting filter wins over any
    /// registered endpoint. Otherwise the endpoint selected in the context
    /// (or the proxy endpoint) is applied.
    pub async fn run_endpoint(
        &self,
        request: &mut HttpRequestMessage,
        source: &mut (dyn BodySource + '_),
    ) -> Result<EndpointOutcome, ProxyError> {
        let context = Arc::clone(request.context());

        if let Some(staged) = context.take_static_response() {
            debug!(status = staged.status, "synthesizing staged response");
            return Ok(EndpointOutcome::buffered(
                HttpResponseMessage::from_static_response(request, staged),
            ));
        }

        let name = context
            .endpoint()
            .unwrap_or_else(|| PROXY_ENDPOINT.to_string());
        let snapshot = self.registry.snapshot();
        let endpoint = snapshot
            .endpoint(&name)
            .ok_or_else(|| ProxyError::FilterApplication {
                filter: name.clone(),
                source: anyhow::anyhow!("endpoint '{name}' is not registered"),
            })?;

        if endpoint.needs_body_buffered(request) && !request.has_complete_body() {
            buffer_remaining_body(request, source).await?;
        }

        let _permit =
            self.concurrency
                .try_acquire(endpoint.name(), FilterType::Endpoint, context.properties())?;

        match endpoint.apply(request).await {
            Ok(outcome) => Ok(outcome),
            // Keep the original kind when the endpoint surfaced a ProxyError
            Err(failure) => Err(match failure.downcast::<ProxyError>() {
                Ok(proxy_error) => proxy_error,
                Err(other) => ProxyError::FilterApplication {
                    filter: name,
                    source: other,
                },
            }),
        }
    }

    /// Run the outbound chain over the response
    pub async fn run_outbound(
        &self,
        response: &mut HttpResponseMessage,
        source: &mut (dyn BodySource + '_),
    ) -> Result<(), ProxyError> {
        let snapshot = self.registry.snapshot();
        let context = Arc::clone(response.context());
        context.passport().add(PassportState::FiltersOutboundStart);

        let result: Result<(), ProxyError> = async {
            for filter in snapshot.outbound() {
                if context.is_stop_filter_processing() && !filter.override_stop_filter_processing()
                {
                    trace!(filter = filter.name(), "skipped after short-circuit");
                    continue;
                }
                if context
                    .properties()
                    .filter_disabled(filter.name(), FilterType::Outbound.as_str())
                {
                    debug!(filter = filter.name(), "filter disabled by property");
                    continue;
                }
                if filter.needs_body_buffered(response) && !response.has_complete_body() {
                    buffer_remaining_body(response, source).await?;
                }
                if !filter.should_filter(response) {
                    continue;
                }

                let permit = match self.concurrency.try_acquire(
                    filter.name(),
                    FilterType::Outbound,
                    context.properties(),
                ) {
                    Ok(permit) => permit,
                    Err(rejection) => {
                        warn!(filter = filter.name(), %rejection, "outbound filter rejected");
                        if let Some(replacement) = filter.default_output(response) {
                            *response = replacement;
                        }
                        continue;
                    }
                };

                match filter.apply(response).await {
                    Ok(()) => {
                        if response.has_body() {
                            run_response_chunks_through(filter.as_ref(), response);
                        }
                    }
                    Err(failure) => {
                        error!(filter = filter.name(), error = %failure, "outbound filter failed");
                        context.record_filter_failure(filter.name(), failure.to_string());
                        if let Some(replacement) = filter.default_output(response) {
                            *response = replacement;
                        }
                    }
                }
                drop(permit);
            }
            Ok(())
        }
        .await;

        context.passport().add(PassportState::FiltersOutboundEnd);
        result
    }

    /// Produce a response after a pipeline failure; never fails itself
    ///
    /// Error filters run in order until one produces a response. The
    /// short-circuit flag is deliberately ignored here: an aborted normal
    /// pipeline must not silence the error path.
    pub async fn run_error(&self, request: &mut HttpRequestMessage) -> HttpResponseMessage {
        let snapshot = self.registry.snapshot();
        let context = Arc::clone(request.context());

        for filter in snapshot.error() {
            if context
                .properties()
                .filter_disabled(filter.name(), FilterType::Error.as_str())
            {
                continue;
            }
            if !filter.should_filter(request) {
                continue;
            }
            let _permit = match self.concurrency.try_acquire(
                filter.name(),
                FilterType::Error,
                context.properties(),
            ) {
                Ok(permit) => permit,
                Err(rejection) => {
                    warn!(filter = filter.name(), %rejection, "error filter rejected");
                    continue;
                }
            };
            match filter.apply(request).await {
                Ok(response) => return response,
                Err(failure) => {
                    error!(filter = filter.name(), error = %failure, "error filter failed");
                    context.record_filter_failure(filter.name(), failure.to_string());
                }
            }
        }

        HttpResponseMessage::default_error_response(request)
    }

    /// Pass one streamed request chunk through every active inbound filter
    #[must_use]
    pub fn filter_request_chunk(
        &self,
        request: &HttpRequestMessage,
        mut chunk: BodyChunk,
    ) -> BodyChunk {
        let snapshot = self.registry.snapshot();
        for filter in snapshot.inbound() {
            if request
                .context()
                .properties()
                .filter_disabled(filter.name(), FilterType::Inbound.as_str())
            {
                continue;
            }
            chunk = filter.process_content_chunk(request, chunk);
        }
        chunk
    }

    /// Pass one streamed response chunk through every active outbound filter
    #[must_use]
    pub fn filter_response_chunk(
        &self,
        response: &HttpResponseMessage,
        mut chunk: BodyChunk,
    ) -> BodyChunk {
        let snapshot = self.registry.snapshot();
        for filter in snapshot.outbound() {
            if response
                .context()
                .properties()
                .filter_disabled(filter.name(), FilterType::Outbound.as_str())
            {
                continue;
            }
            chunk = filter.process_content_chunk(response, chunk);
        }
        chunk
    }
}

/// Push already-buffered chunks through the filter's chunk transform
///
/// The filter's output replaces the stored chunk; dropping the old one
/// releases its buffer.
fn run_request_chunks_through(filter: &dyn RequestFilter, request: &mut HttpRequestMessage) {
    let chunks = request.body_mut().take_chunks();
    if chunks.is_empty() {
        return;
    }
    let mut processed = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        processed.push(filter.process_content_chunk(request, chunk));
    }
    request.body_mut().restore_chunks(processed);
}

fn run_response_chunks_through(filter: &dyn ResponseFilter, response: &mut HttpResponseMessage) {
    let chunks = response.body_mut().take_chunks();
    if chunks.is_empty() {
        return;
    }
    let mut processed = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        processed.push(filter.process_content_chunk(response, chunk));
    }
    response.body_mut().restore_chunks(processed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::keys;
    use crate::filter::{Filter, FilterResult};
    use crate::message::test_support::new_test_context;
    use crate::message::{Headers, HttpQueryParams, SessionContext, StaticResponse};
    use crate::metrics::MetricsRegistry;
    use bytes::Bytes;
    use std::sync::Mutex;

    fn new_runner() -> FilterChainRunner {
        FilterChainRunner::new(
            FilterRegistry::new(),
            Arc::new(ConcurrencyGuard::new(MetricsRegistry::new())),
        )
    }

    fn new_request_with(context: Arc<SessionContext>) -> HttpRequestMessage {
        HttpRequestMessage::new(
            context,
            "HTTP/1.1",
            "GET",
            "/",
            HttpQueryParams::new(),
            Headers::new(),
            "203.0.113.9",
            "http",
            7001,
            "edge",
        )
    }

    fn new_request() -> HttpRequestMessage {
        new_request_with(new_test_context())
    }

    /// Inbound filter that appends its name to a shared log
    struct RecordingFilter {
        name: &'static str,
        order: i32,
        log: Arc<Mutex<Vec<&'static str>>>,
        override_stop: bool,
    }

    impl RecordingFilter {
        fn chained(
            name: &'static str,
            order: i32,
            log: &Arc<Mutex<Vec<&'static str>>>,
        ) -> Arc<dyn RequestFilter> {
            Arc::new(Self {
                name,
                order,
                log: Arc::clone(log),
                override_stop: false,
            })
        }
    }

    impl Filter for RecordingFilter {
        fn name(&self) -> &str {
            self.name
        }
        fn order(&self) -> i32 {
            self.order
        }
        fn filter_type(&self) -> FilterType {
            FilterType::Inbound
        }
        fn override_stop_filter_processing(&self) -> bool {
            self.override_stop
        }
    }

    #[async_trait]
    impl RequestFilter for RecordingFilter {
        async fn apply(&self, _request: &mut HttpRequestMessage) -> FilterResult {
            self.log.lock().unwrap().push(self.name);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_inbound_runs_in_order() {
        let runner = new_runner();
        let log = Arc::new(Mutex::new(Vec::new()));
        runner
            .registry()
            .register_inbound(RecordingFilter::chained("Second", 20, &log));
        runner
            .registry()
            .register_inbound(RecordingFilter::chained("First", 10, &log));

        let mut request = new_request();
        runner
            .run_inbound(&mut request, &mut EmptyBodySource)
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["First", "Second"]);
    }

    #[tokio::test]
    async fn test_inbound_records_passport_window() {
        let runner = new_runner();
        let mut request = new_request();
        runner
            .run_inbound(&mut request, &mut EmptyBodySource)
            .await
            .unwrap();

        let passport = Arc::clone(request.context().passport());
        assert!(passport.contains(PassportState::FiltersInboundStart));
        assert!(passport.contains(PassportState::FiltersInboundEnd));
    }

    /// Filter that short-circuits the chain
    struct StopFilter;

    impl Filter for StopFilter {
        fn name(&self) -> &str {
            "Stopper"
        }
        fn order(&self) -> i32 {
            5
        }
        fn filter_type(&self) -> FilterType {
            FilterType::Inbound
        }
    }

    #[async_trait]
    impl RequestFilter for StopFilter {
        async fn apply(&self, request: &mut HttpRequestMessage) -> FilterResult {
            request.context().set_stop_filter_processing(true);
            request
                .context()
                .set_static_response(StaticResponse::new(403, "denied"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_short_circuit_skips_rest_but_not_overrides() {
        let runner = new_runner();
        let log = Arc::new(Mutex::new(Vec::new()));
        runner.registry().register_inbound(Arc::new(StopFilter));
        runner
            .registry()
            .register_inbound(RecordingFilter::chained("Skipped", 10, &log));
        runner.registry().register_inbound(Arc::new(RecordingFilter {
            name: "RunsAnyway",
            order: 20,
            log: Arc::clone(&log),
            override_stop: true,
        }));

        let mut request = new_request();
        runner
            .run_inbound(&mut request, &mut EmptyBodySource)
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["RunsAnyway"]);
        assert!(request.context().is_stop_filter_processing());
    }

    #[tokio::test]
    async fn test_disabled_filter_is_skipped() {
        let runner = new_runner();
        let log = Arc::new(Mutex::new(Vec::new()));
        runner
            .registry()
            .register_inbound(RecordingFilter::chained("Disabled", 10, &log));
        runner
            .registry()
            .register_inbound(RecordingFilter::chained("Active", 20, &log));

        let context = new_test_context();
        context
            .properties()
            .set_bool(keys::filter_disable("Disabled", "inbound"), true);

        let mut request = new_request_with(context);
        runner
            .run_inbound(&mut request, &mut EmptyBodySource)
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["Active"]);
    }

    /// Filter that fails and substitutes a replacement request
    struct FailingFilter;

    impl Filter for FailingFilter {
        fn name(&self) -> &str {
            "Broken"
        }
        fn order(&self) -> i32 {
            10
        }
        fn filter_type(&self) -> FilterType {
            FilterType::Inbound
        }
    }

    #[async_trait]
    impl RequestFilter for FailingFilter {
        async fn apply(&self, _request: &mut HttpRequestMessage) -> FilterResult {
            anyhow::bail!("boom")
        }

        fn default_output(&self, request: &HttpRequestMessage) -> Option<HttpRequestMessage> {
            let mut replacement = request.clone_message();
            replacement.headers_mut().set("X-Fallback", "1");
            Some(replacement)
        }
    }

    #[tokio::test]
    async fn test_failure_substitutes_default_output_and_continues() {
        let runner = new_runner();
        let log = Arc::new(Mutex::new(Vec::new()));
        runner.registry().register_inbound(Arc::new(FailingFilter));
        runner
            .registry()
            .register_inbound(RecordingFilter::chained("After", 20, &log));

        let mut request = new_request();
        runner
            .run_inbound(&mut request, &mut EmptyBodySource)
            .await
            .unwrap();

        assert_eq!(request.headers().first("x-fallback"), Some("1"));
        assert_eq!(*log.lock().unwrap(), vec!["After"]);
        let failures = request.context().filter_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].filter, "Broken");
    }

    /// Filter that demands the body be buffered before it runs
    struct BufferingFilter {
        seen_complete: Arc<Mutex<Option<bool>>>,
    }

    impl Filter for BufferingFilter {
        fn name(&self) -> &str {
            "Buffering"
        }
        fn order(&self) -> i32 {
            10
        }
        fn filter_type(&self) -> FilterType {
            FilterType::Inbound
        }
    }

    #[async_trait]
    impl RequestFilter for BufferingFilter {
        fn needs_body_buffered(&self, _request: &HttpRequestMessage) -> bool {
            true
        }

        async fn apply(&self, request: &mut HttpRequestMessage) -> FilterResult {
            *self.seen_complete.lock().unwrap() = Some(request.has_complete_body());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_buffering_filter_suspends_until_body_complete() {
        let runner = new_runner();
        let seen = Arc::new(Mutex::new(None));
        runner.registry().register_inbound(Arc::new(BufferingFilter {
            seen_complete: Arc::clone(&seen),
        }));

        let mut request = new_request();
        let mut source = BufferedBodySource::new(vec![
            BodyChunk::new(Bytes::from_static(b"hello ")),
            BodyChunk::last(Bytes::from_static(b"world")),
        ]);
        runner.run_inbound(&mut request, &mut source).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), Some(true));
        assert_eq!(request.body_as_text().as_deref(), Some("hello world"));
    }

    #[tokio::test]
    async fn test_advertised_oversize_body_fails_before_reading() {
        let runner = new_runner();
        runner.registry().register_inbound(Arc::new(BufferingFilter {
            seen_complete: Arc::new(Mutex::new(None)),
        }));

        let context = new_test_context();
        context.properties().set_int(keys::MESSAGE_BODY_MAX_SIZE, 16);

        let mut request = new_request_with(context);
        request.headers_mut().set("Content-Length", "100000000");

        let outcome = runner
            .run_inbound(&mut request, &mut EmptyBodySource)
            .await;
        assert!(matches!(outcome, Err(ProxyError::BodyTooLarge { limit: 16, .. })));
    }

    #[tokio::test]
    async fn test_streamed_body_overflow_fails() {
        let runner = new_runner();
        runner.registry().register_inbound(Arc::new(BufferingFilter {
            seen_complete: Arc::new(Mutex::new(None)),
        }));

        let context = new_test_context();
        context.properties().set_int(keys::MESSAGE_BODY_MAX_SIZE, 4);

        let mut request = new_request_with(context);
        let mut source = BufferedBodySource::new(vec![
            BodyChunk::new(Bytes::from_static(b"toolong")),
        ]);
        let outcome = runner.run_inbound(&mut request, &mut source).await;
        assert!(matches!(outcome, Err(ProxyError::BodyTooLarge { .. })));
    }

    /// Filter that uppercases streamed chunks
    struct UppercaseFilter;

    impl Filter for UppercaseFilter {
        fn name(&self) -> &str {
            "Uppercase"
        }
        fn order(&self) -> i32 {
            10
        }
        fn filter_type(&self) -> FilterType {
            FilterType::Inbound
        }
    }

    #[async_trait]
    impl RequestFilter for UppercaseFilter {
        fn needs_body_buffered(&self, _request: &HttpRequestMessage) -> bool {
            true
        }

        async fn apply(&self, _request: &mut HttpRequestMessage) -> FilterResult {
            Ok(())
        }

        fn process_content_chunk(
            &self,
            _request: &HttpRequestMessage,
            chunk: BodyChunk,
        ) -> BodyChunk {
            let upper = Bytes::from(chunk.data().to_ascii_uppercase());
            if chunk.is_last() {
                BodyChunk::last(upper)
            } else {
                BodyChunk::new(upper)
            }
        }
    }

    #[tokio::test]
    async fn test_buffered_chunks_run_through_filter() {
        let runner = new_runner();
        runner.registry().register_inbound(Arc::new(UppercaseFilter));

        let mut request = new_request();
        let mut source = BufferedBodySource::new(vec![
            BodyChunk::new(Bytes::from_static(b"ab")),
            BodyChunk::last(Bytes::from_static(b"cd")),
        ]);
        runner.run_inbound(&mut request, &mut source).await.unwrap();

        assert_eq!(request.body_as_text().as_deref(), Some("ABCD"));
        assert!(request.has_complete_body());
    }

    #[tokio::test]
    async fn test_concurrency_rejection_uses_default_output() {
        let metrics = MetricsRegistry::new();
        let guard = Arc::new(ConcurrencyGuard::new(metrics.clone()));
        let runner = FilterChainRunner::new(FilterRegistry::new(), Arc::clone(&guard));
        let log = Arc::new(Mutex::new(Vec::new()));
        runner.registry().register_inbound(Arc::new(FailingFilter));
        runner
            .registry()
            .register_inbound(RecordingFilter::chained("After", 20, &log));

        let context = new_test_context();
        context
            .properties()
            .set_int(keys::filter_concurrency_limit("Broken", "inbound"), 0);

        let mut request = new_request_with(context);
        runner
            .run_inbound(&mut request, &mut EmptyBodySource)
            .await
            .unwrap();

        // Rejected, so apply never ran; the fallback output was taken
        assert_eq!(request.headers().first("x-fallback"), Some("1"));
        assert!(request.context().filter_failures().is_empty());
        assert_eq!(guard.rejections("Broken", FilterType::Inbound), 1);
        assert_eq!(*log.lock().unwrap(), vec!["After"]);
    }

    #[tokio::test]
    async fn test_staged_response_wins_over_endpoint() {
        let runner = new_runner();
        let mut request = new_request();
        request
            .context()
            .set_static_response(StaticResponse::new(418, "teapot"));

        let outcome = runner
            .run_endpoint(&mut request, &mut EmptyBodySource)
            .await
            .unwrap();
        assert_eq!(outcome.response.status(), 418);
        assert_eq!(outcome.response.body_as_text().as_deref(), Some("teapot"));
        assert!(outcome.remaining_body.is_none());
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_an_error() {
        let runner = new_runner();
        let mut request = new_request();
        let outcome = runner.run_endpoint(&mut request, &mut EmptyBodySource).await;
        assert!(matches!(
            outcome,
            Err(ProxyError::FilterApplication { .. })
        ));
    }

    /// Endpoint that surfaces a typed proxy error
    struct TimeoutEndpoint;

    impl Filter for TimeoutEndpoint {
        fn name(&self) -> &str {
            PROXY_ENDPOINT
        }
        fn order(&self) -> i32 {
            0
        }
        fn filter_type(&self) -> FilterType {
            FilterType::Endpoint
        }
    }

    #[async_trait]
    impl crate::filter::Endpoint for TimeoutEndpoint {
        async fn apply(&self, _request: &mut HttpRequestMessage) -> FilterResult<EndpointOutcome> {
            Err(ProxyError::OriginReadTimeout {
                origin: "api".into(),
                after: std::time::Duration::from_secs(45),
            }
            .into())
        }
    }

    #[tokio::test]
    async fn test_endpoint_proxy_error_keeps_its_kind() {
        let runner = new_runner();
        runner.registry().register_endpoint(Arc::new(TimeoutEndpoint));

        let mut request = new_request();
        let outcome = runner.run_endpoint(&mut request, &mut EmptyBodySource).await;
        assert!(matches!(
            outcome,
            Err(ProxyError::OriginReadTimeout { .. })
        ));
    }

    /// Error filter producing a fixed status
    struct StatusErrorFilter {
        status: u16,
        fail: bool,
    }

    impl Filter for StatusErrorFilter {
        fn name(&self) -> &str {
            "ErrorResponse"
        }
        fn order(&self) -> i32 {
            10
        }
        fn filter_type(&self) -> FilterType {
            FilterType::Error
        }
    }

    #[async_trait]
    impl crate::filter::ErrorFilter for StatusErrorFilter {
        async fn apply(&self, request: &mut HttpRequestMessage) -> FilterResult<HttpResponseMessage> {
            if self.fail {
                anyhow::bail!("cannot build response");
            }
            Ok(HttpResponseMessage::new(request, self.status))
        }
    }

    #[tokio::test]
    async fn test_error_chain_first_success_wins() {
        let runner = new_runner();
        runner.registry().register_error(Arc::new(StatusErrorFilter {
            status: 502,
            fail: false,
        }));

        let mut request = new_request();
        let response = runner.run_error(&mut request).await;
        assert_eq!(response.status(), 502);
    }

    #[tokio::test]
    async fn test_error_chain_falls_back_to_default_500() {
        let runner = new_runner();
        runner.registry().register_error(Arc::new(StatusErrorFilter {
            status: 502,
            fail: true,
        }));

        let mut request = new_request();
        let response = runner.run_error(&mut request).await;
        assert_eq!(response.status(), 500);
        assert_eq!(request.context().filter_failures().len(), 1);
    }

    #[tokio::test]
    async fn test_error_chain_ignores_stop_flag() {
        let runner = new_runner();
        runner.registry().register_error(Arc::new(StatusErrorFilter {
            status: 503,
            fail: false,
        }));

        let mut request = new_request();
        request.context().set_stop_filter_processing(true);
        let response = runner.run_error(&mut request).await;
        assert_eq!(response.status(), 503);
    }

    #[tokio::test]
    async fn test_streamed_chunk_passes_through_inbound_filters() {
        let runner = new_runner();
        runner.registry().register_inbound(Arc::new(UppercaseFilter));

        let request = new_request();
        let chunk = runner
            .filter_request_chunk(&request, BodyChunk::new(Bytes::from_static(b"abc")));
        assert_eq!(chunk.data().as_ref(), b"ABC");
    }
}

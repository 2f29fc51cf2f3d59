//! The proxying endpoint: forwards the request to its routed origin
//!
//! This is where the retry policy lives. A connect failure, a read
//! timeout, or a response status the origin marks retryable consumes one
//! attempt and moves on to the next server, until the attempt budget is
//! spent. Whatever was observed last, response or error, is what the
//! client gets.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::codec::{response_framing, BodyFraming, HttpDecoder, HttpEncoder};
use crate::constants::timeout;
use crate::error::ProxyError;
use crate::filter::{
    Endpoint, EndpointOutcome, Filter, FilterResult, FilterSyncType, FilterType, PROXY_ENDPOINT,
};
use crate::message::{BodyChunk, Headers, HttpMessage, HttpRequestMessage, HttpResponseMessage};
use crate::metrics::{names, MetricsRegistry};
use crate::origin::{Origin, OriginServer, RequestAttempt};
use crate::passport::PassportState;

/// Hop-by-hop headers never forwarded upstream
///
/// Transfer-Encoding is included because the outbound body is re-framed
/// with a Content-Length.
const HOP_BY_HOP: [&str; 4] = [
    "Connection",
    "Keep-Alive",
    "Proxy-Connection",
    "Transfer-Encoding",
];

/// Endpoint that proxies the request to the origin routed in the context
pub struct ProxyEndpoint {
    metrics: MetricsRegistry,
}

impl ProxyEndpoint {
    #[must_use]
    pub fn new(metrics: MetricsRegistry) -> Self {
        Self { metrics }
    }
}

impl Filter for ProxyEndpoint {
    fn name(&self) -> &str {
        PROXY_ENDPOINT
    }

    fn order(&self) -> i32 {
        0
    }

    fn filter_type(&self) -> FilterType {
        FilterType::Endpoint
    }

    fn sync_type(&self) -> FilterSyncType {
        FilterSyncType::Async
    }
}

#[async_trait]
impl Endpoint for ProxyEndpoint {
    /// The outbound request goes out with a Content-Length, so the whole
    /// body must be in hand before the first attempt
    fn needs_body_buffered(&self, _request: &HttpRequestMessage) -> bool {
        true
    }

    async fn apply(&self, request: &mut HttpRequestMessage) -> FilterResult<EndpointOutcome> {
        let context = Arc::clone(request.context());
        let origin = routed_origin(request)?;

        origin.on_request_execution_start(&context);
        let budget = origin.max_retries_for_request(&context).max(1);
        let mut attempt_number = 0u32;

        loop {
            attempt_number += 1;
            if attempt_number > 1 {
                context.passport().add(PassportState::OriginRetryAttempt);
                self.metrics.increment_counter(names::ORIGIN_RETRIES);
            }

            let Some(server) = origin.select_server() else {
                anyhow::bail!("origin '{}' has no servers", origin.name());
            };

            context.add_attempt(origin.new_request_attempt(attempt_number, &server));
            origin.on_request_start_with_server(&server);

            let started = Instant::now();
            match try_attempt(request, origin.as_ref(), &server).await {
                Ok(outcome) => {
                    let status = outcome.response.status();
                    let elapsed = started.elapsed();
                    context.update_last_attempt(|attempt| {
                        attempt.set_status(status);
                        attempt.set_duration(elapsed);
                    });

                    if origin.is_retryable_status(status) && attempt_number < budget {
                        debug!(
                            origin = %origin.name(),
                            server = %server,
                            status,
                            attempt = attempt_number,
                            "retryable status, moving to the next server"
                        );
                        continue;
                    }

                    origin.on_request_execution_success(&server);
                    origin.record_final_response(&outcome.response);
                    return Ok(outcome);
                }
                Err(error) => {
                    let elapsed = started.elapsed();
                    context.update_last_attempt(|attempt| {
                        attempt.set_duration(elapsed);
                        attempt.record_error(&error);
                    });
                    origin.on_request_exception_with_server(&server, &error);

                    if error.is_retryable() && attempt_number < budget {
                        warn!(
                            origin = %origin.name(),
                            server = %server,
                            attempt = attempt_number,
                            %error,
                            "origin attempt failed, retrying"
                        );
                        // Jittered backoff: 10-59ms spreads concurrent retries
                        let pause = Duration::from_millis(10 + rand::random::<u64>() % 50);
                        tokio::time::sleep(pause).await;
                        continue;
                    }

                    origin.on_request_execution_failed(&context);
                    origin.record_final_error(&context, &error);
                    return Err(error.into());
                }
            }
        }
    }
}

/// Look up the origin the routing stage picked for this request
fn routed_origin(request: &HttpRequestMessage) -> anyhow::Result<Arc<dyn Origin>> {
    let context = request.context();
    let name = context.routed_origin().ok_or_else(|| {
        anyhow::anyhow!(
            "no origin routed for {} {}",
            request.method(),
            request.path()
        )
    })?;
    let manager = context
        .origin_manager()
        .ok_or_else(|| anyhow::anyhow!("origin manager not attached to this session"))?;
    manager
        .get(&name)
        .ok_or_else(|| anyhow::anyhow!("routed origin '{name}' is not configured"))
}

/// One wire exchange against one server
///
/// Writes the full request, reads the response head under the attempt's
/// read timeout, and hands any remaining body back as a streaming source
/// that owns the pooled connection.
async fn try_attempt(
    request: &mut HttpRequestMessage,
    origin: &dyn Origin,
    server: &OriginServer,
) -> Result<EndpointOutcome, ProxyError> {
    let context = Arc::clone(request.context());

    let mut stream = origin.connect_to_origin(&context, server).await?;

    let body = request.body_bytes();
    let headers = outbound_headers(request, body.as_ref().map(bytes::Bytes::len));

    {
        let mut encoder = HttpEncoder::new(&mut stream);
        encoder
            .write_request_head(request.method(), &request.path_and_query(), &headers)
            .await
            .map_err(|e| origin_error(origin, e))?;
        context.passport().add(PassportState::OutReqHeadersSent);
        if let Some(body) = body {
            encoder
                .write_chunk(&BodyChunk::last(body), false)
                .await
                .map_err(|e| origin_error(origin, e))?;
        }
        encoder.flush().await.map_err(|e| origin_error(origin, e))?;
        context.passport().add(PassportState::OutReqLastContentSent);
    }

    let read_timeout = context
        .attempts()
        .last()
        .map_or(timeout::ORIGIN_READ, RequestAttempt::read_timeout);

    let mut decoder = HttpDecoder::new(stream);
    let head = match tokio::time::timeout(read_timeout, decoder.read_response_head()).await {
        Ok(Ok(head)) => head,
        Ok(Err(error)) => return Err(origin_error(origin, error)),
        Err(_elapsed) => {
            context.passport().add(PassportState::OriginChReadTimeout);
            return Err(ProxyError::OriginReadTimeout {
                origin: origin.name().as_str().to_string(),
                after: read_timeout,
            });
        }
    };
    context
        .passport()
        .add(PassportState::InRespHeadersReceived);

    let mut response = HttpResponseMessage::new(request, head.status);
    *response.headers_mut() = head.headers;
    response.store_inbound_response();

    if let Some(nanos) = server_reported_duration(response.headers()) {
        context.set_origin_reported_duration(nanos);
    }

    let framing = response_framing(request.method(), head.status, response.headers())
        .map_err(|e| origin_error(origin, e))?;

    if framing == BodyFraming::None {
        response.finish_buffering_if_incomplete();
        context
            .passport()
            .add(PassportState::InRespLastContentReceived);
        return Ok(EndpointOutcome::buffered(response));
    }

    Ok(EndpointOutcome {
        response,
        remaining_body: Some(Box::new(decoder.into_body_source(framing))),
    })
}

/// Compose the headers for the outbound request
///
/// Hop-by-hop headers are dropped. Content-Length is pinned to the
/// buffered body; without one, an inbound Content-Length can only have
/// announced an empty body, so it is pinned to zero.
fn outbound_headers(request: &HttpRequestMessage, body_len: Option<usize>) -> Headers {
    let mut headers = request.headers().clone();
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    match body_len {
        Some(len) => headers.set("Content-Length", len.to_string()),
        None if headers.contains("Content-Length") => headers.set("Content-Length", "0"),
        None => {}
    }
    headers
}

/// Attribute a wire error to the origin so the retry policy sees it
fn origin_error(origin: &dyn Origin, error: ProxyError) -> ProxyError {
    match error {
        ProxyError::IoError(source) => ProxyError::OriginIo {
            origin: origin.name().as_str().to_string(),
            source,
        },
        ProxyError::HttpParse { reason } => ProxyError::OriginIo {
            origin: origin.name().as_str().to_string(),
            source: io::Error::new(io::ErrorKind::InvalidData, reason),
        },
        other => other,
    }
}

/// Pull the duration the origin reported about itself, in nanoseconds
///
/// Reads the first `dur=` token of a Server-Timing header; the value is
/// milliseconds, possibly fractional.
fn server_reported_duration(headers: &Headers) -> Option<i64> {
    let value = headers.first("server-timing")?;
    for part in value.split([',', ';']) {
        if let Some(millis) = part.trim().strip_prefix("dur=") {
            let millis: f64 = millis.trim().parse().ok()?;
            if millis < 0.0 {
                return None;
            }
            return Some((millis * 1_000_000.0) as i64);
        }
    }
    None
}

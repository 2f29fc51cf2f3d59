//! Client-facing session loop
//!
//! One [`ClientSession`] serves every connection a listener accepts.
//! [`ClientSession::serve`] owns the channel: it reads the optional PROXY
//! preamble, then loops over requests, pushing each one through the
//! filter chains and writing back whatever comes out. Pipeline failures
//! downgrade to error responses while the wire still allows one, and
//! every request ends in the request-complete handler no matter how it
//! went.

mod complete;
mod decorate;

pub use complete::RequestCompleteHandler;
pub use decorate::{BodyCounters, ListenerBinding};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::codec::{
    prepare_response_framing, request_framing, BodyFraming, BodyReader, HttpDecoder, HttpEncoder,
    RequestHead,
};
use crate::config::DynamicProperties;
use crate::constants::{buffer, timeout};
use crate::error::ProxyError;
use crate::events::PipelineEvents;
use crate::filter::{BodySource, EmptyBodySource, EndpointOutcome, FilterChainRunner};
use crate::ingress::{hex_dump, ConnectionRecord, UntrustedHeaderStripper};
use crate::message::{
    BodyChunk, ErrorRecord, Headers, HttpMessage, HttpRequestMessage, HttpResponseMessage,
    SessionContext, StatusCategory,
};
use crate::metrics::MetricsRegistry;
use crate::origin::OriginManager;
use crate::passport::{CurrentPassport, PassportState};

/// Error kind recorded when the per-request deadline fires
const DEADLINE_ERROR_KIND: &str = "REQUEST_DEADLINE_EXCEEDED";

/// Drives the request lifecycle for every connection of one listener
pub struct ClientSession {
    chain: Arc<FilterChainRunner>,
    origins: Arc<OriginManager>,
    properties: Arc<DynamicProperties>,
    completion: RequestCompleteHandler,
    stripper: UntrustedHeaderStripper,
    listener: ListenerBinding,
    request_deadline: Duration,
}

impl ClientSession {
    pub fn new(
        chain: Arc<FilterChainRunner>,
        origins: Arc<OriginManager>,
        properties: Arc<DynamicProperties>,
        events: PipelineEvents,
        metrics: MetricsRegistry,
        stripper: UntrustedHeaderStripper,
        listener: ListenerBinding,
    ) -> Self {
        Self {
            chain,
            origins,
            properties,
            completion: RequestCompleteHandler::new(events, metrics),
            stripper,
            listener,
            request_deadline: timeout::REQUEST_DEADLINE,
        }
    }

    /// Replace the per-request overall deadline
    #[must_use]
    pub fn with_request_deadline(mut self, deadline: Duration) -> Self {
        self.request_deadline = deadline;
        self
    }

    #[must_use]
    pub fn listener(&self) -> &ListenerBinding {
        &self.listener
    }

    /// Serve every request arriving on one accepted channel
    ///
    /// Returns when the client goes away, a protocol error closes the
    /// channel, or drain is requested between requests. An undecodable
    /// PROXY preamble is the one failure surfaced to the caller: the
    /// channel closes without a response.
    pub async fn serve<S>(
        &self,
        stream: S,
        record: &mut ConnectionRecord,
        peer: SocketAddr,
        local: SocketAddr,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut decoder = HttpDecoder::new(read_half);
        let mut encoder = HttpEncoder::new(write_half);

        if self.listener.proxy_protocol {
            match decoder.read_proxy_preamble().await {
                Ok(Some(header)) => record.attribute_proxy_header(header),
                Ok(None) => {}
                Err(preamble_error) => {
                    if self.properties.dump_proxy_preamble() {
                        let seen = decoder.buffered();
                        let window = &seen[..seen.len().min(buffer::DUMP_MAX)];
                        warn!(
                            connection = %record.id(),
                            error = %preamble_error,
                            dump = %hex_dump(window),
                            "closing channel on undecodable PROXY preamble"
                        );
                    } else {
                        warn!(
                            connection = %record.id(),
                            error = %preamble_error,
                            "closing channel on undecodable PROXY preamble"
                        );
                    }
                    record.passport().add(PassportState::ServerChClose);
                    return Err(preamble_error);
                }
            }
        }
        record.attribute_socket(peer, local);

        loop {
            let head = tokio::select! {
                head = decoder.read_request_head() => head,
                _ = shutdown.recv() => {
                    debug!(connection = %record.id(), "drain requested, closing channel");
                    break;
                }
            };
            match head {
                Ok(Some(head)) => {
                    if !self
                        .handle_request(head, &mut decoder, &mut encoder, record)
                        .await
                    {
                        break;
                    }
                }
                Ok(None) => break,
                Err(head_error) => {
                    self.reject_malformed(&mut encoder, record, &head_error).await;
                    break;
                }
            }
        }

        record.passport().add(PassportState::ServerChClose);
        let _ = encoder.shutdown().await;
        Ok(())
    }

    /// Run one request through the chains and write the outcome
    ///
    /// Returns whether the channel can take another request: the client
    /// asked for keep-alive, the response went out cleanly, and the wire
    /// body was fully consumed.
    async fn handle_request<R, W>(
        &self,
        mut head: RequestHead,
        decoder: &mut HttpDecoder<R>,
        encoder: &mut HttpEncoder<W>,
        record: &mut ConnectionRecord,
    ) -> bool
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let passport = Arc::clone(record.passport());
        passport.add(PassportState::InReqHeadersReceived);

        let reuse = head.keep_alive();
        self.stripper.scrub_first_request(&mut head.headers, record);

        let framing = match request_framing(&head.headers) {
            Ok(framing) => framing,
            Err(framing_error) => {
                self.reject_malformed(encoder, record, &framing_error).await;
                return false;
            }
        };

        let (context, counters) =
            decorate::request_context(&self.properties, &self.origins, record);
        let mut request =
            decorate::build_request(Arc::clone(&context), head, record, &self.listener);
        request.store_inbound_request();
        record.mark_request_started();

        let reader = decoder
            .body_reader(framing)
            .with_counter(Arc::clone(&counters.request));
        let mut body = TrackedBody::new(reader, framing, Arc::clone(&passport));

        let deadline = self.request_deadline;
        let (status, alive) = match tokio::time::timeout(
            deadline,
            self.drive(&mut request, &mut body, encoder, &counters.response),
        )
        .await
        {
            Ok(Ok(status)) => (Some(status), true),
            Ok(Err(failure)) => {
                self.recover(&mut request, encoder, failure, &counters.response)
                    .await
            }
            Err(_elapsed) => {
                warn!(
                    uuid = %context.uuid().unwrap_or_else(Uuid::nil),
                    after = ?deadline,
                    "request ran over its deadline"
                );
                context.set_status_category(StatusCategory::FailureLocal);
                if context.error().is_none() {
                    context.record_error(ErrorRecord {
                        kind: DEADLINE_ERROR_KIND,
                        server: None,
                        attempt: attempt_number(&context),
                        message: format!("no response produced within {deadline:?}"),
                    });
                }
                let status = if passport.contains(PassportState::OutRespHeadersSent) {
                    None
                } else {
                    match write_bare_response(encoder, 504).await {
                        Ok(()) => {
                            passport.add(PassportState::OutRespHeadersSent);
                            passport.add(PassportState::OutRespLastContentSent);
                            Some(504)
                        }
                        Err(_) => None,
                    }
                };
                (status, false)
            }
        };

        let alive = alive && reuse && body.finished();
        self.completion.request_completed(&request, status);
        alive
    }

    /// Inbound chain, endpoint, outbound chain, then the wire
    async fn drive<R, W>(
        &self,
        request: &mut HttpRequestMessage,
        body: &mut TrackedBody<'_, R>,
        encoder: &mut HttpEncoder<W>,
        response_bytes: &AtomicU64,
    ) -> Result<u16, ProxyError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        self.chain.run_inbound(request, body).await?;
        let EndpointOutcome {
            mut response,
            remaining_body,
        } = self.chain.run_endpoint(request, body).await?;

        let mut upstream = remaining_body.unwrap_or_else(|| Box::new(EmptyBodySource));
        self.chain
            .run_outbound(&mut response, upstream.as_mut())
            .await?;
        self.write_response(encoder, &mut response, Some(upstream.as_mut()), response_bytes)
            .await?;
        Ok(response.status())
    }

    /// Turn a pipeline failure into the best response the wire still allows
    ///
    /// Error responses traverse the outbound chain like any other
    /// response; if that pass fails too, the error chain's product goes
    /// out as built.
    async fn recover<W>(
        &self,
        request: &mut HttpRequestMessage,
        encoder: &mut HttpEncoder<W>,
        failure: ProxyError,
        response_bytes: &AtomicU64,
    ) -> (Option<u16>, bool)
    where
        W: AsyncWrite + Unpin + Send,
    {
        let context = Arc::clone(request.context());
        let passport = Arc::clone(context.passport());
        let uuid = context.uuid().unwrap_or_else(Uuid::nil);

        if failure.is_client_disconnect() {
            context.set_cancelled();
            passport.add(PassportState::ClientCancelled);
            context.set_status_category(StatusCategory::FailureClientCancelled);
            debug!(%uuid, error = %failure, "client went away mid-request");
            return (None, false);
        }

        let level = failure.log_level();
        if level == tracing::Level::ERROR {
            error!(%uuid, error = %failure, "request pipeline failed");
        } else if level == tracing::Level::WARN {
            warn!(%uuid, error = %failure, "request pipeline failed");
        } else {
            debug!(%uuid, error = %failure, "request pipeline failed");
        }

        context.set_status_category(categorize(&failure));
        if context.error().is_none() {
            context.record_error(ErrorRecord {
                kind: failure.kind_label(),
                server: None,
                attempt: attempt_number(&context),
                message: failure.to_string(),
            });
        }

        // The head is already on the wire; nothing coherent can follow it
        if passport.contains(PassportState::OutRespHeadersSent) {
            return (None, false);
        }

        context.set_should_send_error_response(true);
        let mut response = self.chain.run_error(request).await;
        if response.status() == 500 && response.body_length() == 0 {
            if let Some(status) = failure.response_status() {
                response.set_status(status);
            }
        }

        let mut drained = EmptyBodySource;
        if let Err(outbound_failure) = self.chain.run_outbound(&mut response, &mut drained).await {
            warn!(%uuid, error = %outbound_failure, "outbound chain failed on error response");
        }

        match self
            .write_response(encoder, &mut response, None, response_bytes)
            .await
        {
            Ok(()) => (Some(response.status()), true),
            Err(write_failure) => {
                if write_failure.is_client_disconnect() {
                    context.set_cancelled();
                    passport.add(PassportState::ClientCancelled);
                    context.set_status_category(StatusCategory::FailureClientCancelled);
                }
                debug!(%uuid, error = %write_failure, "error response not written");
                (None, false)
            }
        }
    }

    /// Write one response, streaming any remaining body through the
    /// outbound chunk filters as it arrives from upstream
    async fn write_response<W>(
        &self,
        encoder: &mut HttpEncoder<W>,
        response: &mut HttpResponseMessage,
        source: Option<&mut (dyn BodySource + Send)>,
        response_bytes: &AtomicU64,
    ) -> Result<(), ProxyError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let passport = Arc::clone(response.context().passport());

        // A streaming body without a pinned length is re-framed chunked;
        // with one, the stream is relayed raw under that length.
        let streaming = source.is_some() && !response.has_complete_body();
        let chunked = if streaming {
            if response.headers().contains("content-length") {
                false
            } else {
                response.headers_mut().set("Transfer-Encoding", "chunked");
                true
            }
        } else {
            prepare_response_framing(response)
        };

        encoder
            .write_response_head(response.status(), response.headers())
            .await?;
        passport.add(PassportState::OutRespHeadersSent);

        let mut wrote_last = false;
        for chunk in response.body().chunks() {
            response_bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            wrote_last = wrote_last || chunk.is_last();
            encoder.write_chunk(chunk, chunked).await?;
        }

        if !wrote_last {
            if let Some(source) = source {
                loop {
                    let Some(chunk) = source.next_chunk().await? else {
                        break;
                    };
                    if !chunk.is_empty() {
                        passport.add(PassportState::InRespContentReceived);
                    }
                    let chunk = self.chain.filter_response_chunk(response, chunk);
                    if chunk.is_last() {
                        passport.add(PassportState::InRespLastContentReceived);
                    }
                    response_bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    encoder.write_chunk(&chunk, chunked).await?;
                    if chunk.is_last() {
                        wrote_last = true;
                        break;
                    }
                }
            }
        }

        if chunked && !wrote_last {
            encoder.write_chunk(&BodyChunk::empty_last(), chunked).await?;
        }
        encoder.flush().await?;
        passport.add(PassportState::OutRespLastContentSent);
        Ok(())
    }

    /// Reject a channel whose bytes never became a request
    ///
    /// No message exists at this point, so the chains are skipped and a
    /// bare close-delimited status goes out directly.
    async fn reject_malformed<W>(
        &self,
        encoder: &mut HttpEncoder<W>,
        record: &ConnectionRecord,
        failure: &ProxyError,
    ) where
        W: AsyncWrite + Unpin + Send,
    {
        if failure.is_client_disconnect() {
            debug!(connection = %record.id(), error = %failure, "channel closed before a full head");
            return;
        }
        record.passport().add(PassportState::InReqRejected);
        let status = failure.response_status().unwrap_or(400);
        warn!(connection = %record.id(), error = %failure, status, "rejecting malformed request");
        if let Err(write_failure) = write_bare_response(encoder, status).await {
            debug!(connection = %record.id(), error = %write_failure, "reject status not written");
        }
    }
}

/// Write a status-only close-delimited response
async fn write_bare_response<W>(encoder: &mut HttpEncoder<W>, status: u16) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut headers = Headers::new();
    headers.set("Content-Length", "0");
    headers.set("Connection", "close");
    encoder.write_response_head(status, &headers).await?;
    encoder.flush().await
}

/// Status category for a failure that ended the pipeline
fn categorize(failure: &ProxyError) -> StatusCategory {
    match failure {
        ProxyError::FilterConcurrencyExceeded { .. } => StatusCategory::FailureLocalThrottledFilter,
        ProxyError::OriginConnectFailure { .. }
        | ProxyError::OriginReadTimeout { .. }
        | ProxyError::OriginIo { .. }
        | ProxyError::PoolExhausted { .. } => StatusCategory::FailureOrigin,
        _ => StatusCategory::FailureLocal,
    }
}

/// Ordinal of the attempt a failure is pinned to, if any were made
fn attempt_number(context: &SessionContext) -> Option<u32> {
    u32::try_from(context.attempt_count())
        .ok()
        .filter(|count| *count > 0)
}

/// Client body reader that stamps passport states as chunks arrive
///
/// `finished` reports whether the wire body was fully consumed, which
/// gates keep-alive: unread body bytes would corrupt the next head.
struct TrackedBody<'a, S> {
    reader: BodyReader<'a, S>,
    passport: Arc<CurrentPassport>,
    finished: bool,
}

impl<'a, S: AsyncRead + Unpin + Send> TrackedBody<'a, S> {
    fn new(
        reader: BodyReader<'a, S>,
        framing: BodyFraming,
        passport: Arc<CurrentPassport>,
    ) -> Self {
        // A bodiless request is complete the moment its head is
        let finished = framing == BodyFraming::None;
        if finished {
            passport.add(PassportState::InReqLastContentReceived);
        }
        Self {
            reader,
            passport,
            finished,
        }
    }

    fn finished(&self) -> bool {
        self.finished
    }
}

#[async_trait]
impl<S: AsyncRead + Unpin + Send> BodySource for TrackedBody<'_, S> {
    async fn next_chunk(&mut self) -> Result<Option<BodyChunk>, ProxyError> {
        let chunk = self.reader.next_chunk().await?;
        if let Some(chunk) = &chunk {
            if !chunk.is_empty() {
                self.passport.add(PassportState::InReqContentReceived);
            }
            if chunk.is_last() {
                self.passport.add(PassportState::InReqLastContentReceived);
                self.finished = true;
            }
        }
        Ok(chunk)
    }
}

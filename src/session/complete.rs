//! Request-complete handling
//!
//! Runs once per request, after the last response byte went out or the
//! channel died trying. Settles the status category, publishes the
//! passport-derived timers, writes the access log line, and fires the
//! request-complete event when a response actually reached the wire.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::events::{PipelineEvent, PipelineEvents};
use crate::message::{HttpMessage, HttpRequestMessage, StatusCategory};
use crate::metrics::{BasicRequestMetricsPublisher, MetricsRegistry, RequestMetricsPublisher};
use crate::passport::PassportState;
use crate::types::ConnectionId;

pub struct RequestCompleteHandler {
    events: PipelineEvents,
    publisher: Arc<dyn RequestMetricsPublisher>,
}

impl RequestCompleteHandler {
    #[must_use]
    pub fn new(events: PipelineEvents, metrics: MetricsRegistry) -> Self {
        Self {
            events,
            publisher: Arc::new(BasicRequestMetricsPublisher::new(metrics)),
        }
    }

    /// `status` is what the client saw; None when the channel closed before
    /// any response head was written.
    pub fn request_completed(&self, request: &HttpRequestMessage, status: Option<u16>) {
        let context = request.context();
        if context.status_category().is_none() {
            context.set_status_category(StatusCategory::Success);
        }
        let category = context
            .status_category()
            .unwrap_or(StatusCategory::Success);

        self.publisher.collect_and_publish(request);

        let passport = context.passport();
        let duration_ms = passport
            .duration_between(
                PassportState::InReqHeadersReceived,
                PassportState::OutRespLastContentSent,
            )
            .map_or(0, |nanos| nanos / 1_000_000);

        info!(
            uuid = %context.uuid().unwrap_or_else(Uuid::nil),
            method = request.method(),
            uri = %request.path_and_query(),
            status = status.unwrap_or(0),
            category = category.as_str(),
            duration_ms,
            bytes_in = context.request_body_size().unwrap_or(0),
            bytes_out = context.response_body_size().unwrap_or(0),
            attempts = %context.attempts(),
            error = context.error().map_or("-", |record| record.kind),
            "request complete"
        );

        if let Some(status) = status {
            let connection = context.connection_id().unwrap_or_else(ConnectionId::new);
            self.events
                .fire(PipelineEvent::RequestComplete { connection, status });
        }
    }
}

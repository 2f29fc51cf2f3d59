//! Request-complete timing publication
//!
//! Once the last response byte is written (or the request dies), the
//! publisher turns the passport into the four request timers. Times are
//! truncated to whole milliseconds; a timing whose window never happened
//! records as zero and a negative difference is skipped outright.

use std::sync::Arc;
use tracing::trace;

use crate::message::{HttpMessage, HttpRequestMessage};
use crate::metrics::{names, MetricsRegistry};
use crate::passport::PassportState;

const NANOS_PER_MILLI: i64 = 1_000_000;

/// Publishes per-request metrics when a request finishes
pub trait RequestMetricsPublisher: Send + Sync {
    fn collect_and_publish(&self, request: &HttpRequestMessage);
}

/// Registry-backed publisher deriving timings from the passport
#[derive(Debug, Clone)]
pub struct BasicRequestMetricsPublisher {
    registry: MetricsRegistry,
}

impl BasicRequestMetricsPublisher {
    #[must_use]
    pub fn new(registry: MetricsRegistry) -> Self {
        Self { registry }
    }

    fn record(&self, name: &str, nanos: i64) {
        if nanos < 0 {
            trace!(metric = name, nanos, "skipping negative request timing");
            return;
        }
        self.registry.record_timer(name, (nanos / NANOS_PER_MILLI) as u64);
    }
}

impl RequestMetricsPublisher for BasicRequestMetricsPublisher {
    fn collect_and_publish(&self, request: &HttpRequestMessage) {
        let context = request.context();
        let passport = Arc::clone(context.passport());

        let total = passport
            .signed_duration_between(
                PassportState::InReqHeadersReceived,
                PassportState::OutRespLastContentSent,
            )
            .unwrap_or(0);
        // Requests that never reached an origin spend their whole life here
        let proxy = passport
            .signed_duration_between(
                PassportState::OriginConnAcquireStart,
                PassportState::InRespLastContentReceived,
            )
            .unwrap_or(0);

        self.record(names::TIMING_REQUEST_TOTAL, total);
        self.record(names::TIMING_REQUEST_PROXY, proxy);
        self.record(names::TIMING_REQUEST_INTERNAL, total - proxy);

        if let Some(origin_reported) = context.origin_reported_duration() {
            self.record(names::TIMING_REQUEST_ADDED, total - origin_reported);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DynamicProperties;
    use crate::message::{Headers, HttpQueryParams, SessionContext};
    use crate::passport::CurrentPassport;

    fn request_with_passport() -> HttpRequestMessage {
        let context = Arc::new(SessionContext::new(
            Arc::new(DynamicProperties::new()),
            Arc::new(CurrentPassport::new()),
        ));
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

    #[test]
    fn test_publishes_total_and_internal() {
        let registry = MetricsRegistry::new();
        let publisher = BasicRequestMetricsPublisher::new(registry.clone());

        let request = request_with_passport();
        let passport = Arc::clone(request.context().passport());
        passport.add(PassportState::InReqHeadersReceived);
        passport.add(PassportState::OutRespLastContentSent);

        publisher.collect_and_publish(&request);

        let total = registry.timer(names::TIMING_REQUEST_TOTAL).unwrap();
        assert_eq!(total.count, 1);
        // No origin contact: proxy window records zero, internal equals total
        let proxy = registry.timer(names::TIMING_REQUEST_PROXY).unwrap();
        assert_eq!(proxy.total_ms, 0);
        assert!(registry.timer(names::TIMING_REQUEST_INTERNAL).is_some());
    }

    #[test]
    fn test_added_requires_origin_reported_duration() {
        let registry = MetricsRegistry::new();
        let publisher = BasicRequestMetricsPublisher::new(registry.clone());

        let request = request_with_passport();
        let passport = Arc::clone(request.context().passport());
        passport.add(PassportState::InReqHeadersReceived);
        passport.add(PassportState::OutRespLastContentSent);

        publisher.collect_and_publish(&request);
        assert!(registry.timer(names::TIMING_REQUEST_ADDED).is_none());

        request.context().set_origin_reported_duration(0);
        publisher.collect_and_publish(&request);
        assert!(registry.timer(names::TIMING_REQUEST_ADDED).is_some());
    }

    #[test]
    fn test_negative_timing_is_skipped() {
        let registry = MetricsRegistry::new();
        let publisher = BasicRequestMetricsPublisher::new(registry.clone());

        let request = request_with_passport();
        let passport = Arc::clone(request.context().passport());
        passport.add(PassportState::InReqHeadersReceived);
        passport.add(PassportState::OutRespLastContentSent);
        // Origin claims more time than the whole request took
        request.context().set_origin_reported_duration(i64::MAX);

        publisher.collect_and_publish(&request);
        assert!(registry.timer(names::TIMING_REQUEST_ADDED).is_none());
    }

    #[test]
    fn test_milliseconds_are_truncated() {
        let registry = MetricsRegistry::new();
        let publisher = BasicRequestMetricsPublisher::new(registry.clone());
        publisher.record("example.timing", 1_999_999);

        let timer = registry.timer("example.timing").unwrap();
        assert_eq!(timer.total_ms, 1);
    }
}

//! Shared per-request session state
//!
//! One `SessionContext` is created per inbound request and shared (via
//! `Arc`) between the request message and its paired response message, so
//! both sides of the filter chain see the same flags, attempts log, and
//! passport. Well-known state lives in typed fields; rarely-used extension
//! state goes through a small `Any`-keyed side table.

use bytes::Bytes;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::config::DynamicProperties;
use crate::message::Headers;
use crate::origin::{OriginManager, RequestAttempt, RequestAttempts};
use crate::passport::CurrentPassport;
use crate::types::{ConnectionId, OriginName};

/// Coarse outcome of a finished request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCategory {
    Success,
    FailureLocal,
    FailureOrigin,
    FailureClientCancelled,
    FailureLocalThrottledFilter,
}

impl StatusCategory {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::FailureLocal => "FAILURE_LOCAL",
            Self::FailureOrigin => "FAILURE_ORIGIN",
            Self::FailureClientCancelled => "FAILURE_CLIENT_CANCELLED",
            Self::FailureLocalThrottledFilter => "FAILURE_LOCAL_THROTTLED_FILTER",
        }
    }
}

impl fmt::Display for StatusCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal error recorded into the context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub kind: &'static str,
    pub server: Option<String>,
    pub attempt: Option<u32>,
    pub message: String,
}

/// A filter failure swallowed by the chain runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterFailure {
    pub filter: String,
    pub message: String,
}

/// Response staged by a short-circuiting filter
///
/// Deliberately not a full response message: the endpoint stage synthesizes
/// the real response from this, with the request at hand.
#[derive(Debug, Clone)]
pub struct StaticResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl StaticResponse {
    #[must_use]
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: body.into(),
        }
    }
}

/// Session state shared by a request and its response
pub struct SessionContext {
    properties: Arc<DynamicProperties>,
    passport: Arc<CurrentPassport>,
    uuid: Mutex<Option<Uuid>>,
    connection_id: Mutex<Option<ConnectionId>>,
    stop_filter_processing: AtomicBool,
    should_send_error_response: AtomicBool,
    cancelled: AtomicBool,
    /// Origin-reported duration in nanoseconds; negative means unset
    origin_reported_duration: AtomicI64,
    /// Status the origin answered with; negative means unset
    origin_status: AtomicI64,
    status_category: Mutex<Option<StatusCategory>>,
    endpoint: Mutex<Option<String>>,
    routed_origin: Mutex<Option<OriginName>>,
    origin_manager: Mutex<Option<Arc<OriginManager>>>,
    attempts: Mutex<RequestAttempts>,
    req_body_size: Mutex<Option<Arc<std::sync::atomic::AtomicU64>>>,
    resp_body_size: Mutex<Option<Arc<std::sync::atomic::AtomicU64>>>,
    static_response: Mutex<Option<StaticResponse>>,
    error: Mutex<Option<ErrorRecord>>,
    filter_failures: Mutex<Vec<FilterFailure>>,
    extensions: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl SessionContext {
    #[must_use]
    pub fn new(properties: Arc<DynamicProperties>, passport: Arc<CurrentPassport>) -> Self {
        Self {
            properties,
            passport,
            uuid: Mutex::new(None),
            connection_id: Mutex::new(None),
            stop_filter_processing: AtomicBool::new(false),
            should_send_error_response: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            origin_reported_duration: AtomicI64::new(-1),
            origin_status: AtomicI64::new(-1),
            status_category: Mutex::new(None),
            endpoint: Mutex::new(None),
            routed_origin: Mutex::new(None),
            origin_manager: Mutex::new(None),
            attempts: Mutex::new(RequestAttempts::new()),
            req_body_size: Mutex::new(None),
            resp_body_size: Mutex::new(None),
            static_response: Mutex::new(None),
            error: Mutex::new(None),
            filter_failures: Mutex::new(Vec::new()),
            extensions: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn properties(&self) -> &Arc<DynamicProperties> {
        &self.properties
    }

    #[must_use]
    pub fn passport(&self) -> &Arc<CurrentPassport> {
        &self.passport
    }

    pub fn set_uuid(&self, uuid: Uuid) {
        if let Ok(mut slot) = self.uuid.lock() {
            *slot = Some(uuid);
        }
    }

    #[must_use]
    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid.lock().ok().and_then(|slot| *slot)
    }

    /// Inbound connection this request arrived on
    pub fn set_connection_id(&self, id: ConnectionId) {
        if let Ok(mut slot) = self.connection_id.lock() {
            *slot = Some(id);
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id.lock().ok().and_then(|slot| *slot)
    }

    /// Whether a filter requested short-circuit of the remaining chain
    #[must_use]
    pub fn is_stop_filter_processing(&self) -> bool {
        self.stop_filter_processing.load(Ordering::Acquire)
    }

    pub fn set_stop_filter_processing(&self, stop: bool) {
        self.stop_filter_processing.store(stop, Ordering::Release);
    }

    #[must_use]
    pub fn should_send_error_response(&self) -> bool {
        self.should_send_error_response.load(Ordering::Acquire)
    }

    pub fn set_should_send_error_response(&self, v: bool) {
        self.should_send_error_response.store(v, Ordering::Release);
    }

    /// Whether the inbound channel went away before the response was written
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn set_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Duration the origin claims it spent, if it reported one
    #[must_use]
    pub fn origin_reported_duration(&self) -> Option<i64> {
        let nanos = self.origin_reported_duration.load(Ordering::Acquire);
        (nanos >= 0).then_some(nanos)
    }

    pub fn set_origin_reported_duration(&self, nanos: i64) {
        self.origin_reported_duration.store(nanos, Ordering::Release);
    }

    /// Status the origin answered with, before outbound filters ran
    #[must_use]
    pub fn origin_status(&self) -> Option<u16> {
        u16::try_from(self.origin_status.load(Ordering::Acquire)).ok()
    }

    pub fn set_origin_status(&self, status: u16) {
        self.origin_status.store(i64::from(status), Ordering::Release);
    }

    #[must_use]
    pub fn status_category(&self) -> Option<StatusCategory> {
        self.status_category.lock().ok().and_then(|slot| *slot)
    }

    /// Record the request outcome; the last writer wins
    pub fn set_status_category(&self, category: StatusCategory) {
        if let Ok(mut slot) = self.status_category.lock() {
            *slot = Some(category);
        }
    }

    /// Name of the endpoint filter selected for this request
    #[must_use]
    pub fn endpoint(&self) -> Option<String> {
        self.endpoint.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn set_endpoint(&self, name: impl Into<String>) {
        if let Ok(mut slot) = self.endpoint.lock() {
            *slot = Some(name.into());
        }
    }

    #[must_use]
    pub fn routed_origin(&self) -> Option<OriginName> {
        self.routed_origin.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn set_routed_origin(&self, origin: OriginName) {
        if let Ok(mut slot) = self.routed_origin.lock() {
            *slot = Some(origin);
        }
    }

    #[must_use]
    pub fn origin_manager(&self) -> Option<Arc<OriginManager>> {
        self.origin_manager.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn set_origin_manager(&self, manager: Arc<OriginManager>) {
        if let Ok(mut slot) = self.origin_manager.lock() {
            *slot = Some(manager);
        }
    }

    /// Append one origin attempt record
    pub fn add_attempt(&self, attempt: RequestAttempt) {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.add(attempt);
        }
    }

    /// Mutate the most recent attempt (to complete it with status/error)
    pub fn update_last_attempt(&self, update: impl FnOnce(&mut RequestAttempt)) {
        if let Ok(mut attempts) = self.attempts.lock() {
            if let Some(last) = attempts.last_mut() {
                update(last);
            }
        }
    }

    #[must_use]
    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().map(|a| a.len()).unwrap_or(0)
    }

    /// Copy of the attempts log
    #[must_use]
    pub fn attempts(&self) -> RequestAttempts {
        self.attempts
            .lock()
            .map(|a| a.clone())
            .unwrap_or_else(|_| RequestAttempts::new())
    }

    /// Bind the codec layer's running byte counters
    pub fn bind_body_size_providers(
        &self,
        request: Arc<std::sync::atomic::AtomicU64>,
        response: Arc<std::sync::atomic::AtomicU64>,
    ) {
        if let Ok(mut slot) = self.req_body_size.lock() {
            *slot = Some(request);
        }
        if let Ok(mut slot) = self.resp_body_size.lock() {
            *slot = Some(response);
        }
    }

    /// Bytes of request body seen by the codec so far
    #[must_use]
    pub fn request_body_size(&self) -> Option<u64> {
        self.req_body_size
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|c| c.load(Ordering::Relaxed)))
    }

    /// Bytes of response body written so far
    #[must_use]
    pub fn response_body_size(&self) -> Option<u64> {
        self.resp_body_size
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|c| c.load(Ordering::Relaxed)))
    }

    /// Stage a response for the endpoint stage to synthesize
    pub fn set_static_response(&self, response: StaticResponse) {
        if let Ok(mut slot) = self.static_response.lock() {
            *slot = Some(response);
        }
    }

    #[must_use]
    pub fn has_static_response(&self) -> bool {
        self.static_response
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Consume the staged response, if any
    #[must_use]
    pub fn take_static_response(&self) -> Option<StaticResponse> {
        self.static_response.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Record a terminal error; the last observed error wins
    pub fn record_error(&self, record: ErrorRecord) {
        if let Ok(mut slot) = self.error.lock() {
            *slot = Some(record);
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<ErrorRecord> {
        self.error.lock().ok().and_then(|slot| slot.clone())
    }

    /// Record a filter failure the chain recovered from
    pub fn record_filter_failure(&self, filter: impl Into<String>, message: impl Into<String>) {
        if let Ok(mut failures) = self.filter_failures.lock() {
            failures.push(FilterFailure {
                filter: filter.into(),
                message: message.into(),
            });
        }
    }

    #[must_use]
    pub fn filter_failures(&self) -> Vec<FilterFailure> {
        self.filter_failures
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default()
    }

    /// Store an extension value under a user-chosen key
    pub fn set_ext<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        if let Ok(mut ext) = self.extensions.lock() {
            ext.insert(key.into(), Arc::new(value));
        }
    }

    /// Fetch a typed extension value; None when absent or of another type
    #[must_use]
    pub fn get_ext<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.extensions.lock().ok()?.get(key)?.clone();
        value.downcast::<T>().ok()
    }

    /// Decoupled copy for message cloning
    ///
    /// Scalar state is copied by value; the passport, origin manager, byte
    /// counters, and extension values stay shared (they are channel-scoped).
    #[must_use]
    pub fn deep_clone(&self) -> Self {
        let copy = Self::new(Arc::clone(&self.properties), Arc::clone(&self.passport));
        if let Some(uuid) = self.uuid() {
            copy.set_uuid(uuid);
        }
        if let Some(id) = self.connection_id() {
            copy.set_connection_id(id);
        }
        copy.stop_filter_processing
            .store(self.is_stop_filter_processing(), Ordering::Relaxed);
        copy.should_send_error_response
            .store(self.should_send_error_response(), Ordering::Relaxed);
        copy.cancelled.store(self.is_cancelled(), Ordering::Relaxed);
        copy.origin_reported_duration.store(
            self.origin_reported_duration.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        copy.origin_status
            .store(self.origin_status.load(Ordering::Relaxed), Ordering::Relaxed);
        if let Some(category) = self.status_category() {
            copy.set_status_category(category);
        }
        if let Some(endpoint) = self.endpoint() {
            copy.set_endpoint(endpoint);
        }
        if let Some(origin) = self.routed_origin() {
            copy.set_routed_origin(origin);
        }
        if let Some(manager) = self.origin_manager() {
            copy.set_origin_manager(manager);
        }
        if let Ok(mut attempts) = copy.attempts.lock() {
            *attempts = self.attempts();
        }
        if let (Ok(req), Ok(resp)) = (self.req_body_size.lock(), self.resp_body_size.lock()) {
            if let (Some(req), Some(resp)) = (req.as_ref(), resp.as_ref()) {
                copy.bind_body_size_providers(Arc::clone(req), Arc::clone(resp));
            }
        }
        if let (Ok(src), Ok(mut dst)) = (self.static_response.lock(), copy.static_response.lock())
        {
            dst.clone_from(&src);
        }
        if let Some(error) = self.error() {
            copy.record_error(error);
        }
        if let (Ok(src), Ok(mut dst)) = (self.filter_failures.lock(), copy.filter_failures.lock())
        {
            dst.clone_from(&src);
        }
        if let (Ok(src), Ok(mut dst)) = (self.extensions.lock(), copy.extensions.lock()) {
            dst.clone_from(&src);
        }
        copy
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("uuid", &self.uuid())
            .field("stop_filter_processing", &self.is_stop_filter_processing())
            .field("cancelled", &self.is_cancelled())
            .field("status_category", &self.status_category())
            .field("routed_origin", &self.routed_origin())
            .field("attempts", &self.attempt_count())
            .finish_non_exhaustive()
    }
}

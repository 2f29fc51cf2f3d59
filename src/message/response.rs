//! Response message, snapshots, and Set-Cookie handling
//!
//! A response is always created against a request: it captures a snapshot of
//! the request as it stood at creation (the outbound request) plus the
//! as-received snapshot taken before the inbound chain ran. When the origin's
//! response arrives, `store_inbound_response` freezes it before the outbound
//! filters get to mutate anything.

use bytes::Bytes;
use cookie::Cookie;
use std::sync::Arc;
use tracing::debug;

use crate::message::{
    Body, Headers, HttpMessage, HttpRequestInfo, HttpRequestMessage, Message, SessionContext,
    StaticResponse,
};

const SET_COOKIE: &str = "Set-Cookie";

/// Mutable response flowing through the outbound filter chain
#[derive(Debug)]
pub struct HttpResponseMessage {
    message: Message,
    status: u16,
    outbound_request: Arc<HttpRequestInfo>,
    inbound_request: Option<Arc<HttpRequestInfo>>,
    inbound_response: Option<Arc<HttpResponseInfo>>,
}

impl HttpResponseMessage {
    /// Create a response paired with the given request
    ///
    /// The request is snapshotted here, so the response always reflects the
    /// request as it stood when the response came into existence.
    #[must_use]
    pub fn new(request: &HttpRequestMessage, status: u16) -> Self {
        Self {
            message: Message::new(Arc::clone(request.context()), Headers::new()),
            status,
            outbound_request: Arc::new(request.snapshot()),
            inbound_request: request.inbound_request().cloned(),
            inbound_response: None,
        }
    }

    /// Synthesize a response from a short-circuiting filter's staged output
    #[must_use]
    pub fn from_static_response(request: &HttpRequestMessage, staged: StaticResponse) -> Self {
        let mut response = Self::new(request, staged.status);
        for header in staged.headers.iter() {
            response
                .headers_mut()
                .add(header.name().to_string(), header.value().to_string());
        }
        response.set_body(staged.body);
        response
    }

    /// Plain 500 used when the error chain itself cannot produce anything
    #[must_use]
    pub fn default_error_response(request: &HttpRequestMessage) -> Self {
        let mut response = Self::new(request, 500);
        response.finish_buffering_if_incomplete();
        response
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// Request as it stood when this response was created
    #[must_use]
    pub fn outbound_request(&self) -> &Arc<HttpRequestInfo> {
        &self.outbound_request
    }

    /// Request exactly as the client sent it
    #[must_use]
    pub fn inbound_request(&self) -> Option<&Arc<HttpRequestInfo>> {
        self.inbound_request.as_ref()
    }

    /// Freeze the origin's response before outbound filters mutate it
    pub fn store_inbound_response(&mut self) {
        self.inbound_response = Some(Arc::new(self.snapshot()));
    }

    #[must_use]
    pub fn inbound_response(&self) -> Option<&Arc<HttpResponseInfo>> {
        self.inbound_response.as_ref()
    }

    /// Immutable copy of the current status and headers
    #[must_use]
    pub fn snapshot(&self) -> HttpResponseInfo {
        HttpResponseInfo {
            status: self.status,
            headers: self.message.headers().immutable_copy(),
        }
    }

    /// Parse one Set-Cookie header value
    #[must_use]
    pub fn parse_set_cookie_header(value: &str) -> Option<Cookie<'static>> {
        match Cookie::parse(value) {
            Ok(cookie) => Some(cookie.into_owned()),
            Err(error) => {
                debug!(%error, "skipping malformed Set-Cookie header");
                None
            }
        }
    }

    /// Whether any Set-Cookie header carries the given cookie name
    #[must_use]
    pub fn has_set_cookie_with_name(&self, name: &str) -> bool {
        self.headers()
            .all(SET_COOKIE)
            .iter()
            .filter_map(|value| Self::parse_set_cookie_header(value))
            .any(|cookie| cookie.name().eq_ignore_ascii_case(name))
    }

    /// Drop every Set-Cookie header for the named cookie
    ///
    /// Matches on the literal `name=` prefix of the header value. Returns
    /// whether anything was removed.
    pub fn remove_existing_set_cookie(&mut self, name: &str) -> bool {
        let prefix = format!("{name}=");
        let mut dirty = false;

        let filtered: Headers = self
            .headers()
            .iter()
            .filter(|header| {
                let matches = header.is_named(SET_COOKIE) && header.value().starts_with(&prefix);
                if matches {
                    dirty = true;
                }
                !matches
            })
            .map(|header| (header.name().to_string(), header.value().to_string()))
            .collect();

        if dirty {
            *self.headers_mut() = filtered;
        }
        dirty
    }

    /// Append a Set-Cookie header for the cookie
    pub fn add_set_cookie(&mut self, cookie: &Cookie<'_>) {
        self.headers_mut().add(SET_COOKIE, cookie.to_string());
    }

    /// Replace any existing Set-Cookie headers with one for this cookie
    pub fn set_set_cookie(&mut self, cookie: &Cookie<'_>) {
        self.headers_mut().set(SET_COOKIE, cookie.to_string());
    }

    /// Full copy with retained body chunks and a decoupled context
    #[must_use]
    pub fn clone_message(&self) -> Self {
        Self {
            message: self.message.clone_with_context(),
            status: self.status,
            outbound_request: Arc::clone(&self.outbound_request),
            inbound_request: self.inbound_request.clone(),
            inbound_response: self.inbound_response.clone(),
        }
    }
}

impl HttpMessage for HttpResponseMessage {
    fn context(&self) -> &Arc<SessionContext> {
        self.message.context()
    }

    fn headers(&self) -> &Headers {
        self.message.headers()
    }

    fn headers_mut(&mut self) -> &mut Headers {
        self.message.headers_mut()
    }

    fn body(&self) -> &Body {
        self.message.body()
    }

    fn body_mut(&mut self) -> &mut Body {
        self.message.body_mut()
    }

    fn max_body_size(&self) -> usize {
        self.message.context().properties().response_body_max_size()
    }
}

/// Immutable snapshot of a response at a point in time
#[derive(Debug, Clone)]
pub struct HttpResponseInfo {
    status: u16,
    headers: Arc<Headers>,
}

impl HttpResponseInfo {
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    #[must_use]
    pub fn headers(&self) -> &Arc<Headers> {
        &self.headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{keys, DynamicProperties};
    use crate::message::test_support::new_test_context;
    use crate::message::{BodyChunk, HttpQueryParams};
    use crate::passport::CurrentPassport;

    fn new_request() -> HttpRequestMessage {
        let mut request = HttpRequestMessage::new(
            new_test_context(),
            "HTTP/1.1",
            "GET",
            "/widgets",
            HttpQueryParams::new(),
            Headers::new(),
            "203.0.113.9",
            "http",
            7001,
            "edge",
        );
        request.store_inbound_request();
        request
    }

    #[test]
    fn test_outbound_snapshot_frozen_at_creation() {
        let mut request = new_request();
        request.set_path("/routed");

        let response = HttpResponseMessage::new(&request, 200);
        assert_eq!(response.outbound_request().path(), "/routed");
        assert_eq!(response.inbound_request().unwrap().path(), "/widgets");

        // Later request mutation cannot leak into the snapshot
        request.set_path("/changed-again");
        assert_eq!(response.outbound_request().path(), "/routed");
    }

    #[test]
    fn test_store_inbound_response_freezes_origin_view() {
        let request = new_request();
        let mut response = HttpResponseMessage::new(&request, 503);
        response.headers_mut().add("Retry-After", "1");
        response.store_inbound_response();

        response.set_status(200);
        response.headers_mut().remove("retry-after");

        let origin_view = response.inbound_response().unwrap();
        assert_eq!(origin_view.status(), 503);
        assert_eq!(origin_view.headers().first("retry-after"), Some("1"));
        assert_eq!(response.status(), 200);
    }

    #[test]
    fn test_has_set_cookie_with_name_is_case_insensitive() {
        let request = new_request();
        let mut response = HttpResponseMessage::new(&request, 200);
        response.headers_mut().add("Set-Cookie", "Session=abc; Path=/");

        assert!(response.has_set_cookie_with_name("session"));
        assert!(!response.has_set_cookie_with_name("other"));
    }

    #[test]
    fn test_remove_existing_set_cookie_matches_prefix() {
        let request = new_request();
        let mut response = HttpResponseMessage::new(&request, 200);
        response.headers_mut().add("Set-Cookie", "session=abc; Path=/");
        response.headers_mut().add("Set-Cookie", "other=1");
        response.headers_mut().add("Content-Type", "text/plain");

        assert!(response.remove_existing_set_cookie("session"));

        let remaining = response.headers().all("set-cookie");
        assert_eq!(remaining, vec!["other=1"]);
        assert_eq!(response.headers().first("content-type"), Some("text/plain"));

        // Nothing left to remove
        assert!(!response.remove_existing_set_cookie("session"));
    }

    #[test]
    fn test_add_set_cookie_encodes() {
        let request = new_request();
        let mut response = HttpResponseMessage::new(&request, 200);
        response.add_set_cookie(&Cookie::new("session", "abc"));
        assert_eq!(response.headers().first("set-cookie"), Some("session=abc"));
    }

    #[test]
    fn test_default_error_response() {
        let request = new_request();
        let response = HttpResponseMessage::default_error_response(&request);
        assert_eq!(response.status(), 500);
        assert!(response.has_complete_body());
        assert_eq!(response.body_length(), 0);
    }

    #[test]
    fn test_from_static_response() {
        let request = new_request();
        let mut staged = StaticResponse::new(429, "slow down");
        staged.headers.add("Retry-After", "5");

        let response = HttpResponseMessage::from_static_response(&request, staged);
        assert_eq!(response.status(), 429);
        assert_eq!(response.headers().first("retry-after"), Some("5"));
        assert_eq!(response.headers().first("content-length"), Some("9"));
        assert_eq!(response.body_as_text().as_deref(), Some("slow down"));
    }

    #[test]
    fn test_response_body_limit_uses_own_property() {
        let properties = Arc::new(DynamicProperties::new());
        properties.set_int(keys::RESPONSE_BODY_MAX_SIZE, 1024);
        let context = Arc::new(crate::message::SessionContext::new(
            properties,
            Arc::new(CurrentPassport::new()),
        ));
        let request = HttpRequestMessage::new(
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
        );

        let response = HttpResponseMessage::new(&request, 200);
        assert_eq!(response.max_body_size(), 1024);
        assert_ne!(request.max_body_size(), 1024);
    }

    #[test]
    fn test_clone_message_shares_snapshots() {
        let request = new_request();
        let mut response = HttpResponseMessage::new(&request, 200);
        response.buffer_body_chunk(BodyChunk::last(Bytes::from_static(b"ok")));

        let copy = response.clone_message();
        assert!(Arc::ptr_eq(copy.outbound_request(), response.outbound_request()));
        assert_eq!(copy.body_as_text().as_deref(), Some("ok"));
    }
}

//! HTTP message model for the filter pipeline
//!
//! Requests and responses share a common core (`Message`) holding the
//! header list, the chunked body, and the session context. The concrete
//! types layer request-line / status-line state on top and are the units
//! the filter chains operate on.

pub mod body;
pub mod context;
pub mod cookies;
pub mod headers;
pub mod request;
pub mod response;

pub use body::{Body, BodyChunk};
pub use context::{
    ErrorRecord, FilterFailure, SessionContext, StaticResponse, StatusCategory,
};
pub use cookies::Cookies;
pub use headers::{Header, Headers};
pub use request::{HttpHostPort, HttpQueryParams, HttpRequestInfo, HttpRequestMessage};
pub use response::{HttpResponseInfo, HttpResponseMessage};

use bytes::Bytes;
use std::sync::Arc;

/// Common operations over request and response messages
///
/// The filter runtime is written against this trait so the same chain
/// machinery drives both directions.
pub trait HttpMessage {
    fn context(&self) -> &Arc<SessionContext>;
    fn headers(&self) -> &Headers;
    fn headers_mut(&mut self) -> &mut Headers;
    fn body(&self) -> &Body;
    fn body_mut(&mut self) -> &mut Body;

    /// Largest body this message is allowed to buffer
    fn max_body_size(&self) -> usize;

    fn has_body(&self) -> bool {
        self.body().has_body()
    }

    fn has_complete_body(&self) -> bool {
        self.body().is_complete()
    }

    fn body_length(&self) -> usize {
        self.body().length()
    }

    fn buffer_body_chunk(&mut self, chunk: BodyChunk) {
        self.body_mut().buffer(chunk);
    }

    /// Assembled body bytes, if any chunk was buffered
    fn body_bytes(&self) -> Option<Bytes> {
        self.body().to_bytes()
    }

    fn body_as_text(&self) -> Option<String> {
        self.body_bytes()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Replace the body wholesale with a single complete chunk
    ///
    /// Framing headers are rewritten to match: Content-Length is set to the
    /// new length and any Transfer-Encoding is dropped.
    fn set_body(&mut self, data: Bytes) {
        let length = data.len();
        self.body_mut().replace(data);
        self.headers_mut().remove("Transfer-Encoding");
        self.headers_mut().set("Content-Length", length.to_string());
    }

    fn set_body_as_text(&mut self, text: &str) {
        self.set_body(Bytes::copy_from_slice(text.as_bytes()));
    }

    /// Append an empty terminal chunk if buffering never saw one
    fn finish_buffering_if_incomplete(&mut self) -> bool {
        self.body_mut().finish_if_incomplete()
    }

    fn dispose_buffered_body(&mut self) {
        self.body_mut().dispose();
    }
}

/// Shared core of request and response messages
#[derive(Debug)]
pub struct Message {
    context: Arc<SessionContext>,
    headers: Headers,
    body: Body,
}

impl Message {
    #[must_use]
    pub fn new(context: Arc<SessionContext>, headers: Headers) -> Self {
        Self {
            context,
            headers,
            body: Body::new(),
        }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    #[must_use]
    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    /// Copy with retained body chunks and a decoupled context
    ///
    /// Mutating the copy's context must not affect the original, so the
    /// context is deep-cloned rather than shared.
    #[must_use]
    pub fn clone_with_context(&self) -> Self {
        Self {
            context: Arc::new(self.context.deep_clone()),
            headers: self.headers.clone(),
            body: self.body.clone_retained(),
        }
    }
}

//! Per-request wiring
//!
//! Before any filter runs, each request gets a fresh context carrying the
//! channel passport, a new UUID, the origin manager, and byte counters
//! wired into the codec, and the parsed head becomes the mutable message
//! the chains operate on.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use uuid::Uuid;

use crate::codec::RequestHead;
use crate::config::{DynamicProperties, ListenerConfig};
use crate::ingress::ConnectionRecord;
use crate::message::{HttpQueryParams, HttpRequestMessage, SessionContext};
use crate::origin::OriginManager;

/// Listener identity stamped onto every request built on its connections
#[derive(Debug, Clone)]
pub struct ListenerBinding {
    /// Whether connections start with a PROXY preamble
    pub proxy_protocol: bool,
    /// Fallback port when the channel has no attributed local address
    pub port: u16,
    /// Name reported for this listener in built requests
    pub server_name: String,
}

impl ListenerBinding {
    #[must_use]
    pub fn from_config(listener: &ListenerConfig) -> Self {
        Self {
            proxy_protocol: listener.proxy_protocol,
            port: listener.port.get(),
            server_name: listener.server_name.clone(),
        }
    }
}

/// Counters the codec bumps as body bytes cross the channel
///
/// The same pair is visible through the context's body-size providers, so
/// completion logging reads exactly what the wire saw.
pub struct BodyCounters {
    pub request: Arc<AtomicU64>,
    pub response: Arc<AtomicU64>,
}

impl BodyCounters {
    fn new() -> Self {
        Self {
            request: Arc::new(AtomicU64::new(0)),
            response: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Build and decorate the context for one request
///
/// The context shares the channel passport, gets a fresh UUID and the
/// channel's connection id, holds the origin manager for routing, and has
/// new body counters bound as its size providers.
pub fn request_context(
    properties: &Arc<DynamicProperties>,
    origins: &Arc<OriginManager>,
    record: &ConnectionRecord,
) -> (Arc<SessionContext>, BodyCounters) {
    let context = Arc::new(SessionContext::new(
        Arc::clone(properties),
        Arc::clone(record.passport()),
    ));
    context.set_uuid(Uuid::new_v4());
    context.set_connection_id(record.id());
    context.set_origin_manager(Arc::clone(origins));

    let counters = BodyCounters::new();
    context.bind_body_size_providers(
        Arc::clone(&counters.request),
        Arc::clone(&counters.response),
    );
    (context, counters)
}

/// Turn a parsed head into the request message the filter chains own
///
/// The target splits into path and decoded query parameters; client
/// address, scheme, and port come from the channel attribution with the
/// listener as fallback.
pub fn build_request(
    context: Arc<SessionContext>,
    head: RequestHead,
    record: &ConnectionRecord,
    listener: &ListenerBinding,
) -> HttpRequestMessage {
    let protocol = head.protocol();
    let (path, query) = match head.target.split_once('?') {
        Some((path, query)) => (path.to_string(), HttpQueryParams::parse(query)),
        None => (head.target.clone(), HttpQueryParams::new()),
    };
    let client_ip = record
        .client_ip()
        .map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
    let scheme = if record.ssl_handshake_info().is_some() {
        "https"
    } else {
        "http"
    };
    let port = record.local_port().unwrap_or(listener.port);

    HttpRequestMessage::new(
        context,
        protocol,
        head.method,
        path,
        query,
        head.headers,
        client_ip,
        scheme,
        port,
        listener.server_name.clone(),
    )
}

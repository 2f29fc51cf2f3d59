//! Inbound request message and its immutable snapshot
//!
//! `HttpRequestMessage` is the mutable unit the inbound filter chain works
//! on. Before any filter runs, `store_inbound_request` freezes a snapshot
//! (`HttpRequestInfo`) so later stages can always see the request as the
//! client sent it, regardless of what filters mutate.

use bytes::Bytes;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::message::{Body, Cookies, Headers, HttpMessage, Message, SessionContext};

const SCHEME_HTTP: &str = "http";
const SCHEME_HTTPS: &str = "https";

/// Ordered query parameters, decoded once at parse time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpQueryParams {
    entries: Vec<(String, String)>,
}

impl HttpQueryParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a raw query string (without the leading `?`)
    ///
    /// Pairs keep their arrival order and duplicates survive. A segment
    /// without `=` becomes a parameter with an empty value.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut params = Self::new();
        for segment in raw.split('&') {
            if segment.is_empty() {
                continue;
            }
            let (name, value) = match segment.split_once('=') {
                Some((name, value)) => (name, value),
                None => (segment, ""),
            };
            params.add(percent_decode(name), percent_decode(value));
        }
        params
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for the name; query parameter names are case-sensitive
    #[must_use]
    pub fn first(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| n != name);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Re-encode for the wire, preserving order and duplicates
    #[must_use]
    pub fn to_encoded_string(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.entries {
            if !out.is_empty() {
                out.push('&');
            }
            percent_encode_into(&mut out, name);
            out.push('=');
            percent_encode_into(&mut out, value);
        }
        out
    }
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    // Invalid escape stays literal
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'%' => {
                out.push(b'%');
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

const fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn percent_encode_into(out: &mut String, raw: &str) {
    for &b in raw.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char);
            }
            b' ' => out.push('+'),
            other => {
                let _ = write!(out, "%{other:02X}");
            }
        }
    }
}

/// Host plus optional port split out of a `Host`-style header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHostPort {
    pub host: String,
    pub port: Option<u16>,
}

impl HttpHostPort {
    /// Split `host[:port]`, tolerating bracketed IPv6 literals
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if let Some(rest) = raw.strip_prefix('[') {
            if let Some(end) = rest.find(']') {
                let host = rest[..end].to_string();
                let port = rest[end + 1..]
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok());
                return Self { host, port };
            }
        }
        match raw.rsplit_once(':') {
            // A second colon means a bare IPv6 literal, not host:port
            Some((host, port)) if !host.contains(':') => Self {
                host: host.to_string(),
                port: port.parse().ok(),
            },
            _ => Self {
                host: raw.to_string(),
                port: None,
            },
        }
    }
}

/// Mutable inbound request flowing through the filter chains
#[derive(Debug)]
pub struct HttpRequestMessage {
    message: Message,
    protocol: String,
    method: String,
    path: String,
    query_params: HttpQueryParams,
    client_ip: String,
    scheme: String,
    port: u16,
    server_name: String,
    parsed_cookies: Option<Cookies>,
    inbound_request: Option<Arc<HttpRequestInfo>>,
}

impl HttpRequestMessage {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        context: Arc<SessionContext>,
        protocol: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        query_params: HttpQueryParams,
        headers: Headers,
        client_ip: impl Into<String>,
        scheme: impl Into<String>,
        port: u16,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            message: Message::new(context, headers),
            protocol: protocol.into(),
            method: method.into(),
            path: path.into(),
            query_params,
            client_ip: client_ip.into(),
            scheme: scheme.into(),
            port,
            server_name: server_name.into(),
            parsed_cookies: None,
            inbound_request: None,
        }
    }

    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn set_protocol(&mut self, protocol: impl Into<String>) {
        self.protocol = protocol.into();
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn set_method(&mut self, method: impl Into<String>) {
        self.method = method.into();
    }

    /// Path without the query string
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    #[must_use]
    pub fn query_params(&self) -> &HttpQueryParams {
        &self.query_params
    }

    pub fn query_params_mut(&mut self) -> &mut HttpQueryParams {
        &mut self.query_params
    }

    /// Address the connection arrived from, as attributed at accept time
    #[must_use]
    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    pub fn set_client_ip(&mut self, client_ip: impl Into<String>) {
        self.client_ip = client_ip.into();
    }

    /// Scheme of the listener the request arrived on
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn set_scheme(&mut self, scheme: impl Into<String>) {
        self.scheme = scheme.into();
    }

    /// Port the request arrived on
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Path plus encoded query string, as it would appear on the wire
    #[must_use]
    pub fn path_and_query(&self) -> String {
        if self.query_params.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query_params.to_encoded_string())
        }
    }

    /// Host the client believes it addressed
    ///
    /// Trusts X-Forwarded-Host first (an edge ahead of us rewrote Host),
    /// then the Host header, then the configured server name.
    #[must_use]
    pub fn original_host(&self) -> String {
        if let Some(forwarded) = self.headers().first("x-forwarded-host") {
            return forwarded.to_string();
        }
        if let Some(host) = self.headers().first("host") {
            return HttpHostPort::parse(host).host;
        }
        self.server_name.clone()
    }

    /// Scheme the client used at the outermost edge
    #[must_use]
    pub fn original_scheme(&self) -> String {
        match self.headers().first("x-forwarded-proto") {
            Some(proto) => proto.to_ascii_lowercase(),
            None => self.scheme.clone(),
        }
    }

    /// Port the client addressed at the outermost edge
    #[must_use]
    pub fn original_port(&self) -> u16 {
        if let Some(port) = self
            .headers()
            .first("x-forwarded-port")
            .and_then(|p| p.parse().ok())
        {
            return port;
        }
        if let Some(port) = self
            .headers()
            .first("host")
            .and_then(|h| HttpHostPort::parse(h).port)
        {
            return port;
        }
        self.port
    }

    /// Rebuild the absolute URI the client requested
    ///
    /// Default ports for the scheme are left off.
    #[must_use]
    pub fn reconstruct_uri(&self) -> String {
        let scheme = self.original_scheme();
        let port = self.original_port();
        let default_port = match scheme.as_str() {
            SCHEME_HTTP => 80,
            SCHEME_HTTPS => 443,
            _ => 0,
        };

        let mut uri = String::with_capacity(128);
        uri.push_str(&scheme);
        uri.push_str("://");
        uri.push_str(&self.original_host());
        if port != default_port {
            let _ = write!(uri, ":{port}");
        }
        uri.push_str(&self.path_and_query());
        uri
    }

    /// Cookies from the Cookie headers, parsed once and cached
    pub fn parse_cookies(&mut self) -> &Cookies {
        let headers = self.message.headers();
        self.parsed_cookies
            .get_or_insert_with(|| Cookies::parse(headers))
    }

    /// Drop the cookie cache and re-parse; call after mutating Cookie headers
    pub fn re_parse_cookies(&mut self) -> &Cookies {
        self.parsed_cookies = None;
        self.parse_cookies()
    }

    /// Freeze the as-received request before any filter touches it
    pub fn store_inbound_request(&mut self) {
        self.inbound_request = Some(Arc::new(self.snapshot()));
    }

    #[must_use]
    pub fn inbound_request(&self) -> Option<&Arc<HttpRequestInfo>> {
        self.inbound_request.as_ref()
    }

    /// Immutable copy of the current request line, headers, and addressing
    #[must_use]
    pub fn snapshot(&self) -> HttpRequestInfo {
        HttpRequestInfo {
            protocol: self.protocol.clone(),
            method: self.method.clone(),
            path: self.path.clone(),
            query_params: self.query_params.clone(),
            headers: self.message.headers().immutable_copy(),
            client_ip: self.client_ip.clone(),
            scheme: self.scheme.clone(),
            port: self.port,
            server_name: self.server_name.clone(),
            original_host: self.original_host(),
            original_scheme: self.original_scheme(),
            original_port: self.original_port(),
        }
    }

    /// Full copy with retained body chunks and a decoupled context
    #[must_use]
    pub fn clone_message(&self) -> Self {
        Self {
            message: self.message.clone_with_context(),
            protocol: self.protocol.clone(),
            method: self.method.clone(),
            path: self.path.clone(),
            query_params: self.query_params.clone(),
            client_ip: self.client_ip.clone(),
            scheme: self.scheme.clone(),
            port: self.port,
            server_name: self.server_name.clone(),
            parsed_cookies: self.parsed_cookies.clone(),
            inbound_request: self.inbound_request.clone(),
        }
    }
}

impl HttpMessage for HttpRequestMessage {
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
        self.message.context().properties().body_max_size()
    }
}

/// Immutable snapshot of a request at a point in time
#[derive(Debug, Clone)]
pub struct HttpRequestInfo {
    protocol: String,
    method: String,
    path: String,
    query_params: HttpQueryParams,
    headers: Arc<Headers>,
    client_ip: String,
    scheme: String,
    port: u16,
    server_name: String,
    original_host: String,
    original_scheme: String,
    original_port: u16,
}

impl HttpRequestInfo {
    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn query_params(&self) -> &HttpQueryParams {
        &self.query_params
    }

    #[must_use]
    pub fn headers(&self) -> &Arc<Headers> {
        &self.headers
    }

    #[must_use]
    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    #[must_use]
    pub fn original_host(&self) -> &str {
        &self.original_host
    }

    #[must_use]
    pub fn original_scheme(&self) -> &str {
        &self.original_scheme
    }

    #[must_use]
    pub fn original_port(&self) -> u16 {
        self.original_port
    }

    #[must_use]
    pub fn path_and_query(&self) -> String {
        if self.query_params.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query_params.to_encoded_string())
        }
    }
}

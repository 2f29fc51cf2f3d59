//! Typed per-connection state
//!
//! One record is owned by the worker task handling a connection; preamble
//! handlers and the session loop read and update it directly instead of
//! going through a stringly-keyed attribute map.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::config::ClientAuthMode;
use crate::ingress::proxy_protocol::{ProxyHeader, ProxyVersion};
use crate::passport::{CurrentPassport, PassportState};
use crate::types::ConnectionId;

/// What TLS termination reported for this channel
///
/// The handshake itself happens in the fronting TLS stack; this is the
/// summary the header stripper and access logs consult.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslHandshakeInfo {
    /// Negotiated protocol, e.g. `TLSv1.3`
    pub protocol: String,
    pub cipher_suite: String,
    /// Client-certificate requirement the listener was configured with
    pub client_auth: ClientAuthMode,
    pub client_cert_presented: bool,
}

/// Per-connection state threaded through the preamble and session
#[derive(Debug)]
pub struct ConnectionRecord {
    id: ConnectionId,
    passport: Arc<CurrentPassport>,
    haproxy_message: Option<ProxyHeader>,
    haproxy_version: Option<ProxyVersion>,
    local_address: Option<IpAddr>,
    local_port: Option<u16>,
    source_address: Option<IpAddr>,
    source_port: Option<u16>,
    ssl_handshake_info: Option<SslHandshakeInfo>,
    channel_throttled: bool,
    requests_started: u64,
}

impl ConnectionRecord {
    #[must_use]
    pub fn new() -> Self {
        let passport = Arc::new(CurrentPassport::new());
        passport.add(PassportState::ServerChActive);
        Self {
            id: ConnectionId::new(),
            passport,
            haproxy_message: None,
            haproxy_version: None,
            local_address: None,
            local_port: None,
            source_address: None,
            source_port: None,
            ssl_handshake_info: None,
            channel_throttled: false,
            requests_started: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn passport(&self) -> &Arc<CurrentPassport> {
        &self.passport
    }

    /// Attribute addresses from a decoded PROXY preamble
    ///
    /// TLV buffers are released here; only the frame itself is retained
    /// on the record.
    pub fn attribute_proxy_header(&mut self, header: ProxyHeader) {
        self.haproxy_version = Some(header.version());
        if let Some(addresses) = header.addresses() {
            self.source_address = Some(addresses.source.ip());
            self.source_port = Some(addresses.source.port());
            self.local_address = Some(addresses.destination.ip());
            self.local_port = Some(addresses.destination.port());
        }
        self.haproxy_message = Some(header.without_tlvs());
    }

    /// Attribute addresses from the socket when no preamble was present
    pub fn attribute_socket(&mut self, peer: SocketAddr, local: SocketAddr) {
        if self.source_address.is_none() {
            self.source_address = Some(peer.ip());
            self.source_port = Some(peer.port());
        }
        if self.local_address.is_none() {
            self.local_address = Some(local.ip());
            self.local_port = Some(local.port());
        }
    }

    #[must_use]
    pub fn haproxy_message(&self) -> Option<&ProxyHeader> {
        self.haproxy_message.as_ref()
    }

    #[must_use]
    pub fn haproxy_version(&self) -> Option<ProxyVersion> {
        self.haproxy_version
    }

    #[must_use]
    pub fn source_address(&self) -> Option<IpAddr> {
        self.source_address
    }

    #[must_use]
    pub fn source_port(&self) -> Option<u16> {
        self.source_port
    }

    #[must_use]
    pub fn local_address(&self) -> Option<IpAddr> {
        self.local_address
    }

    #[must_use]
    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    /// Client IP as the codec should report it, preamble first
    #[must_use]
    pub fn client_ip(&self) -> Option<IpAddr> {
        self.source_address
    }

    pub fn record_ssl_handshake(&mut self, info: SslHandshakeInfo) {
        self.passport
            .add(PassportState::ServerChSslHandshakeComplete);
        self.ssl_handshake_info = Some(info);
    }

    #[must_use]
    pub fn ssl_handshake_info(&self) -> Option<&SslHandshakeInfo> {
        self.ssl_handshake_info.as_ref()
    }

    /// Mark this channel as rejected by the inbound-connection guard
    pub fn mark_throttled(&mut self) {
        self.channel_throttled = true;
        self.passport.add(PassportState::ServerChThrottling);
    }

    #[must_use]
    pub fn is_throttled(&self) -> bool {
        self.channel_throttled
    }

    /// True until the first request on this channel has started
    #[must_use]
    pub fn is_first_request(&self) -> bool {
        self.requests_started == 0
    }

    pub fn mark_request_started(&mut self) {
        self.requests_started += 1;
    }

    #[must_use]
    pub fn requests_started(&self) -> u64 {
        self.requests_started
    }
}

impl Default for ConnectionRecord {
    fn default() -> Self {
        Self::new()
    }
}

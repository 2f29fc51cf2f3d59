//! Connection intake ahead of the HTTP codec
//!
//! Everything that happens between `accept()` and the first parsed request
//! head lives here: listener binding and the accept loop, PROXY protocol
//! detection and decoding, address attribution onto the per-connection
//! record, the global inbound connection cap, and the forwarded-header
//! trust policy.

pub mod connection;
pub mod proxy_protocol;
pub mod server;
pub mod strip;
pub mod throttle;

pub use connection::{ConnectionRecord, SslHandshakeInfo};
pub use proxy_protocol::{
    detect, hex_dump, parse_preamble, Detection, ProxiedAddresses, ProxyHeader, ProxyTlv,
    ProxyVersion, V2Command,
};
pub use server::{ProxyServer, ProxyServerBuilder};
pub use strip::{UntrustedHeaderStripper, UNTRUSTED_HEADERS};
pub use throttle::InboundConnectionGuard;

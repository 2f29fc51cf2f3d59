//! Edge L7 proxy core
//!
//! An HTTP/1.1 edge proxy built around ordered filter chains, in the
//! manner of an API-gateway tier. Connections arrive through listeners
//! that understand the PROXY protocol, every request runs the inbound,
//! endpoint, and outbound chains, and responses are proxied back from
//! pooled origin connections with a bounded retry budget. Each channel
//! carries a passport, an append-only log of timestamped lifecycle
//! states, which the request-complete handler turns into the
//! `zuul.timings.request.*` metrics.
//!
//! [`ingress::ProxyServer`] assembles the whole stack from a
//! [`config::Config`]; the pieces also compose individually for
//! embedding and for tests:
//!
//! - [`ingress`]: listeners, PROXY protocol, connection cap, header trust
//! - [`filter`]: filter traits, registry snapshots, chain runner
//! - [`message`]: request/response messages, bodies, session context
//! - [`codec`]: HTTP/1.1 decode and encode
//! - [`origin`]: origins, pooled connections, the proxying endpoint
//! - [`session`]: the per-connection request loop
//! - [`worker`]: the fixed pool of worker event-loops
//! - [`passport`] and [`metrics`]: timing records and their publication

pub mod args;
pub mod codec;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod filter;
pub mod ingress;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod origin;
pub mod passport;
pub mod push;
pub mod session;
pub mod types;
pub mod worker;

pub use config::{load_config, load_or_create_config, Config};
pub use error::ProxyError;
pub use ingress::ProxyServer;

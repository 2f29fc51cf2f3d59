//! Configuration type definitions
//!
//! This module contains all the core configuration structures used by the
//! proxy.

use crate::types::{HostName, MaxConnections, OriginName, Port, ThreadCount, duration_serde};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Trust policy for forwarded headers arriving from the client side
///
/// Decides whether `X-Forwarded-*` and `X-Real-Ip` headers on the first
/// request of a channel are kept or stripped before filters see them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustPolicy {
    /// Always strip: nothing upstream of us is trusted
    Never,
    /// Strip unless the channel completed a handshake that required and
    /// verified a client certificate
    MutualSslAuth,
    /// Never strip: the fronting tier is fully trusted
    Always,
}

impl Default for TrustPolicy {
    /// An unrecognized or absent policy must fail closed
    fn default() -> Self {
        Self::Never
    }
}

impl TrustPolicy {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Never => "NEVER",
            Self::MutualSslAuth => "MUTUAL_SSL_AUTH",
            Self::Always => "ALWAYS",
        }
    }
}

impl std::fmt::Display for TrustPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TrustPolicy {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "MUTUAL_SSL_AUTH" => Self::MutualSslAuth,
            "ALWAYS" => Self::Always,
            "NEVER" => Self::Never,
            other => {
                tracing::warn!(policy = other, "unrecognized trust policy, using NEVER");
                Self::Never
            }
        })
    }
}

impl<'de> Deserialize<'de> for TrustPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().unwrap_or_default())
    }
}

/// Client-certificate requirement configured on a TLS listener
///
/// The TLS stack itself is external; this mode is what the header
/// stripper consults when the policy is `MUTUAL_SSL_AUTH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuthMode {
    /// No client certificate requested
    #[default]
    None,
    /// Client certificate requested but optional
    Want,
    /// Client certificate required; handshake fails without one
    Require,
}

/// Main proxy configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Config {
    /// Process-wide server settings
    #[serde(default)]
    pub server: ServerSettings,
    /// Listening sockets, one per port
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    /// Upstream origins
    #[serde(default)]
    pub origins: Vec<OriginConfig>,
    /// Ingress pipeline settings
    #[serde(default)]
    pub ingress: IngressConfig,
    /// Timeouts applied through the request lifecycle
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Process-wide server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    /// Number of worker event-loops
    pub threads: ThreadCount,
    /// Global cap on concurrent inbound connections; None disables the guard
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_inbound_connections: Option<usize>,
    /// Log file path for the file layer of the subscriber
    pub log_file: PathBuf,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            threads: ThreadCount::DEFAULT,
            max_inbound_connections: None,
            log_file: PathBuf::from("edge-proxy.log"),
        }
    }
}

/// Configuration for one listening socket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenerConfig {
    /// Host/IP to bind to (default: 0.0.0.0)
    #[serde(default = "super::defaults::listen_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default)]
    pub port: Port,
    /// Expect an optional PROXY protocol preamble from the fronting LB
    #[serde(default)]
    pub proxy_protocol: bool,
    /// Client-certificate mode of the (external) TLS termination, if any
    #[serde(default)]
    pub client_auth: ClientAuthMode,
    /// Server name reported when no Host information is available
    #[serde(default = "super::defaults::server_name")]
    pub server_name: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: super::defaults::listen_host(),
            port: Port::default(),
            proxy_protocol: false,
            client_auth: ClientAuthMode::None,
            server_name: super::defaults::server_name(),
        }
    }
}

/// Ingress pipeline settings shared by all listeners
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct IngressConfig {
    /// Trust policy for X-Forwarded-* headers
    pub strip_policy: TrustPolicy,
}

/// Timeouts applied through the request lifecycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Overall per-request deadline
    #[serde(with = "duration_serde")]
    pub request_deadline: Duration,
    /// Drain window granted to in-flight connections on shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_drain: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_deadline: super::defaults::request_deadline(),
            shutdown_drain: super::defaults::shutdown_drain(),
        }
    }
}

/// Configuration for one upstream origin (a named service)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OriginConfig {
    pub name: OriginName,
    /// Servers behind this origin's load balancer
    pub servers: Vec<OriginServerConfig>,
    /// Maximum pooled connections per server
    #[serde(default = "super::defaults::max_connections_per_server")]
    pub max_connections_per_server: MaxConnections,
    /// Total origin attempts allowed per request (first try included)
    #[serde(default = "super::defaults::max_retries")]
    pub max_retries: u32,
    /// Response statuses that consume a retry instead of completing
    #[serde(default = "super::defaults::retryable_statuses")]
    pub retryable_statuses: Vec<u16>,
    /// Connect timeout for servers of this origin
    #[serde(
        with = "duration_serde",
        default = "super::defaults::origin_connect_timeout"
    )]
    pub connect_timeout: Duration,
    /// Read timeout while awaiting the response head
    #[serde(
        with = "duration_serde",
        default = "super::defaults::origin_read_timeout"
    )]
    pub read_timeout: Duration,
}

/// Configuration for a single server behind an origin
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OriginServerConfig {
    pub host: HostName,
    pub port: Port,
    /// TLS profile name; part of the pool key. None means plain TCP.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_profile: Option<String>,
}

/// Builder for constructing `OriginConfig` instances
///
/// Provides a fluent API for creating origin configurations, especially
/// useful in tests where filling every field is verbose.
///
/// # Examples
///
/// ```
/// use edge_proxy::config::OriginConfig;
///
/// let origin = OriginConfig::builder("api")
///     .server("10.0.0.5", 8080)
///     .server("10.0.0.6", 8080)
///     .max_retries(3)
///     .build()
///     .unwrap();
/// assert_eq!(origin.servers.len(), 2);
/// ```
pub struct OriginConfigBuilder {
    name: String,
    servers: Vec<(String, u16)>,
    max_connections_per_server: Option<usize>,
    max_retries: Option<u32>,
    retryable_statuses: Option<Vec<u16>>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
}

impl OriginConfigBuilder {
    /// Create a new builder for a named origin
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            servers: Vec::new(),
            max_connections_per_server: None,
            max_retries: None,
            retryable_statuses: None,
            connect_timeout: None,
            read_timeout: None,
        }
    }

    /// Add a plain-TCP server behind this origin
    #[must_use]
    pub fn server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.servers.push((host.into(), port));
        self
    }

    /// Set the maximum pooled connections per server
    #[must_use]
    pub fn max_connections_per_server(mut self, max: usize) -> Self {
        self.max_connections_per_server = Some(max);
        self
    }

    /// Set the total attempt budget per request
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Set which response statuses consume a retry
    #[must_use]
    pub fn retryable_statuses(mut self, statuses: Vec<u16>) -> Self {
        self.retryable_statuses = Some(statuses);
        self
    }

    /// Set the connect timeout
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the response-head read timeout
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Build the OriginConfig
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, no servers were added, a host
    /// is empty, or a port is 0.
    pub fn build(self) -> Result<OriginConfig, anyhow::Error> {
        let name = OriginName::new(self.name)?;

        if self.servers.is_empty() {
            anyhow::bail!("origin '{}' must have at least one server", name);
        }

        let mut servers = Vec::with_capacity(self.servers.len());
        for (host, port) in self.servers {
            let port = Port::new(port)
                .ok_or_else(|| anyhow::anyhow!("Invalid port: {} (must be 1-65535)", port))?;
            servers.push(OriginServerConfig {
                host: HostName::new(host)?,
                port,
                tls_profile: None,
            });
        }

        let max_connections_per_server = match self.max_connections_per_server {
            Some(max) => MaxConnections::new(max)
                .ok_or_else(|| anyhow::anyhow!("Invalid max_connections: {} (must be > 0)", max))?,
            None => super::defaults::max_connections_per_server(),
        };

        Ok(OriginConfig {
            name,
            servers,
            max_connections_per_server,
            max_retries: self.max_retries.unwrap_or_else(super::defaults::max_retries),
            retryable_statuses: self
                .retryable_statuses
                .unwrap_or_else(super::defaults::retryable_statuses),
            connect_timeout: self
                .connect_timeout
                .unwrap_or_else(super::defaults::origin_connect_timeout),
            read_timeout: self
                .read_timeout
                .unwrap_or_else(super::defaults::origin_read_timeout),
        })
    }
}

impl OriginConfig {
    /// Create a builder for constructing an OriginConfig
    #[must_use]
    pub fn builder(name: impl Into<String>) -> OriginConfigBuilder {
        OriginConfigBuilder::new(name)
    }
}

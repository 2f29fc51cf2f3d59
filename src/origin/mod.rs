//! Origins: the upstream services requests are proxied to
//!
//! An origin is a named service behind the proxy. The proxying endpoint
//! drives the [`Origin`] contract: server selection, pooled connects, and
//! the lifecycle callbacks that feed per-server health accounting. The
//! retry policy itself lives in the endpoint; an origin only supplies the
//! budget and says which statuses count as retryable.

pub mod attempt;
pub mod endpoint;
pub mod health;
pub mod pool;
pub mod routes;

pub use attempt::{RequestAttempt, RequestAttempts};
pub use endpoint::ProxyEndpoint;
pub use health::{ServerHealth, ServerHealthSnapshot};
pub use pool::PooledStream;
pub use routes::StaticRoutes;

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::config::OriginConfig;
use crate::error::ProxyError;
use crate::events::{PipelineEvent, PipelineEvents};
use crate::message::{ErrorRecord, HttpMessage, HttpResponseMessage, SessionContext};
use crate::metrics::{names, MetricsRegistry};
use crate::passport::PassportState;
use crate::types::{ConnectionId, HostName, OriginName, Port};

use self::pool::{acquire, build_pool, OriginPool};

/// One server behind an origin, as picked by the balancer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginServer {
    host: HostName,
    port: Port,
    index: usize,
}

impl OriginServer {
    #[must_use]
    pub fn new(host: HostName, port: Port, index: usize) -> Self {
        Self { host, port, index }
    }

    #[must_use]
    pub fn host(&self) -> &HostName {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.get()
    }

    /// Position in the origin's configured server list
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for OriginServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Contract between the proxying endpoint and an upstream service
///
/// Connection acquisition can fail; everything else is a notification
/// hook and must never fail the request, so the callbacks are infallible.
/// The default hook bodies record nothing, which keeps test doubles
/// small.
#[async_trait]
pub trait Origin: Send + Sync {
    fn name(&self) -> &OriginName;

    /// Total attempts (first try included) this request may spend
    fn max_retries_for_request(&self, context: &SessionContext) -> u32;

    /// Next server under the balancing policy; None when none are configured
    fn select_server(&self) -> Option<OriginServer>;

    /// Whether a completed response should consume a retry instead of
    /// being returned to the client
    fn is_retryable_status(&self, status: u16) -> bool;

    /// Fresh attempt record carrying the timeouts in force
    fn new_request_attempt(&self, attempt: u32, server: &OriginServer) -> RequestAttempt;

    /// Lease a connection to the chosen server
    async fn connect_to_origin(
        &self,
        context: &SessionContext,
        server: &OriginServer,
    ) -> Result<PooledStream, ProxyError>;

    /// The endpoint is about to spend its first attempt
    fn on_request_execution_start(&self, _context: &SessionContext) {}

    /// An attempt is about to go out to `server`
    fn on_request_start_with_server(&self, _server: &OriginServer) {}

    /// The attempt against `server` came back with a response
    fn on_request_execution_success(&self, _server: &OriginServer) {}

    /// The attempt against `server` failed with `error`
    fn on_request_exception_with_server(&self, _server: &OriginServer, _error: &ProxyError) {}

    /// Every attempt failed; the request is out of budget
    fn on_request_execution_failed(&self, _context: &SessionContext) {}

    /// Write the terminal error into the context for the complete log
    fn record_final_error(&self, context: &SessionContext, error: &ProxyError) {
        let attempts = context.attempts();
        let last = attempts.last();
        context.record_error(ErrorRecord {
            kind: error.kind_label(),
            server: last.map(|attempt| format!("{}:{}", attempt.host(), attempt.port())),
            attempt: last.map(RequestAttempt::attempt),
            message: error.to_string(),
        });
    }

    /// Note the status the origin answered with, before outbound filters
    /// get a chance to rewrite it
    fn record_final_response(&self, response: &HttpResponseMessage) {
        response.context().set_origin_status(response.status());
    }

    /// Health snapshot for the server at `index`, if tracked
    fn server_health(&self, _index: usize) -> Option<ServerHealthSnapshot> {
        None
    }
}

/// An origin backed by a fixed server list, balanced round-robin
///
/// Each server gets its own connection pool and health counters. The
/// rotation cursor is shared, so concurrent requests spread across the
/// list and a retry lands on the next server rather than the one that
/// just failed.
pub struct StaticOrigin {
    config: OriginConfig,
    next_server: AtomicUsize,
    pools: Vec<OriginPool>,
    health: Vec<ServerHealth>,
    events: PipelineEvents,
    metrics: MetricsRegistry,
}

impl StaticOrigin {
    /// Build pools and health counters for every configured server
    pub fn new(
        config: OriginConfig,
        events: PipelineEvents,
        metrics: MetricsRegistry,
    ) -> Result<Self, ProxyError> {
        let mut pools = Vec::with_capacity(config.servers.len());
        let mut health = Vec::with_capacity(config.servers.len());
        for server in &config.servers {
            pools.push(build_pool(
                server.host.as_str(),
                server.port.get(),
                config.max_connections_per_server.get(),
                config.connect_timeout,
            )?);
            health.push(ServerHealth::new());
        }
        Ok(Self {
            config,
            next_server: AtomicUsize::new(0),
            pools,
            health,
            events,
            metrics,
        })
    }

    #[must_use]
    pub fn config(&self) -> &OriginConfig {
        &self.config
    }
}

impl fmt::Debug for StaticOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticOrigin")
            .field("name", &self.config.name)
            .field("servers", &self.config.servers.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Origin for StaticOrigin {
    fn name(&self) -> &OriginName {
        &self.config.name
    }

    fn max_retries_for_request(&self, _context: &SessionContext) -> u32 {
        self.config.max_retries
    }

    fn select_server(&self) -> Option<OriginServer> {
        if self.config.servers.is_empty() {
            return None;
        }
        let index = self.next_server.fetch_add(1, Ordering::Relaxed) % self.config.servers.len();
        let server = &self.config.servers[index];
        Some(OriginServer::new(server.host.clone(), server.port, index))
    }

    fn is_retryable_status(&self, status: u16) -> bool {
        self.config.retryable_statuses.contains(&status)
    }

    fn new_request_attempt(&self, attempt: u32, server: &OriginServer) -> RequestAttempt {
        RequestAttempt::new(
            attempt,
            self.config.name.as_str(),
            server.host().as_str(),
            server.port(),
        )
        .with_timeouts(self.config.connect_timeout, self.config.read_timeout)
    }

    async fn connect_to_origin(
        &self,
        context: &SessionContext,
        server: &OriginServer,
    ) -> Result<PooledStream, ProxyError> {
        let pool =
            self.pools
                .get(server.index())
                .ok_or_else(|| ProxyError::OriginConnectFailure {
                    origin: self.config.name.as_str().to_string(),
                    host: server.host().as_str().to_string(),
                    port: server.port(),
                    source: io::Error::other("server is not part of this origin"),
                })?;

        context.passport().add(PassportState::OriginConnAcquireStart);
        match acquire(pool, &self.config.name, server.host().as_str(), server.port()).await {
            Ok(stream) => {
                context.passport().add(PassportState::OriginConnAcquireEnd);
                if let Ok(peer) = stream.peer_addr() {
                    self.events.fire(PipelineEvent::OriginConnectionAcquired {
                        connection: context.connection_id().unwrap_or_else(ConnectionId::new),
                        origin: self.config.name.clone(),
                        server: peer,
                    });
                }
                Ok(stream)
            }
            Err(error) => {
                context.passport().add(PassportState::OriginConnAcquireFailed);
                self.metrics.increment_counter(names::ORIGIN_CONNECT_FAILURES);
                Err(error)
            }
        }
    }

    fn on_request_start_with_server(&self, server: &OriginServer) {
        self.metrics.increment_counter(names::ORIGIN_ATTEMPTS);
        if let Some(health) = self.health.get(server.index()) {
            health.record_attempt();
        }
    }

    fn on_request_execution_success(&self, server: &OriginServer) {
        if let Some(health) = self.health.get(server.index()) {
            health.record_success();
        }
    }

    fn on_request_exception_with_server(&self, server: &OriginServer, error: &ProxyError) {
        let Some(health) = self.health.get(server.index()) else {
            return;
        };
        match error {
            ProxyError::OriginConnectFailure { .. } | ProxyError::PoolExhausted { .. } => {
                health.record_connect_failure();
            }
            ProxyError::OriginReadTimeout { .. } => health.record_read_timeout(),
            _ => {}
        }
    }

    fn on_request_execution_failed(&self, context: &SessionContext) {
        debug!(
            origin = %self.config.name,
            attempts = context.attempt_count(),
            "request exhausted its origin attempts"
        );
    }

    fn server_health(&self, index: usize) -> Option<ServerHealthSnapshot> {
        self.health.get(index).map(ServerHealth::snapshot)
    }
}

/// Registry of configured origins, shared by every worker
#[derive(Default)]
pub struct OriginManager {
    origins: DashMap<OriginName, Arc<dyn Origin>>,
}

impl OriginManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a static origin for every config entry
    pub fn from_configs(
        configs: &[OriginConfig],
        events: &PipelineEvents,
        metrics: &MetricsRegistry,
    ) -> Result<Self, ProxyError> {
        let manager = Self::new();
        for config in configs {
            let origin = StaticOrigin::new(config.clone(), events.clone(), metrics.clone())?;
            manager.register(Arc::new(origin));
        }
        Ok(manager)
    }

    /// Register an origin under its name; the last registration wins
    pub fn register(&self, origin: Arc<dyn Origin>) {
        let name = origin.name().clone();
        self.origins.insert(name, origin);
    }

    #[must_use]
    pub fn get(&self, name: &OriginName) -> Option<Arc<dyn Origin>> {
        self.origins
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.origins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}

impl fmt::Debug for OriginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginManager")
            .field("origins", &self.origins.len())
            .finish()
    }
}

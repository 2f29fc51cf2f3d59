//! Listener binding and the accept loop
//!
//! [`ProxyServer`] assembles the serving stack out of a validated
//! [`Config`]: filter chains, origin pools, the worker pool, and one
//! accept loop per configured listener. Every accepted channel passes the
//! inbound-connection cap, gets a [`ConnectionRecord`], and is handed to a
//! worker where a [`ClientSession`] owns it until close.
//!
//! [`ProxyServer::run`] serves until the given shutdown future resolves,
//! then drains: accept loops stop, idle channels close between requests,
//! and workers get the drain window before stragglers are aborted.

use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::{Config, DynamicProperties, ListenerConfig};
use crate::constants::socket::ACCEPT_BACKLOG;
use crate::events::PipelineEvents;
use crate::filter::{ConcurrencyGuard, FilterChainRunner, FilterRegistry};
use crate::ingress::{ConnectionRecord, InboundConnectionGuard, UntrustedHeaderStripper};
use crate::metrics::MetricsRegistry;
use crate::origin::{OriginManager, ProxyEndpoint, StaticRoutes};
use crate::passport::PassportState;
use crate::session::{ClientSession, ListenerBinding};
use crate::worker::{ConnectionTask, WorkerPool};

/// Builds a [`ProxyServer`] from a [`Config`]
///
/// Properties, metrics, and the event bus may be shared with the caller by
/// supplying them up front; anything not supplied gets a fresh default.
/// Without an explicit registry the stock filters are installed: `Routes`
/// sending every request to the first configured origin, and
/// `ProxyEndpoint` to proxy it there.
pub struct ProxyServerBuilder {
    config: Config,
    registry: Option<FilterRegistry>,
    properties: Option<Arc<DynamicProperties>>,
    metrics: Option<MetricsRegistry>,
    events: Option<PipelineEvents>,
}

impl ProxyServerBuilder {
    #[must_use]
    pub fn registry(mut self, registry: FilterRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn properties(mut self, properties: Arc<DynamicProperties>) -> Self {
        self.properties = Some(properties);
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn events(mut self, events: PipelineEvents) -> Self {
        self.events = Some(events);
        self
    }

    /// Validate the configuration and assemble the server
    ///
    /// Worker threads are started here; listeners are not bound until
    /// [`ProxyServer::bind`] or [`ProxyServer::run`].
    pub fn build(self) -> anyhow::Result<ProxyServer> {
        self.config.validate()?;

        let properties = self
            .properties
            .unwrap_or_else(|| Arc::new(DynamicProperties::new()));
        let metrics = self.metrics.unwrap_or_else(MetricsRegistry::new);
        let events = self.events.unwrap_or_else(PipelineEvents::new);

        let registry = match self.registry {
            Some(registry) => registry,
            None => stock_registry(&self.config, &metrics),
        };

        let origins = Arc::new(OriginManager::from_configs(
            &self.config.origins,
            &events,
            &metrics,
        )?);
        let chain = Arc::new(FilterChainRunner::new(
            registry.clone(),
            Arc::new(ConcurrencyGuard::new(metrics.clone())),
        ));
        let guard = InboundConnectionGuard::new(metrics.clone(), events.clone());
        let pool = WorkerPool::start(
            self.config.server.threads,
            self.config.timeouts.shutdown_drain,
            Arc::clone(&properties),
        )
        .context("starting worker event-loops")?;
        let (shutdown_tx, _) = broadcast::channel(4);

        Ok(ProxyServer {
            config: self.config,
            registry,
            chain,
            origins,
            properties,
            metrics,
            events,
            guard,
            pool,
            shutdown_tx,
            bound: Vec::new(),
        })
    }
}

/// Stock chain: route everything to the first origin, then proxy it
fn stock_registry(config: &Config, metrics: &MetricsRegistry) -> FilterRegistry {
    let registry = FilterRegistry::new();
    if let Some(origin) = config.origins.first() {
        registry.register_inbound(Arc::new(StaticRoutes::new(origin.name.clone())));
    }
    registry.register_endpoint(Arc::new(ProxyEndpoint::new(metrics.clone())));
    registry
}

/// One listener bound and ready to accept
struct BoundListener {
    listener: TcpListener,
    local: SocketAddr,
    session: Arc<ClientSession>,
}

/// The assembled proxy: listeners, filter chains, origins, and workers
pub struct ProxyServer {
    config: Config,
    registry: FilterRegistry,
    chain: Arc<FilterChainRunner>,
    origins: Arc<OriginManager>,
    properties: Arc<DynamicProperties>,
    metrics: MetricsRegistry,
    events: PipelineEvents,
    guard: InboundConnectionGuard,
    pool: WorkerPool,
    shutdown_tx: broadcast::Sender<()>,
    bound: Vec<BoundListener>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("listeners", &self.bound.len())
            .field("origins", &self.origins)
            .finish_non_exhaustive()
    }
}

impl ProxyServer {
    #[must_use]
    pub fn builder(config: Config) -> ProxyServerBuilder {
        ProxyServerBuilder {
            config,
            registry: None,
            properties: None,
            metrics: None,
            events: None,
        }
    }

    /// Live filter registry; registrations apply to the next request
    #[must_use]
    pub fn filters(&self) -> &FilterRegistry {
        &self.registry
    }

    #[must_use]
    pub fn properties(&self) -> &Arc<DynamicProperties> {
        &self.properties
    }

    #[must_use]
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    #[must_use]
    pub fn origins(&self) -> &Arc<OriginManager> {
        &self.origins
    }

    /// Addresses actually bound, in listener order; empty before `bind`
    #[must_use]
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.bound.iter().map(|bound| bound.local).collect()
    }

    /// Bind every configured listener
    pub async fn bind(&mut self) -> anyhow::Result<()> {
        for listener_config in &self.config.listeners {
            let listener = bind_listener(listener_config, &self.properties)?;
            let local = listener.local_addr().context("reading bound address")?;
            info!(
                %local,
                proxy_protocol = listener_config.proxy_protocol,
                server_name = %listener_config.server_name,
                "listener bound"
            );
            let session = Arc::new(self.session_for(listener_config));
            self.bound.push(BoundListener {
                listener,
                local,
                session,
            });
        }
        Ok(())
    }

    fn session_for(&self, listener: &ListenerConfig) -> ClientSession {
        ClientSession::new(
            Arc::clone(&self.chain),
            Arc::clone(&self.origins),
            Arc::clone(&self.properties),
            self.events.clone(),
            self.metrics.clone(),
            UntrustedHeaderStripper::new(self.config.ingress.strip_policy),
            ListenerBinding::from_config(listener),
        )
        .with_request_deadline(self.config.timeouts.request_deadline)
    }

    /// Serve until `shutdown` resolves, then drain and stop
    pub async fn run<F>(mut self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        if self.bound.is_empty() {
            self.bind().await?;
        }

        let cap = self.config.server.max_inbound_connections;
        let pool = Arc::new(self.pool);
        let listeners = std::mem::take(&mut self.bound);
        let mut accept_tasks = Vec::with_capacity(listeners.len());
        for bound in listeners {
            accept_tasks.push(tokio::spawn(accept_loop(
                bound,
                self.guard.clone(),
                Arc::clone(&pool),
                self.shutdown_tx.clone(),
                cap,
            )));
        }
        info!(
            listeners = accept_tasks.len(),
            workers = pool.len(),
            "proxy serving"
        );

        shutdown.await;
        info!("shutdown requested, draining");
        let _ = self.shutdown_tx.send(());
        for task in accept_tasks {
            if let Err(join_error) = task.await {
                warn!(error = %join_error, "accept loop panicked");
            }
        }

        // The accept loops were the only other holders of the pool
        match Arc::try_unwrap(pool) {
            Ok(pool) => {
                // Joins OS threads; keep that off the async runtime
                if let Err(join_error) =
                    tokio::task::spawn_blocking(move || pool.shutdown()).await
                {
                    warn!(error = %join_error, "worker pool shutdown panicked");
                }
            }
            Err(_still_shared) => warn!("worker pool still referenced, skipping drain"),
        }
        info!("proxy stopped");
        Ok(())
    }
}

/// Keeps the channel counted until its task finishes, or until the task is
/// dropped without ever running
struct ChannelGuard {
    guard: InboundConnectionGuard,
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.guard.on_channel_inactive();
    }
}

/// Accept channels on one listener until drain is signalled
async fn accept_loop(
    bound: BoundListener,
    guard: InboundConnectionGuard,
    pool: Arc<WorkerPool>,
    shutdown_tx: broadcast::Sender<()>,
    cap: Option<usize>,
) {
    let BoundListener {
        listener,
        local,
        session,
    } = bound;
    let mut shutdown = shutdown_tx.subscribe();

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.recv() => break,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(accept_error) => {
                error!(listener = %local, error = %accept_error, "accept failed");
                // EMFILE and friends fail instantly; pause instead of spinning
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let _ = stream.set_nodelay(true);
        let channel_local = stream.local_addr().unwrap_or(local);

        let mut record = ConnectionRecord::new();
        let admitted = guard.on_channel_active(&mut record, peer, cap);
        let counted = ChannelGuard {
            guard: guard.clone(),
        };
        if !admitted {
            // FIN rather than RST; the gauge drops when this task ends
            tokio::spawn(async move {
                let mut stream = stream;
                let _ = stream.shutdown().await;
                record.passport().add(PassportState::ServerChInactive);
                drop(counted);
            });
            continue;
        }

        let session = Arc::clone(&session);
        let drain = shutdown_tx.subscribe();
        let task: ConnectionTask = Box::pin(async move {
            if let Err(channel_error) = session
                .serve(stream, &mut record, peer, channel_local, drain)
                .await
            {
                debug!(
                    connection = %record.id(),
                    error = %channel_error,
                    "channel closed on protocol error"
                );
            }
            record.passport().add(PassportState::ServerChInactive);
            drop(counted);
        });
        if let Err(rejected) = pool.dispatch(task) {
            // Dropping the unrun task closes the socket and uncounts it
            debug!(%peer, "dropping channel rejected by every worker");
            drop(rejected);
        }
    }

    debug!(listener = %local, "accept loop stopped");
}

/// Bind one listener socket with the accept-side options applied
fn bind_listener(
    listener: &ListenerConfig,
    properties: &DynamicProperties,
) -> anyhow::Result<TcpListener> {
    let address = (listener.host.as_str(), listener.port.get())
        .to_socket_addrs()
        .with_context(|| format!("resolving {}:{}", listener.host, listener.port))?
        .next()
        .ok_or_else(|| {
            anyhow::anyhow!("{}:{} resolves to no address", listener.host, listener.port)
        })?;

    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))
        .context("creating listener socket")?;
    socket
        .set_reuse_address(true)
        .context("setting SO_REUSEADDR")?;
    #[cfg(target_os = "linux")]
    {
        if properties.socket_epoll() {
            if let Err(reuse_error) = socket.set_reuse_port(true) {
                debug!(error = %reuse_error, "SO_REUSEPORT not applied");
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = properties;
    socket
        .set_nonblocking(true)
        .context("setting the listener nonblocking")?;
    socket
        .bind(&address.into())
        .with_context(|| format!("binding {}", address))?;
    socket
        .listen(ACCEPT_BACKLOG)
        .with_context(|| format!("listening on {}", address))?;
    TcpListener::from_std(socket.into()).context("registering listener with the runtime")
}

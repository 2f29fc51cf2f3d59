//! User events fired on the connection pipeline
//!
//! Handlers publish lifecycle events that observers (metrics, tests,
//! operator tooling) can subscribe to without being wired into the data
//! path. Firing is fire-and-forget: an event with no subscribers is
//! dropped silently.

use std::net::SocketAddr;
use tokio::sync::broadcast;

use crate::types::{ConnectionId, OriginName};

/// Default buffered events per subscriber before lagging kicks in
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events observable on any connection's pipeline
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// The inbound-connection guard rejected this connection
    ConnectionThrottled {
        connection: ConnectionId,
        peer: SocketAddr,
    },
    /// TLS termination reported a completed handshake
    SslHandshakeComplete {
        connection: ConnectionId,
        client_cert_presented: bool,
    },
    /// The final response write for one request finished
    RequestComplete {
        connection: ConnectionId,
        status: u16,
    },
    /// An upstream connection was leased for a proxy attempt
    OriginConnectionAcquired {
        connection: ConnectionId,
        origin: OriginName,
        server: SocketAddr,
    },
}

impl PipelineEvent {
    /// Stable event identifier used in logs and external tooling
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ConnectionThrottled { .. } => "connection_throttled",
            Self::SslHandshakeComplete { .. } => "ssl_handshake_complete",
            Self::RequestComplete { .. } => "request_complete",
            Self::OriginConnectionAcquired { .. } => "origin_connection_acquired",
        }
    }

    /// The connection this event belongs to
    #[must_use]
    pub const fn connection(&self) -> ConnectionId {
        match self {
            Self::ConnectionThrottled { connection, .. }
            | Self::SslHandshakeComplete { connection, .. }
            | Self::RequestComplete { connection, .. }
            | Self::OriginConnectionAcquired { connection, .. } => *connection,
        }
    }
}

/// Broadcast hub for [`PipelineEvent`]s
///
/// Cloned into every worker; subscribers attach at any time and only see
/// events fired after they subscribed.
#[derive(Debug, Clone)]
pub struct PipelineEvents {
    tx: broadcast::Sender<PipelineEvent>,
}

impl PipelineEvents {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Fire an event to all current subscribers
    pub fn fire(&self, event: PipelineEvent) {
        tracing::trace!(event = event.name(), connection = %event.connection(), "pipeline event");
        // Err means no subscribers, which is fine
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for PipelineEvents {
    fn default() -> Self {
        Self::new()
    }
}

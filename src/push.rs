//! Push-notification connection registry
//!
//! Long-lived push handlers register the channel of each authenticated
//! client here so a backend can later find the live connection and push a
//! payload over it. Only the registry contract lives in this crate; the
//! push protocol sessions themselves are built on top of it.

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::ConnectionId;

/// Outcome of a push attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    /// Queued on the client's channel
    Accepted,
    /// No live channel registered for the client
    NoClient,
    /// The channel's backlog is full; the payload was not queued
    Backlogged,
    /// The channel closed under us; the handle is stale
    Closed,
}

/// Delivery slot for one client's push channel
#[derive(Debug, Clone)]
pub struct PushHandle {
    connection: ConnectionId,
    sender: mpsc::Sender<Bytes>,
}

impl PushHandle {
    #[must_use]
    pub fn new(connection: ConnectionId, sender: mpsc::Sender<Bytes>) -> Self {
        Self { connection, sender }
    }

    #[must_use]
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Queue a payload without waiting; the channel backlog is the limit
    pub fn push(&self, payload: Bytes) -> PushStatus {
        match self.sender.try_send(payload) {
            Ok(()) => PushStatus::Accepted,
            Err(mpsc::error::TrySendError::Full(_)) => PushStatus::Backlogged,
            Err(mpsc::error::TrySendError::Closed(_)) => PushStatus::Closed,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Client identity to live push channel
///
/// A client reconnecting lands on a fresh channel and replaces its old
/// registration; the old channel's close must then leave the new
/// registration alone, which is why deregistration is keyed on the
/// connection as well as the client.
pub struct PushConnectionRegistry {
    connections: DashMap<String, PushHandle>,
}

impl PushConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a client's channel, returning any handle it displaced
    pub fn register(&self, client: impl Into<String>, handle: PushHandle) -> Option<PushHandle> {
        let client = client.into();
        debug!(client = %client, connection = %handle.connection(), "push channel registered");
        self.connections.insert(client, handle)
    }

    /// Drop the client's registration if it still names this connection
    ///
    /// Returns whether a registration was removed. A close racing a
    /// reconnect finds the newer connection registered and removes nothing.
    pub fn deregister(&self, client: &str, connection: ConnectionId) -> bool {
        let removed = self
            .connections
            .remove_if(client, |_, handle| handle.connection() == connection)
            .is_some();
        if removed {
            debug!(client = %client, %connection, "push channel deregistered");
        }
        removed
    }

    #[must_use]
    pub fn get(&self, client: &str) -> Option<PushHandle> {
        self.connections.get(client).map(|entry| entry.value().clone())
    }

    /// Push a payload to the named client's live channel
    pub fn push(&self, client: &str, payload: Bytes) -> PushStatus {
        match self.get(client) {
            Some(handle) => handle.push(payload),
            None => PushStatus::NoClient,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for PushConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//! Process-wide cap on concurrent inbound connections
//!
//! One guard is shared by every listener and worker. Each channel is
//! counted on activation and uncounted on close, throttled channels
//! included, so the gauge always reflects live sockets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::events::{PipelineEvent, PipelineEvents};
use crate::ingress::connection::ConnectionRecord;
use crate::metrics::{names, MetricsRegistry};

/// Shared guard enforcing the inbound-connection cap
#[derive(Debug, Clone)]
pub struct InboundConnectionGuard {
    active: Arc<AtomicI64>,
    metrics: MetricsRegistry,
    events: PipelineEvents,
}

impl InboundConnectionGuard {
    #[must_use]
    pub fn new(metrics: MetricsRegistry, events: PipelineEvents) -> Self {
        Self {
            active: Arc::new(AtomicI64::new(0)),
            metrics,
            events,
        }
    }

    /// Count a newly active channel and decide whether it may proceed
    ///
    /// Over the cap: the record is marked throttled, a passport transition
    /// and `connection_throttled` event are recorded, and the caller must
    /// close the channel. The channel stays counted until
    /// [`on_channel_inactive`](Self::on_channel_inactive).
    pub fn on_channel_active(
        &self,
        record: &mut ConnectionRecord,
        peer: SocketAddr,
        cap: Option<usize>,
    ) -> bool {
        let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.metrics.increment_counter(names::CONNECTIONS_ACCEPTED);
        self.metrics.set_gauge(names::CONNECTIONS_ACTIVE, active);

        if let Some(cap) = cap {
            if active > cap as i64 {
                record.mark_throttled();
                self.metrics.increment_counter(names::CONNECTIONS_THROTTLED);
                self.events.fire(PipelineEvent::ConnectionThrottled {
                    connection: record.id(),
                    peer,
                });
                warn!(
                    connection = %record.id(),
                    %peer,
                    active,
                    cap,
                    "inbound connection throttled"
                );
                return false;
            }
        }

        debug!(connection = %record.id(), %peer, active, "channel active");
        true
    }

    /// Uncount a channel that went inactive
    pub fn on_channel_inactive(&self) {
        let active = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
        self.metrics.set_gauge(names::CONNECTIONS_ACTIVE, active);
    }

    /// Live channel count, throttled channels included
    #[must_use]
    pub fn active(&self) -> i64 {
        self.active.load(Ordering::Acquire)
    }
}

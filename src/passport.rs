//! Per-request lifecycle log ("passport")
//!
//! Every connection carries an append-only log of named states with
//! nanosecond timestamps. All duration metrics are computed as differences
//! between passport entries, and the rendered passport is the first thing
//! to look at when a request misbehaves.
//!
//! Only the worker that owns the connection appends entries, so the inner
//! lock is never contended; it exists to keep the type `Sync` for the
//! `Arc`-shared session context.

use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

/// Well-known lifecycle states
///
/// The wire names (`as_str`) are stable identifiers used in logs and
/// dashboards; the variant set covers every transition this proxy records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassportState {
    Created,
    ServerChActive,
    ServerChInactive,
    ServerChThrottling,
    ServerChClose,
    ServerChException,
    ServerChSslHandshakeComplete,
    InReqHeadersReceived,
    InReqContentReceived,
    InReqLastContentReceived,
    InReqRejected,
    FiltersInboundStart,
    FiltersInboundEnd,
    FiltersOutboundStart,
    FiltersOutboundEnd,
    OriginConnAcquireStart,
    OriginConnAcquireEnd,
    OriginConnAcquireFailed,
    OriginRetryAttempt,
    OriginChReadTimeout,
    OriginChClose,
    OriginChPoolReturned,
    OutReqHeadersSent,
    OutReqLastContentSent,
    InRespHeadersReceived,
    InRespContentReceived,
    InRespLastContentReceived,
    OutRespHeadersSent,
    OutRespLastContentSent,
    ClientCancelled,
}

impl PassportState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::ServerChActive => "SERVER_CH_ACTIVE",
            Self::ServerChInactive => "SERVER_CH_INACTIVE",
            Self::ServerChThrottling => "SERVER_CH_THROTTLING",
            Self::ServerChClose => "SERVER_CH_CLOSE",
            Self::ServerChException => "SERVER_CH_EXCEPTION",
            Self::ServerChSslHandshakeComplete => "SERVER_CH_SSL_HANDSHAKE_COMPLETE",
            Self::InReqHeadersReceived => "IN_REQ_HEADERS_RECEIVED",
            Self::InReqContentReceived => "IN_REQ_CONTENT_RECEIVED",
            Self::InReqLastContentReceived => "IN_REQ_LAST_CONTENT_RECEIVED",
            Self::InReqRejected => "IN_REQ_REJECTED",
            Self::FiltersInboundStart => "FILTERS_INBOUND_START",
            Self::FiltersInboundEnd => "FILTERS_INBOUND_END",
            Self::FiltersOutboundStart => "FILTERS_OUTBOUND_START",
            Self::FiltersOutboundEnd => "FILTERS_OUTBOUND_END",
            Self::OriginConnAcquireStart => "ORIGIN_CONN_ACQUIRE_START",
            Self::OriginConnAcquireEnd => "ORIGIN_CONN_ACQUIRE_END",
            Self::OriginConnAcquireFailed => "ORIGIN_CONN_ACQUIRE_FAILED",
            Self::OriginRetryAttempt => "ORIGIN_RETRY_ATTEMPT",
            Self::OriginChReadTimeout => "ORIGIN_CH_READ_TIMEOUT",
            Self::OriginChClose => "ORIGIN_CH_CLOSE",
            Self::OriginChPoolReturned => "ORIGIN_CH_POOL_RETURNED",
            Self::OutReqHeadersSent => "OUT_REQ_HEADERS_SENT",
            Self::OutReqLastContentSent => "OUT_REQ_LAST_CONTENT_SENT",
            Self::InRespHeadersReceived => "IN_RESP_HEADERS_RECEIVED",
            Self::InRespContentReceived => "IN_RESP_CONTENT_RECEIVED",
            Self::InRespLastContentReceived => "IN_RESP_LAST_CONTENT_RECEIVED",
            Self::OutRespHeadersSent => "OUT_RESP_HEADERS_SENT",
            Self::OutRespLastContentSent => "OUT_RESP_LAST_CONTENT_SENT",
            Self::ClientCancelled => "CLIENT_CANCELLED",
        }
    }
}

impl fmt::Display for PassportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One passport entry: a state and its offset from passport creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassportItem {
    pub state: PassportState,
    /// Nanoseconds since the passport was created
    pub nanos: u64,
}

/// Append-only log of lifecycle states for one connection
#[derive(Debug)]
pub struct CurrentPassport {
    created: Instant,
    items: Mutex<Vec<PassportItem>>,
}

impl CurrentPassport {
    /// Create a passport with a `CREATED` entry at offset zero
    #[must_use]
    pub fn new() -> Self {
        Self {
            created: Instant::now(),
            items: Mutex::new(vec![PassportItem {
                state: PassportState::Created,
                nanos: 0,
            }]),
        }
    }

    /// Append a state at the current time
    pub fn add(&self, state: PassportState) {
        let nanos = u64::try_from(self.created.elapsed().as_nanos()).unwrap_or(u64::MAX);
        if let Ok(mut items) = self.items.lock() {
            items.push(PassportItem { state, nanos });
        }
    }

    /// Timestamp of the first occurrence of `state`
    #[must_use]
    pub fn find_first(&self, state: PassportState) -> Option<u64> {
        self.items.lock().ok().and_then(|items| {
            items
                .iter()
                .find(|item| item.state == state)
                .map(|item| item.nanos)
        })
    }

    /// Timestamp of the last occurrence of `state`
    #[must_use]
    pub fn find_last(&self, state: PassportState) -> Option<u64> {
        self.items.lock().ok().and_then(|items| {
            items
                .iter()
                .rev()
                .find(|item| item.state == state)
                .map(|item| item.nanos)
        })
    }

    /// Nanoseconds between the first `start` entry and the last `end` entry
    ///
    /// None when either state was never recorded or the difference comes
    /// out negative.
    #[must_use]
    pub fn duration_between(&self, start: PassportState, end: PassportState) -> Option<u64> {
        self.signed_duration_between(start, end)
            .and_then(|d| u64::try_from(d).ok())
    }

    /// Like [`Self::duration_between`] but keeps a negative difference
    #[must_use]
    pub fn signed_duration_between(&self, start: PassportState, end: PassportState) -> Option<i64> {
        let start_ns = self.find_first(start)?;
        let end_ns = self.find_last(end)?;
        Some(end_ns as i64 - start_ns as i64)
    }

    /// How many times `state` was recorded
    #[must_use]
    pub fn count(&self, state: PassportState) -> usize {
        self.items
            .lock()
            .map(|items| items.iter().filter(|item| item.state == state).count())
            .unwrap_or(0)
    }

    /// Whether `state` was ever recorded
    #[must_use]
    pub fn contains(&self, state: PassportState) -> bool {
        self.count(state) > 0
    }

    /// Copy of all entries in append order
    #[must_use]
    pub fn snapshot(&self) -> Vec<PassportItem> {
        self.items.lock().map(|items| items.clone()).unwrap_or_default()
    }
}

impl Default for CurrentPassport {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CurrentPassport {
    /// Renders as `CurrentPassport {+0=CREATED, +1234=SERVER_CH_ACTIVE, ...}`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CurrentPassport {{")?;
        for (i, item) in self.snapshot().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "+{}={}", item.nanos, item.state)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_passport_has_created_entry() {
        let passport = CurrentPassport::new();
        assert_eq!(passport.find_first(PassportState::Created), Some(0));
        assert_eq!(passport.snapshot().len(), 1);
    }

    #[test]
    fn test_add_preserves_order() {
        let passport = CurrentPassport::new();
        passport.add(PassportState::ServerChActive);
        passport.add(PassportState::InReqHeadersReceived);
        passport.add(PassportState::FiltersInboundStart);

        let states: Vec<_> = passport.snapshot().iter().map(|i| i.state).collect();
        assert_eq!(
            states,
            vec![
                PassportState::Created,
                PassportState::ServerChActive,
                PassportState::InReqHeadersReceived,
                PassportState::FiltersInboundStart,
            ]
        );
    }

    #[test]
    fn test_timestamps_monotonic() {
        let passport = CurrentPassport::new();
        passport.add(PassportState::ServerChActive);
        passport.add(PassportState::ServerChInactive);

        let items = passport.snapshot();
        for pair in items.windows(2) {
            assert!(pair[0].nanos <= pair[1].nanos);
        }
    }

    #[test]
    fn test_find_first_and_last() {
        let passport = CurrentPassport::new();
        passport.add(PassportState::OriginConnAcquireStart);
        std::thread::sleep(std::time::Duration::from_millis(1));
        passport.add(PassportState::OriginConnAcquireStart);

        let first = passport.find_first(PassportState::OriginConnAcquireStart).unwrap();
        let last = passport.find_last(PassportState::OriginConnAcquireStart).unwrap();
        assert!(first < last);
    }

    #[test]
    fn test_find_missing_state() {
        let passport = CurrentPassport::new();
        assert_eq!(passport.find_first(PassportState::ClientCancelled), None);
        assert!(!passport.contains(PassportState::ClientCancelled));
    }

    #[test]
    fn test_duration_between() {
        let passport = CurrentPassport::new();
        passport.add(PassportState::InReqHeadersReceived);
        std::thread::sleep(std::time::Duration::from_millis(2));
        passport.add(PassportState::OutRespLastContentSent);

        let d = passport
            .duration_between(
                PassportState::InReqHeadersReceived,
                PassportState::OutRespLastContentSent,
            )
            .unwrap();
        assert!(d >= 2_000_000);
    }

    #[test]
    fn test_duration_between_missing_end() {
        let passport = CurrentPassport::new();
        passport.add(PassportState::InReqHeadersReceived);
        assert_eq!(
            passport.duration_between(
                PassportState::InReqHeadersReceived,
                PassportState::OutRespLastContentSent
            ),
            None
        );
    }

    #[test]
    fn test_out_of_order_duration_is_none_but_signed_is_negative() {
        let passport = CurrentPassport::new();
        passport.add(PassportState::OutRespLastContentSent);
        std::thread::sleep(std::time::Duration::from_millis(1));
        passport.add(PassportState::InReqHeadersReceived);

        assert_eq!(
            passport.duration_between(
                PassportState::InReqHeadersReceived,
                PassportState::OutRespLastContentSent
            ),
            None
        );
        let signed = passport
            .signed_duration_between(
                PassportState::InReqHeadersReceived,
                PassportState::OutRespLastContentSent,
            )
            .unwrap();
        assert!(signed < 0);
    }

    #[test]
    fn test_count() {
        let passport = CurrentPassport::new();
        passport.add(PassportState::OriginRetryAttempt);
        passport.add(PassportState::OriginRetryAttempt);
        assert_eq!(passport.count(PassportState::OriginRetryAttempt), 2);
        assert_eq!(passport.count(PassportState::ServerChThrottling), 0);
    }

    #[test]
    fn test_display_format() {
        let passport = CurrentPassport::new();
        passport.add(PassportState::ServerChActive);
        let rendered = passport.to_string();
        assert!(rendered.starts_with("CurrentPassport {+0=CREATED"));
        assert!(rendered.contains("SERVER_CH_ACTIVE"));
        assert!(rendered.ends_with('}'));
    }

    #[test]
    fn test_state_wire_names() {
        assert_eq!(PassportState::ServerChThrottling.as_str(), "SERVER_CH_THROTTLING");
        assert_eq!(PassportState::FiltersInboundStart.as_str(), "FILTERS_INBOUND_START");
        assert_eq!(
            PassportState::OriginConnAcquireStart.as_str(),
            "ORIGIN_CONN_ACQUIRE_START"
        );
        assert_eq!(
            PassportState::ServerChSslHandshakeComplete.to_string(),
            "SERVER_CH_SSL_HANDSHAKE_COMPLETE"
        );
    }
}

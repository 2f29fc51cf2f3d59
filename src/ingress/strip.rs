//! First-request scrub of client-supplied forwarding headers
//!
//! `X-Forwarded-*` and `X-Real-Ip` are only meaningful when set by an
//! infrastructure tier we trust. On the first request of each channel the
//! stripper decides, from the configured policy and the channel's TLS
//! handshake, whether those headers survive. The stripper itself holds no
//! per-channel state and one instance serves every connection.

use tracing::debug;

use crate::config::{ClientAuthMode, TrustPolicy};
use crate::ingress::connection::ConnectionRecord;
use crate::message::Headers;

/// Headers scrubbed from untrusted channels
pub const UNTRUSTED_HEADERS: [&str; 5] = [
    "x-forwarded-for",
    "x-forwarded-port",
    "x-forwarded-proto",
    "x-forwarded-proto-version",
    "x-real-ip",
];

/// Applies the forwarded-header trust policy to inbound requests
#[derive(Debug, Clone, Copy)]
pub struct UntrustedHeaderStripper {
    policy: TrustPolicy,
}

impl UntrustedHeaderStripper {
    #[must_use]
    pub fn new(policy: TrustPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> TrustPolicy {
        self.policy
    }

    /// Whether this channel's forwarding headers can be believed
    fn trusts(&self, record: &ConnectionRecord) -> bool {
        match self.policy {
            TrustPolicy::Always => true,
            TrustPolicy::Never => false,
            TrustPolicy::MutualSslAuth => matches!(
                record.ssl_handshake_info(),
                Some(info) if info.client_auth == ClientAuthMode::Require
            ),
        }
    }

    /// Scrub the headers of the channel's first request; later requests on
    /// the same channel pass untouched
    ///
    /// Returns how many headers were removed.
    pub fn scrub_first_request(
        &self,
        headers: &mut Headers,
        record: &ConnectionRecord,
    ) -> usize {
        if !record.is_first_request() || self.trusts(record) {
            return 0;
        }

        let mut removed = 0;
        for name in UNTRUSTED_HEADERS {
            if headers.remove(name) {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(
                connection = %record.id(),
                policy = %self.policy,
                removed,
                "stripped untrusted forwarding headers"
            );
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::connection::SslHandshakeInfo;

    fn forwarded_headers() -> Headers {
        let mut headers = Headers::new();
        headers.add("Host", "api.example.com");
        headers.add("X-Forwarded-For", "1.2.3.4");
        headers.add("X-Forwarded-Proto", "https");
        headers.add("X-Forwarded-Port", "443");
        headers.add("X-Real-Ip", "1.2.3.4");
        headers
    }

    fn mutual_tls_record() -> ConnectionRecord {
        let mut record = ConnectionRecord::new();
        record.record_ssl_handshake(SslHandshakeInfo {
            protocol: "TLSv1.3".into(),
            cipher_suite: "TLS_AES_256_GCM_SHA384".into(),
            client_auth: ClientAuthMode::Require,
            client_cert_presented: true,
        });
        record
    }

    #[test]
    fn test_mutual_ssl_policy_strips_on_plain_tcp() {
        let stripper = UntrustedHeaderStripper::new(TrustPolicy::MutualSslAuth);
        let record = ConnectionRecord::new();
        let mut headers = forwarded_headers();

        let removed = stripper.scrub_first_request(&mut headers, &record);

        assert_eq!(removed, 4);
        assert!(headers.first("x-forwarded-for").is_none());
        assert!(headers.first("x-real-ip").is_none());
        assert_eq!(headers.first("host"), Some("api.example.com"));
    }

    #[test]
    fn test_mutual_ssl_policy_keeps_for_verified_client() {
        let stripper = UntrustedHeaderStripper::new(TrustPolicy::MutualSslAuth);
        let record = mutual_tls_record();
        let mut headers = forwarded_headers();

        assert_eq!(stripper.scrub_first_request(&mut headers, &record), 0);
        assert_eq!(headers.first("x-forwarded-for"), Some("1.2.3.4"));
    }

    #[test]
    fn test_mutual_ssl_policy_strips_when_cert_only_wanted() {
        let stripper = UntrustedHeaderStripper::new(TrustPolicy::MutualSslAuth);
        let mut record = ConnectionRecord::new();
        record.record_ssl_handshake(SslHandshakeInfo {
            protocol: "TLSv1.3".into(),
            cipher_suite: "TLS_AES_256_GCM_SHA384".into(),
            client_auth: ClientAuthMode::Want,
            client_cert_presented: true,
        });
        let mut headers = forwarded_headers();

        assert!(stripper.scrub_first_request(&mut headers, &record) > 0);
    }

    #[test]
    fn test_always_policy_never_strips() {
        let stripper = UntrustedHeaderStripper::new(TrustPolicy::Always);
        let record = ConnectionRecord::new();
        let mut headers = forwarded_headers();

        assert_eq!(stripper.scrub_first_request(&mut headers, &record), 0);
        assert_eq!(headers.first("x-forwarded-proto"), Some("https"));
    }

    #[test]
    fn test_never_policy_always_strips() {
        let stripper = UntrustedHeaderStripper::new(TrustPolicy::Never);
        let record = mutual_tls_record();
        let mut headers = forwarded_headers();

        assert!(stripper.scrub_first_request(&mut headers, &record) > 0);
        assert!(headers.first("x-forwarded-for").is_none());
    }

    #[test]
    fn test_second_request_passes_untouched() {
        let stripper = UntrustedHeaderStripper::new(TrustPolicy::Never);
        let mut record = ConnectionRecord::new();
        record.mark_request_started();

        let mut headers = forwarded_headers();
        assert_eq!(stripper.scrub_first_request(&mut headers, &record), 0);
        assert_eq!(headers.first("x-forwarded-for"), Some("1.2.3.4"));
    }
}

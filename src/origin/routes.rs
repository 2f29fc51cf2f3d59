//! Stock routing filter
//!
//! Routes every request to one configured origin. Runs late in the
//! inbound chain so user filters get first pick; a request already
//! routed (or short-circuited) passes through untouched. Anything more
//! selective than this is a user filter's job.

use async_trait::async_trait;
use tracing::trace;

use crate::filter::{Filter, FilterResult, FilterSyncType, FilterType, RequestFilter};
use crate::message::{HttpMessage, HttpRequestMessage};
use crate::types::OriginName;

/// Late in the inbound chain, after user filters
const ROUTES_ORDER: i32 = 1000;

/// Inbound filter routing everything to a single origin
pub struct StaticRoutes {
    origin: OriginName,
}

impl StaticRoutes {
    #[must_use]
    pub fn new(origin: OriginName) -> Self {
        Self { origin }
    }
}

impl Filter for StaticRoutes {
    fn name(&self) -> &str {
        "Routes"
    }

    fn order(&self) -> i32 {
        ROUTES_ORDER
    }

    fn filter_type(&self) -> FilterType {
        FilterType::Inbound
    }

    fn sync_type(&self) -> FilterSyncType {
        FilterSyncType::Sync
    }
}

#[async_trait]
impl RequestFilter for StaticRoutes {
    async fn apply(&self, request: &mut HttpRequestMessage) -> FilterResult {
        let context = request.context();
        if context.routed_origin().is_some() {
            return Ok(());
        }
        context.set_routed_origin(self.origin.clone());
        trace!(origin = %self.origin, path = request.path(), "routed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::test_support::new_test_context;
    use crate::message::{Headers, HttpQueryParams};
    use std::sync::Arc;

    fn new_request() -> HttpRequestMessage {
        HttpRequestMessage::new(
            new_test_context(),
            "HTTP/1.1",
            "GET",
            "/widgets",
            HttpQueryParams::new(),
            Headers::new(),
            "203.0.113.9",
            "http",
            7001,
            "edge",
        )
    }

    fn origin(name: &str) -> OriginName {
        OriginName::new(name.to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_routes_unrouted_request() {
        let filter = StaticRoutes::new(origin("api"));
        let mut request = new_request();

        filter.apply(&mut request).await.unwrap();
        assert_eq!(
            request.context().routed_origin(),
            Some(origin("api"))
        );
    }

    #[tokio::test]
    async fn test_earlier_routing_wins() {
        let filter = StaticRoutes::new(origin("api"));
        let mut request = new_request();
        request.context().set_routed_origin(origin("payments"));

        filter.apply(&mut request).await.unwrap();
        assert_eq!(
            request.context().routed_origin(),
            Some(origin("payments"))
        );
    }

    #[test]
    fn test_runs_after_default_ordered_filters() {
        let filter = StaticRoutes::new(origin("api"));
        assert_eq!(filter.name(), "Routes");
        assert_eq!(Arc::new(filter).order(), ROUTES_ORDER);
    }
}

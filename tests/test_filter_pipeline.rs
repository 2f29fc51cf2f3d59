//! Filter pipeline behavior against a live server
//!
//! Filters registered through the server's registry handle take effect on
//! the next request without a restart, as do the per-filter dynamic
//! properties. These tests drive both through real client sockets.


use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::error::TryRecvError;

use edge_proxy::config::keys;
use edge_proxy::filter::{Filter, FilterResult, FilterType, RequestFilter};
use edge_proxy::message::{HttpMessage, HttpRequestMessage, StaticResponse};
use edge_proxy::ProxyServer;

use test_helpers::{find_available_port, get, proxy_config, spawn_mock_origin, start_proxy};

/// Adds a marker header to every request bound for the origin
struct StampHeader;

impl Filter for StampHeader {
    fn name(&self) -> &str {
        "StampHeader"
    }

    fn order(&self) -> i32 {
        10
    }

    fn filter_type(&self) -> FilterType {
        FilterType::Inbound
    }
}

#[async_trait]
impl RequestFilter for StampHeader {
    async fn apply(&self, request: &mut HttpRequestMessage) -> FilterResult {
        request.headers_mut().set("x-edge-stamp", "on");
        Ok(())
    }
}

/// Rejects admin paths with a static 403 before routing runs
struct AdminGate;

impl Filter for AdminGate {
    fn name(&self) -> &str {
        "AdminGate"
    }

    fn order(&self) -> i32 {
        -10
    }

    fn filter_type(&self) -> FilterType {
        FilterType::Inbound
    }
}

#[async_trait]
impl RequestFilter for AdminGate {
    fn should_filter(&self, request: &HttpRequestMessage) -> bool {
        request.path().starts_with("/admin")
    }

    async fn apply(&self, request: &mut HttpRequestMessage) -> FilterResult {
        request
            .context()
            .set_static_response(StaticResponse::new(403, "denied"));
        request.context().set_stop_filter_processing(true);
        Ok(())
    }
}

#[tokio::test]
async fn test_registered_inbound_filter_mutates_origin_request() -> Result<()> {
    let mut origin = spawn_mock_origin("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
    let port = find_available_port().await;
    let addr = format!("127.0.0.1:{port}");

    let server = ProxyServer::builder(proxy_config(port, origin.port)).build()?;
    server.filters().register_inbound(std::sync::Arc::new(StampHeader));
    let (stop, handle) = start_proxy(server, &addr).await;

    let response = get(&addr, "/").await?;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {response}");

    let head = origin.heads.recv().await.unwrap();
    assert!(
        head.contains("x-edge-stamp: on"),
        "Origin should see the stamped header, got: {head}"
    );

    let _ = stop.send(());
    tokio::time::timeout(Duration::from_secs(5), handle).await???;
    Ok(())
}

#[tokio::test]
async fn test_disable_property_skips_filter_without_restart() -> Result<()> {
    let mut origin = spawn_mock_origin("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
    let port = find_available_port().await;
    let addr = format!("127.0.0.1:{port}");

    let server = ProxyServer::builder(proxy_config(port, origin.port)).build()?;
    server.filters().register_inbound(std::sync::Arc::new(StampHeader));
    let properties = std::sync::Arc::clone(server.properties());
    let (stop, handle) = start_proxy(server, &addr).await;

    get(&addr, "/first").await?;
    let stamped = origin.heads.recv().await.unwrap();
    assert!(stamped.contains("x-edge-stamp: on"), "got: {stamped}");

    properties.set_bool(keys::filter_disable("StampHeader", "inbound"), true);

    get(&addr, "/second").await?;
    let bare = origin.heads.recv().await.unwrap();
    assert!(
        !bare.contains("x-edge-stamp"),
        "Disabled filter must not run, got: {bare}"
    );

    let _ = stop.send(());
    tokio::time::timeout(Duration::from_secs(5), handle).await???;
    Ok(())
}

#[tokio::test]
async fn test_filter_registered_while_running_applies_to_next_request() -> Result<()> {
    let mut origin = spawn_mock_origin("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
    let port = find_available_port().await;
    let addr = format!("127.0.0.1:{port}");

    let server = ProxyServer::builder(proxy_config(port, origin.port)).build()?;
    let filters = server.filters().clone();
    let (stop, handle) = start_proxy(server, &addr).await;

    get(&addr, "/before").await?;
    let before = origin.heads.recv().await.unwrap();
    assert!(!before.contains("x-edge-stamp"), "got: {before}");

    filters.register_inbound(std::sync::Arc::new(StampHeader));

    get(&addr, "/after").await?;
    let after = origin.heads.recv().await.unwrap();
    assert!(
        after.contains("x-edge-stamp: on"),
        "Filter registered at runtime should apply, got: {after}"
    );

    let _ = stop.send(());
    tokio::time::timeout(Duration::from_secs(5), handle).await???;
    Ok(())
}

#[tokio::test]
async fn test_path_gated_filter_short_circuits_before_origin() -> Result<()> {
    let mut origin = spawn_mock_origin("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
    let port = find_available_port().await;
    let addr = format!("127.0.0.1:{port}");

    let server = ProxyServer::builder(proxy_config(port, origin.port)).build()?;
    server.filters().register_inbound(std::sync::Arc::new(AdminGate));
    let (stop, handle) = start_proxy(server, &addr).await;

    let denied = get(&addr, "/admin/users").await?;
    assert!(
        denied.starts_with("HTTP/1.1 403"),
        "Gate should answer without the origin, got: {denied}"
    );
    assert!(denied.ends_with("denied"), "got: {denied}");
    assert!(
        matches!(origin.heads.try_recv(), Err(TryRecvError::Empty)),
        "origin must not see the gated request"
    );

    let allowed = get(&addr, "/profile").await?;
    assert!(allowed.starts_with("HTTP/1.1 200 OK"), "got: {allowed}");
    let head = origin.heads.recv().await.unwrap();
    assert!(head.starts_with("GET /profile"), "got: {head}");

    let _ = stop.send(());
    tokio::time::timeout(Duration::from_secs(5), handle).await???;
    Ok(())
}

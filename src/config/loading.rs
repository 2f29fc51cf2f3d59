//! Configuration loading from files and environment variables
//!
//! This module handles loading configuration from TOML files and environment
//! variables, with environment variables taking precedence for Docker/container
//! deployments.

use anyhow::{Context, Result};
use std::path::Path;

use super::defaults;
use super::types::{Config, ListenerConfig, OriginConfig, OriginServerConfig};
use crate::types::{HostName, OriginName, Port};

/// Load origin server overrides from environment variables
///
/// Supports indexed environment variables for Docker/container deployments:
/// - `EDGE_ORIGIN_SERVER_0_HOST`, `EDGE_ORIGIN_SERVER_0_PORT`
/// - `EDGE_ORIGIN_SERVER_1_HOST`, `EDGE_ORIGIN_SERVER_1_PORT`
/// - etc.
///
/// When present these replace the server list of the first configured
/// origin, which covers the common single-origin container deployment.
fn load_origin_servers_from_env() -> Result<Option<Vec<OriginServerConfig>>> {
    let mut servers = Vec::new();
    let mut index = 0;

    loop {
        let host_key = format!("EDGE_ORIGIN_SERVER_{}_HOST", index);
        let host = match std::env::var(&host_key) {
            Ok(h) => h,
            Err(_) => break,
        };
        let host = HostName::new(host)
            .with_context(|| format!("Invalid host in environment variable '{}'", host_key))?;

        let port_key = format!("EDGE_ORIGIN_SERVER_{}_PORT", index);
        let port = match std::env::var(&port_key) {
            Ok(p) => p
                .parse::<Port>()
                .with_context(|| format!("Invalid port in environment variable '{}'", port_key))?,
            Err(_) => Port::HTTP,
        };

        servers.push(OriginServerConfig {
            host,
            port,
            tls_profile: None,
        });

        index += 1;
    }

    if servers.is_empty() {
        Ok(None)
    } else {
        Ok(Some(servers))
    }
}

/// Load configuration from a TOML file, with environment variable overrides
///
/// Environment variables for origin servers take precedence over the config
/// file so container deployments can repoint the proxy without rewriting
/// the file:
/// - `EDGE_ORIGIN_SERVER_0_HOST`, `EDGE_ORIGIN_SERVER_0_PORT`
/// - `EDGE_ORIGIN_SERVER_1_HOST`, `EDGE_ORIGIN_SERVER_1_PORT`
/// - etc.
pub fn load_config(config_path: &str) -> Result<Config> {
    let config_content = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", config_path, e))?;

    let mut config: Config = toml::from_str(&config_content)
        .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", config_path, e))?;

    if let Some(env_servers) = load_origin_servers_from_env()? {
        match config.origins.first_mut() {
            Some(origin) => {
                tracing::info!(
                    origin = %origin.name,
                    count = env_servers.len(),
                    "Using origin server(s) from environment variables (overriding config file)"
                );
                origin.servers = env_servers;
            }
            None => {
                tracing::info!(
                    count = env_servers.len(),
                    "Creating 'default' origin from environment variables"
                );
                config.origins.push(origin_from_servers(
                    OriginName::new("default".to_string())?,
                    env_servers,
                ));
            }
        }
    }

    config.validate()?;

    Ok(config)
}

/// Load configuration from a TOML file, writing a default file first if none
/// exists
///
/// Keeps first-run ergonomics simple: start the proxy once, edit the
/// generated file, restart.
pub fn load_or_create_config(config_path: &str) -> Result<Config> {
    if !Path::new(config_path).exists() {
        let config = create_default_config();
        let rendered =
            toml::to_string_pretty(&config).context("Failed to serialize default configuration")?;
        std::fs::write(config_path, rendered).map_err(|e| {
            anyhow::anyhow!(
                "Failed to write default config file '{}': {}",
                config_path,
                e
            )
        })?;
        tracing::info!("Created default config file at '{}'", config_path);
    }

    load_config(config_path)
}

/// Create a default configuration for examples/testing
#[must_use]
pub fn create_default_config() -> Config {
    Config {
        listeners: vec![ListenerConfig::default()],
        origins: vec![origin_from_servers(
            OriginName::new("default".to_string()).expect("static origin name is valid"),
            vec![OriginServerConfig {
                host: HostName::new("origin.example.com".to_string())
                    .expect("static host name is valid"),
                port: Port::HTTP,
                tls_profile: None,
            }],
        )],
        ..Default::default()
    }
}

fn origin_from_servers(name: OriginName, servers: Vec<OriginServerConfig>) -> OriginConfig {
    OriginConfig {
        name,
        servers,
        max_connections_per_server: defaults::max_connections_per_server(),
        max_retries: defaults::max_retries(),
        retryable_statuses: defaults::retryable_statuses(),
        connect_timeout: defaults::origin_connect_timeout(),
        read_timeout: defaults::origin_read_timeout(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_default_config_is_valid() {
        let config = create_default_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.listeners.len(), 1);
        assert_eq!(config.origins.len(), 1);
    }

    #[test]
    fn test_default_config_toml_roundtrip() {
        let config = create_default_config();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_load_or_create_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge-proxy.toml");
        let path_str = path.to_str().unwrap();

        assert!(!path.exists());
        let config = load_or_create_config(path_str).unwrap();
        assert!(path.exists());
        assert_eq!(config.origins[0].name.as_str(), "default");

        // Second load reads the file it just wrote
        let again = load_or_create_config(path_str).unwrap();
        assert_eq!(again, config);
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config("/nonexistent/path/edge-proxy.toml");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Failed to read"));
    }
}

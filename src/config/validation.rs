//! Configuration validation
//!
//! This module provides validation logic for the configuration to ensure
//! all settings are valid before the proxy starts.

use anyhow::Result;
use std::collections::HashSet;

use super::types::{Config, OriginConfig};

impl Config {
    /// Validate configuration for correctness
    ///
    /// Most validations are enforced by the type system (NonZero types,
    /// validated strings). This checks the remaining semantic constraints:
    /// - At least one listener and one origin configured
    /// - No duplicate listener ports or origin names
    /// - Each origin has at least one server and a usable attempt budget
    pub fn validate(&self) -> Result<()> {
        if self.listeners.is_empty() {
            return Err(anyhow::anyhow!(
                "Configuration must have at least one listener"
            ));
        }

        let mut ports = HashSet::new();
        for listener in &self.listeners {
            if !ports.insert(listener.port) {
                return Err(anyhow::anyhow!(
                    "Duplicate listener port: {}",
                    listener.port
                ));
            }
        }

        if self.origins.is_empty() {
            return Err(anyhow::anyhow!(
                "Configuration must have at least one origin"
            ));
        }

        let mut names = HashSet::new();
        for origin in &self.origins {
            if !names.insert(origin.name.as_str()) {
                return Err(anyhow::anyhow!("Duplicate origin name: '{}'", origin.name));
            }
            validate_origin(origin, self)?;
        }

        Ok(())
    }
}

/// Validate a single origin configuration
fn validate_origin(origin: &OriginConfig, config: &Config) -> Result<()> {
    if origin.servers.is_empty() {
        return Err(anyhow::anyhow!(
            "Origin '{}' must have at least one server",
            origin.name
        ));
    }

    if origin.max_retries == 0 {
        return Err(anyhow::anyhow!(
            "Origin '{}' has max_retries = 0; the budget counts attempts, so 0 would never contact the origin",
            origin.name
        ));
    }

    for status in &origin.retryable_statuses {
        if !(100..=599).contains(status) {
            return Err(anyhow::anyhow!(
                "Origin '{}' has invalid retryable status: {}",
                origin.name,
                status
            ));
        }
    }

    // The request deadline fires before an overlong read timeout ever would
    if origin.read_timeout > config.timeouts.request_deadline {
        tracing::warn!(
            "Origin '{}' has read_timeout {:?} longer than the request deadline {:?}; \
             the deadline will cut reads short",
            origin.name,
            origin.read_timeout,
            config.timeouts.request_deadline
        );
    }

    Ok(())
}

//! Configuration module
//!
//! This module handles all static configuration types and loading for the
//! edge proxy, plus the dynamic property registry consulted at request time.

mod defaults;
pub mod dynamic;
mod loading;
mod types;
mod validation;

// Re-export public types
pub use dynamic::{DynamicProperties, keys};
pub use loading::{create_default_config, load_config, load_or_create_config};
pub use types::{
    ClientAuthMode, Config, IngressConfig, ListenerConfig, OriginConfig, OriginConfigBuilder,
    OriginServerConfig, ServerSettings, TimeoutConfig, TrustPolicy,
};

// Re-export default functions for use in tests and other modules
pub use defaults::{
    max_connections_per_server, max_retries, origin_connect_timeout, origin_read_timeout,
    request_deadline, retryable_statuses, shutdown_drain,
};

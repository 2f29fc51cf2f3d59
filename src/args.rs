//! Command-line argument parsing for the proxy binary
//!
//! Every flag overrides the corresponding field of a loaded
//! [`Config`], so a fleet can share one config file and vary the rest
//! per instance through the environment.

use std::path::PathBuf;

use clap::Parser;

use crate::config::Config;
use crate::types::{Port, ThreadCount};

/// Parse port from command line argument
fn parse_port(s: &str) -> Result<Port, String> {
    let port: u16 = s.parse().map_err(|e| format!("invalid port number: {e}"))?;
    Port::new(port).ok_or_else(|| "port must be non-zero".to_string())
}

/// Parse worker count from command line argument
fn parse_threads(s: &str) -> Result<ThreadCount, String> {
    let count: usize = s.parse().map_err(|e| format!("invalid thread count: {e}"))?;
    ThreadCount::new(count).ok_or_else(|| "thread count must be non-zero".to_string())
}

/// Command-line arguments for the proxy binary
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path (created with defaults when missing)
    #[arg(short, long, default_value = "edge-proxy.toml", env = "EDGE_CONFIG")]
    pub config: PathBuf,

    /// Port for the first listener (overrides config file)
    #[arg(short, long, env = "EDGE_PORT", value_parser = parse_port)]
    pub port: Option<Port>,

    /// Host to bind the first listener to (overrides config file)
    #[arg(long, env = "EDGE_HOST")]
    pub host: Option<String>,

    /// Number of worker event-loops (overrides config file)
    #[arg(short, long, env = "EDGE_THREADS", value_parser = parse_threads)]
    pub threads: Option<ThreadCount>,

    /// Log file path (overrides config file)
    #[arg(long, env = "EDGE_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl Args {
    /// Fold command-line overrides into a loaded configuration
    ///
    /// Host and port apply to the first listener only, matching the
    /// common single-listener deployment; additional listeners are
    /// configured through the file.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(listener) = config.listeners.first_mut() {
            if let Some(port) = self.port {
                listener.port = port;
            }
            if let Some(host) = &self.host {
                listener.host = host.clone();
            }
        }
        if let Some(threads) = self.threads {
            config.server.threads = threads;
        }
        if let Some(log_file) = &self.log_file {
            config.server.log_file = log_file.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::create_default_config;

    // Helper to create default args for testing
    fn default_args() -> Args {
        Args {
            config: PathBuf::from("edge-proxy.toml"),
            port: None,
            host: None,
            threads: None,
            log_file: None,
        }
    }

    #[test]
    fn test_parse_port_valid() {
        assert_eq!(parse_port("7001").unwrap().get(), 7001);
    }

    #[test]
    fn test_parse_port_invalid() {
        assert!(parse_port("0").is_err());
        assert!(parse_port("70000").is_err());
        assert!(parse_port("not-a-port").is_err());
    }

    #[test]
    fn test_parse_threads() {
        assert_eq!(parse_threads("4").unwrap().get(), 4);
        assert!(parse_threads("0").is_err());
        assert!(parse_threads("-1").is_err());
    }

    #[test]
    fn test_no_overrides_leaves_config_untouched() {
        let mut config = create_default_config();
        let before = config.clone();

        default_args().apply_to(&mut config);

        assert_eq!(config, before);
    }

    #[test]
    fn test_port_override_applies_to_first_listener() {
        let mut config = create_default_config();
        let args = Args {
            port: Some(Port::new(9001).unwrap()),
            ..default_args()
        };

        args.apply_to(&mut config);

        assert_eq!(config.listeners[0].port.get(), 9001);
    }

    #[test]
    fn test_host_and_threads_override() {
        let mut config = create_default_config();
        let args = Args {
            host: Some("127.0.0.1".to_string()),
            threads: Some(ThreadCount::new(8).unwrap()),
            ..default_args()
        };

        args.apply_to(&mut config);

        assert_eq!(config.listeners[0].host, "127.0.0.1");
        assert_eq!(config.server.threads.get(), 8);
    }

    #[test]
    fn test_log_file_override() {
        let mut config = create_default_config();
        let args = Args {
            log_file: Some(PathBuf::from("/var/log/edge-proxy.log")),
            ..default_args()
        };

        args.apply_to(&mut config);

        assert_eq!(config.server.log_file, PathBuf::from("/var/log/edge-proxy.log"));
    }
}

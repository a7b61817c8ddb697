use std::time::Duration;

use crate::cli::Cli;
use crate::error::ConfigError;

/// TCP health probing.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Container port to probe; 0 disables probing.
    pub port: u16,
    /// Host the published port is reachable on.
    pub host: String,
    /// Time between probes.
    pub interval: Duration,
    /// Connect timeout for a single probe.
    pub timeout: Duration,
    /// Consecutive failures that mark the container unhealthy.
    pub threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            port: 0,
            host: "127.0.0.1".to_string(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            threshold: 5,
        }
    }
}

impl HealthConfig {
    pub(crate) fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        let host = cli.tcp_health_host.trim();
        if cli.tcp_health_port != 0 && host.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "tcp-health-host".to_string(),
                message: "must be set when --tcp-health-port is".to_string(),
            });
        }

        Ok(Self {
            port: cli.tcp_health_port,
            host: host.to_string(),
            ..Self::default()
        })
    }

    pub fn enabled(&self) -> bool {
        self.port != 0
    }
}

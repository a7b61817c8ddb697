use std::time::Duration;

use crate::cli::Cli;
use crate::error::ConfigError;

/// Registration with vulcand.
#[derive(Debug, Clone)]
pub struct VulcanConfig {
    /// Whether to register at all.
    pub enabled: bool,
    /// etcd directory vulcand watches.
    pub namespace: String,
    /// Host written into the endpoint entry.
    pub public_host: String,
    /// Container port whose published host port is advertised; 0 means none.
    pub public_port: u16,
    /// Lifetime of the endpoint entry; refreshed every half TTL.
    pub ttl: Duration,
}

impl Default for VulcanConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namespace: "vulcand".to_string(),
            public_host: "127.0.0.1".to_string(),
            public_port: 0,
            ttl: Duration::from_secs(10),
        }
    }
}

impl VulcanConfig {
    pub(crate) fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        let namespace = cli.vulcan_namespace.trim().trim_matches('/');
        if cli.register_vulcan && namespace.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "vulcan-namespace".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        Ok(Self {
            enabled: cli.register_vulcan,
            namespace: namespace.to_string(),
            public_host: cli.public_host.trim().to_string(),
            public_port: cli.public_port,
            ..Self::default()
        })
    }
}

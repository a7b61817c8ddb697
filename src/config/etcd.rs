use std::time::Duration;

use url::Url;

use crate::cli::Cli;
use crate::config::helpers::clean_list;
use crate::error::ConfigError;

/// How to reach etcd and where the workload's configuration lives.
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    /// Client endpoints, tried in order.
    pub hosts: Vec<String>,
    /// Prefix holding `tag` and `env`, always starting and ending with `/`.
    pub prefix: String,
    /// Timeout for non-watch requests.
    pub request_timeout: Duration,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["http://127.0.0.1:4001".to_string()],
            prefix: "/forerunner/".to_string(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl EtcdConfig {
    pub(crate) fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        let hosts = clean_list(&cli.etcd_hosts);
        if hosts.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "etcd-hosts".to_string(),
                hint: "pass --etcd-hosts or set FORERUNNER_ETCD_HOSTS".to_string(),
            });
        }
        for host in &hosts {
            validate_host(host)?;
        }

        Ok(Self {
            hosts,
            prefix: normalize_prefix(&cli.config_prefix)?,
            ..Self::default()
        })
    }

    /// Key holding the image tag.
    pub fn tag_key(&self) -> String {
        format!("{}tag", self.prefix)
    }

    /// Key holding the JSON environment object.
    pub fn env_key(&self) -> String {
        format!("{}env", self.prefix)
    }
}

fn validate_host(host: &str) -> Result<(), ConfigError> {
    let url = Url::parse(host).map_err(|e| ConfigError::InvalidValue {
        key: "etcd-hosts".to_string(),
        message: format!("'{}' is not a URL: {}", host, e),
    })?;

    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidValue {
            key: "etcd-hosts".to_string(),
            message: format!("'{}' uses unsupported scheme '{}'", host, other),
        }),
    }
}

/// Ensure the prefix starts and ends with `/`.
fn normalize_prefix(prefix: &str) -> Result<String, ConfigError> {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: "config-prefix".to_string(),
            message: "must name a directory, not the root".to_string(),
        });
    }
    Ok(format!("/{}/", trimmed))
}

//! Static configuration resolved from the command line and environment.
//!
//! The CLI only collects raw values; [`Config::from_cli`] validates them and
//! splits them into one sub-config per component. Timing constants that have
//! no flag live in the sub-configs' `Default` impls.

mod docker;
mod etcd;
mod health;
mod helpers;
mod reconcile;
mod vulcan;

use std::time::Duration;

use crate::bus::Level;
use crate::cli::Cli;
use crate::error::ConfigError;

pub use self::docker::DockerConfig;
pub use self::etcd::EtcdConfig;
pub use self::health::HealthConfig;
pub use self::helpers::parse_duration;
pub use self::reconcile::ReconcileConfig;
pub use self::vulcan::VulcanConfig;

/// Log output settings.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Lowest bus level that is rendered.
    pub level: Level,
    /// Emit JSON lines instead of text.
    pub json: bool,
}

/// Everything the agent needs, validated.
#[derive(Debug, Clone)]
pub struct Config {
    pub group: String,
    pub id: String,
    pub docker: DockerConfig,
    pub etcd: EtcdConfig,
    pub health: HealthConfig,
    pub vulcan: VulcanConfig,
    pub reconcile: ReconcileConfig,
    pub log: LogConfig,
    /// Grace period between broadcasting shutdown and exiting.
    pub shutdown_timeout: Duration,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let group = helpers::required(
            "group",
            cli.group.as_deref(),
            "pass --group or set FORERUNNER_GROUP",
        )?;
        let id = helpers::required("id", cli.id.as_deref(), "pass --id or set FORERUNNER_ID")?;

        Ok(Self {
            group,
            id,
            docker: DockerConfig::resolve(cli)?,
            etcd: EtcdConfig::resolve(cli)?,
            health: HealthConfig::resolve(cli)?,
            vulcan: VulcanConfig::resolve(cli)?,
            reconcile: ReconcileConfig::default(),
            log: LogConfig {
                level: cli.log_level,
                json: cli.log_json,
            },
            shutdown_timeout: cli.shutdown_timeout,
        })
    }

    /// Name of the managed container: `<group>-<id>`.
    pub fn container_name(&self) -> String {
        format!("{}-{}", self.group, self.id)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse(args: &[&str]) -> Result<Config, ConfigError> {
        let mut argv = vec!["forerunner"];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv).unwrap();
        Config::from_cli(&cli)
    }

    #[test]
    fn test_minimal_config() {
        let config = parse(&["--group", "api", "--id", "a1", "--image", "acme/api"]).unwrap();

        assert_eq!(config.container_name(), "api-a1");
        assert_eq!(config.docker.image, "acme/api");
        assert_eq!(config.docker.registry, None);
        assert_eq!(config.etcd.prefix, "/forerunner/");
        assert!(!config.health.enabled());
        assert!(!config.vulcan.enabled);
        assert_eq!(config.vulcan.namespace, "vulcand");
        assert_eq!(config.vulcan.ttl, Duration::from_secs(10));
        assert_eq!(config.reconcile.debounce, Duration::from_secs(2));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.log.level, Level::Info);
    }

    #[test]
    fn test_missing_image_is_rejected() {
        let err = parse(&["--group", "api", "--id", "a1"]).unwrap_err();
        match err {
            ConfigError::MissingRequired { key, .. } => assert_eq!(key, "image"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_blank_group_is_rejected() {
        let err = parse(&["--group", " ", "--id", "a1", "--image", "acme/api"]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { key, .. } if key == "group"));
    }

    #[test]
    fn test_prefix_is_normalized() {
        let config = parse(&[
            "--group",
            "api",
            "--id",
            "a1",
            "--image",
            "acme/api",
            "--config-prefix",
            "apps/api",
        ])
        .unwrap();
        assert_eq!(config.etcd.tag_key(), "/apps/api/tag");
    }

    #[test]
    fn test_bad_etcd_host_is_rejected() {
        let err = parse(&[
            "--group",
            "api",
            "--id",
            "a1",
            "--image",
            "acme/api",
            "--etcd-hosts",
            "etcd:4001",
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "etcd-hosts"));
    }
}

//! Command-line interface.
//!
//! Every flag can also come from the environment (or a `.env` file loaded
//! before parsing). Anything after the flags, or after `--`, is passed to the
//! container as its command.

use std::time::Duration;

use clap::{ColorChoice, Parser};

use crate::bus::Level;
use crate::config::parse_duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "forerunner")]
#[command(about = "Keep one container running from etcd configuration and register it with vulcand")]
#[command(
    long_about = "Forerunner runs next to a workload on each host. It pulls and restarts the \
workload's container whenever its tag or environment changes under the config prefix in etcd, \
probes it over TCP, and heartbeats its address into vulcand while it is healthy.\nExamples:\n  \
forerunner --group api --id a1 --image acme/api -- serve --port 8080"
)]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    /// Service group this instance belongs to
    #[arg(long, env = "FORERUNNER_GROUP")]
    pub group: Option<String>,

    /// Instance ID, unique within the group
    #[arg(long, env = "FORERUNNER_ID")]
    pub id: Option<String>,

    /// Docker image to run, without tag
    #[arg(long, env = "FORERUNNER_IMAGE")]
    pub image: Option<String>,

    /// Registry to pull the image from
    #[arg(long, env = "FORERUNNER_REGISTRY")]
    pub registry: Option<String>,

    /// DNS servers for the container (comma-separated)
    #[arg(long, env = "FORERUNNER_DNS", value_delimiter = ',')]
    pub dns: Vec<String>,

    /// Docker daemon endpoint
    #[arg(long, env = "DOCKER_HOST", default_value = "unix:///var/run/docker.sock")]
    pub docker_endpoint: String,

    /// etcd endpoints (comma-separated)
    #[arg(
        long,
        env = "FORERUNNER_ETCD_HOSTS",
        value_delimiter = ',',
        default_value = "http://127.0.0.1:4001"
    )]
    pub etcd_hosts: Vec<String>,

    /// etcd prefix holding the `tag` and `env` keys
    #[arg(long, env = "FORERUNNER_CONFIG_PREFIX", default_value = "/forerunner/")]
    pub config_prefix: String,

    /// Container port to probe over TCP (0 disables probing)
    #[arg(long, env = "FORERUNNER_TCP_HEALTH_PORT", default_value_t = 0)]
    pub tcp_health_port: u16,

    /// Host the probed port is published on
    #[arg(long, env = "FORERUNNER_TCP_HEALTH_HOST", default_value = "127.0.0.1")]
    pub tcp_health_host: String,

    /// Register the container with vulcand while it is healthy
    #[arg(long, env = "FORERUNNER_REGISTER_VULCAN")]
    pub register_vulcan: bool,

    /// etcd namespace vulcand reads upstreams from
    #[arg(long, env = "FORERUNNER_VULCAN_NAMESPACE", default_value = "vulcand")]
    pub vulcan_namespace: String,

    /// Host advertised to vulcand
    #[arg(long, env = "FORERUNNER_PUBLIC_HOST", default_value = "127.0.0.1")]
    pub public_host: String,

    /// Container port advertised to vulcand (0 means none)
    #[arg(long, env = "FORERUNNER_PUBLIC_PORT", default_value_t = 0)]
    pub public_port: u16,

    /// Grace period after an interrupt before exiting (e.g. 5s, 500ms, 1m)
    #[arg(
        long,
        env = "FORERUNNER_SHUTDOWN_TIMEOUT",
        default_value = "5s",
        value_parser = parse_duration
    )]
    pub shutdown_timeout: Duration,

    /// Lowest message level to log (debug, info, change, warning, error, fatal)
    #[arg(long, env = "FORERUNNER_LOG_LEVEL", default_value = "info")]
    pub log_level: Level,

    /// Log as JSON lines
    #[arg(long, env = "FORERUNNER_LOG_JSON")]
    pub log_json: bool,

    /// Command and arguments for the container
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

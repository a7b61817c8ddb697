use crate::cli::Cli;
use crate::config::helpers::{clean_list, required};
use crate::error::ConfigError;

/// How to reach Docker and what to run.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Daemon endpoint (`unix://`, `tcp://` or `http://`).
    pub endpoint: String,
    /// Image without tag; the tag comes from etcd.
    pub image: String,
    /// Registry to pull from, if not the default.
    pub registry: Option<String>,
    /// DNS servers handed to the container.
    pub dns: Vec<String>,
    /// Container command.
    pub command: Vec<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            endpoint: "unix:///var/run/docker.sock".to_string(),
            image: String::new(),
            registry: None,
            dns: Vec::new(),
            command: Vec::new(),
        }
    }
}

impl DockerConfig {
    pub(crate) fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        let image = required(
            "image",
            cli.image.as_deref(),
            "pass --image or set FORERUNNER_IMAGE",
        )?;

        Ok(Self {
            endpoint: cli.docker_endpoint.trim().to_string(),
            image,
            registry: cli
                .registry
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string),
            dns: clean_list(&cli.dns),
            command: cli.command.clone(),
        })
    }
}

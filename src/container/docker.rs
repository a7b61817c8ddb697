//! Docker Engine implementation of [`ContainerRuntime`].

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerSummary, HostConfig, Port, PortTypeEnum};
use bollard::{API_DEFAULT_VERSION, Docker};
use futures::StreamExt;

use crate::container::{ContainerRef, ContainerRuntime, ContainerSpec, Result};
use crate::error::ContainerError;

/// Seconds bollard waits on a single API call.
const CLIENT_TIMEOUT_SECS: u64 = 120;

/// Where the Docker daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerEndpoint {
    /// Unix socket path.
    Socket(String),
    /// `tcp://` or `http://` address.
    Http(String),
    /// Whatever bollard picks from the environment.
    LocalDefaults,
}

impl DockerEndpoint {
    pub fn parse(endpoint: &str) -> Self {
        let endpoint = endpoint.trim();
        if let Some(path) = endpoint.strip_prefix("unix://") {
            DockerEndpoint::Socket(path.to_string())
        } else if endpoint.starts_with("tcp://") || endpoint.starts_with("http://") {
            DockerEndpoint::Http(endpoint.to_string())
        } else {
            DockerEndpoint::LocalDefaults
        }
    }
}

/// Connect to the Docker daemon at `endpoint` and check it answers.
pub async fn connect_docker(endpoint: &str) -> Result<Docker> {
    let docker = match DockerEndpoint::parse(endpoint) {
        DockerEndpoint::Socket(path) => {
            Docker::connect_with_socket(&path, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
        }
        DockerEndpoint::Http(addr) => {
            Docker::connect_with_http(&addr, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
        }
        DockerEndpoint::LocalDefaults => Docker::connect_with_local_defaults(),
    }
    .map_err(|e| ContainerError::Unavailable {
        reason: e.to_string(),
    })?;

    docker
        .ping()
        .await
        .map_err(|e| ContainerError::Unavailable {
            reason: format!("{} did not answer ping: {}", endpoint, e),
        })?;

    Ok(docker)
}

/// [`ContainerRuntime`] backed by the Docker Engine API.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect to `endpoint` and wrap the client.
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let docker = connect_docker(endpoint).await?;
        tracing::debug!(endpoint, "Connected to Docker");
        Ok(Self::new(docker))
    }

    async fn find_summary(&self, name: &str) -> Result<ContainerSummary> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| api_error("list containers", name, e))?;

        // The name filter is a substring match, so check for the exact name.
        summaries
            .into_iter()
            .find(|summary| has_name(summary, name))
            .ok_or_else(|| ContainerError::NotFound {
                name: name.to_string(),
            })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull(&self, image: &str, tag: &str, registry: Option<&str>) -> Result<()> {
        let from_image = image_reference(image, registry);
        let options = CreateImageOptions {
            from_image: from_image.clone(),
            tag: tag.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::trace!("Pull status: {}", status);
                    }
                }
                Err(e) => return Err(api_error("pull", &from_image, e)),
            }
        }

        tracing::debug!("Pulled image: {}:{}", from_image, tag);
        Ok(())
    }

    async fn find_by_name(&self, name: &str) -> Result<ContainerRef> {
        let summary = self.find_summary(name).await?;
        let id = summary.id.ok_or_else(|| ContainerError::Api {
            operation: "list containers",
            reason: format!("container '{}' has no ID", name),
        })?;
        Ok(ContainerRef {
            id,
            name: name.to_string(),
        })
    }

    async fn kill_and_remove(&self, id: &str) -> Result<()> {
        match self
            .docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => {}
            // 409: not running, remove it anyway.
            Err(BollardError::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                tracing::debug!(id, "Container not running, removing");
            }
            Err(e) => return Err(api_error("kill", id, e)),
        }

        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| api_error("remove", id, e))
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<ContainerRef> {
        let host_config = HostConfig {
            publish_all_ports: Some(spec.publish_all_ports),
            dns: if spec.dns.is_empty() {
                None
            } else {
                Some(spec.dns.clone())
            },
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| api_error("create", &spec.name, e))?;

        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, "Docker warning: {}", warning);
        }

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| api_error("start", &spec.name, e))?;

        Ok(ContainerRef {
            id: response.id,
            name: spec.name.clone(),
        })
    }

    async fn public_port(&self, name: &str, private_port: u16) -> Result<u16> {
        let summary = self.find_summary(name).await?;
        published_port(summary.ports.as_deref().unwrap_or_default(), private_port).ok_or_else(
            || ContainerError::NoPublicPort {
                name: name.to_string(),
                private_port,
            },
        )
    }
}

/// `[registry/]image`.
fn image_reference(image: &str, registry: Option<&str>) -> String {
    match registry.map(|r| r.trim_end_matches('/')) {
        Some(registry) if !registry.is_empty() => format!("{}/{}", registry, image),
        _ => image.to_string(),
    }
}

fn has_name(summary: &ContainerSummary, name: &str) -> bool {
    summary
        .names
        .iter()
        .flatten()
        .any(|n| n.strip_prefix('/').unwrap_or(n) == name)
}

/// Host port of the first TCP mapping for `private_port`.
fn published_port(ports: &[Port], private_port: u16) -> Option<u16> {
    ports
        .iter()
        .filter(|p| p.private_port == private_port)
        .filter(|p| matches!(p.typ, Some(PortTypeEnum::TCP)))
        .find_map(|p| p.public_port)
}

fn api_error(operation: &'static str, target: &str, e: BollardError) -> ContainerError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => ContainerError::NotFound {
            name: target.to_string(),
        },
        other => ContainerError::Api {
            operation,
            reason: other.to_string(),
        },
    }
}

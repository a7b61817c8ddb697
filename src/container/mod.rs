//! Container runtime capability.
//!
//! The reconciliation engine, the TCP health probe and the registration
//! engine only ever talk to the runtime through [`ContainerRuntime`].
//! [`DockerRuntime`] implements it against the Docker Engine API.
//!
//! # Restart workflow
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────────┐     ┌──────────────────┐
//! │ pull(image,  │────▶│ find_by_name │────▶│ kill_and_remove  │────▶│ create_and_start │
//! │      tag)    │     │ (group-id)   │     │ (if present)     │     │ (publish all)    │
//! └──────────────┘     └──────────────┘     └──────────────────┘     └──────────────────┘
//!                                                                              │
//!                                                                              ▼
//!                                                                    ┌──────────────────┐
//!                                                                    │ public_port(name,│
//!                                                                    │   private port)  │
//!                                                                    └──────────────────┘
//! ```

pub mod docker;

use async_trait::async_trait;

use crate::error::ContainerError;

pub use docker::{DockerRuntime, connect_docker};

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, ContainerError>;

/// Handle to an existing container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    /// Runtime-assigned ID.
    pub id: String,
    /// Container name without the leading slash.
    pub name: String,
}

/// Everything needed to create the workload container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name (`group-id`).
    pub name: String,
    /// Full image reference including tag.
    pub image: String,
    /// Environment as `KEY=value` entries.
    pub env: Vec<String>,
    /// Arguments passed as the container command.
    pub command: Vec<String>,
    /// DNS servers for the container.
    pub dns: Vec<String>,
    /// Publish every exposed port on a random host port.
    pub publish_all_ports: bool,
}

/// Operations the agent needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull `image:tag`, optionally from a specific registry.
    async fn pull(&self, image: &str, tag: &str, registry: Option<&str>) -> Result<()>;

    /// Find a container (running or not) by exact name.
    async fn find_by_name(&self, name: &str) -> Result<ContainerRef>;

    /// Kill a container and remove it.
    ///
    /// Returns [`ContainerError::NotFound`] when it is already gone.
    async fn kill_and_remove(&self, id: &str) -> Result<()>;

    /// Create a container from `spec` and start it.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<ContainerRef>;

    /// Host port published for `private_port`/tcp of the named container.
    async fn public_port(&self, name: &str, private_port: u16) -> Result<u16>;
}

//! Container runtime seam.
//!
//! The controller, output reader and sweeper only talk to the runtime through
//! [`ContainerRuntime`]. The production implementation lives in
//! [`crate::docker`]; tests use an in-memory fake.

use std::{collections::BTreeMap, time::Duration};

use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    /// The runtime reported the resource is already in the requested state
    /// (e.g. starting a started container).
    #[error("not modified: {0}")]
    NotModified(String),
    #[error("runtime api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("runtime transport error: {0}")]
    Transport(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortProtocol {
    Tcp,
    Udp,
}

impl PortProtocol {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" => Some(PortProtocol::Tcp),
            "udp" => Some(PortProtocol::Udp),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PortProtocol::Tcp => "tcp",
            PortProtocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: PortProtocol,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host_path: String,
    pub container_path: String,
}

#[derive(Debug, Clone)]
pub struct NetworkSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub binds: Vec<BindMount>,
    pub network: Option<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub exit_code: Option<i64>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ResourceSummary {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// Live stdio connection to a container.
///
/// `output` yields the raw multiplexed stream: 8-byte frame headers followed
/// by payloads (see [`crate::frames`]).
pub struct Attachment {
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Returns the network id. `Conflict` when the name is taken.
    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, RuntimeError>;
    async fn find_network(&self, name: &str) -> Result<Option<String>, RuntimeError>;
    async fn remove_network(&self, name_or_id: &str) -> Result<(), RuntimeError>;
    async fn list_networks(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ResourceSummary>, RuntimeError>;

    /// Returns the container id. `Conflict` when the name is taken,
    /// `ImageNotFound` when the image is not present locally.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;
    async fn start_container(&self, name_or_id: &str) -> Result<(), RuntimeError>;
    /// A zero timeout kills immediately.
    async fn stop_container(&self, name_or_id: &str, timeout: Duration)
    -> Result<(), RuntimeError>;
    async fn remove_container(&self, name_or_id: &str) -> Result<(), RuntimeError>;
    async fn inspect_container(&self, name_or_id: &str) -> Result<ContainerInfo, RuntimeError>;
    /// All containers (running or not) carrying every given label.
    async fn list_containers(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ResourceSummary>, RuntimeError>;

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;
    async fn attach(&self, name_or_id: &str) -> Result<Attachment, RuntimeError>;
}

pub mod client;
pub mod commands;

use async_trait::async_trait;

pub use client::BollardRuntime;

/// Label docker compose stamps with the project name.
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
/// Label docker compose stamps with the service name.
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// Failures talking to the container runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("docker {operation} failed: {source}")]
    Api {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("exec in container {container} finished without an exit code")]
    MissingExitCode { container: String },
}

impl RuntimeError {
    pub fn api(operation: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self::Api {
            operation,
            source: source.into(),
        }
    }
}

/// A runtime network and the gateways of its IPAM configuration, in order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    pub name: String,
    pub gateways: Vec<String>,
}

/// One row of a container's live port table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortMapping {
    pub private_port: u16,
    pub public_port: Option<u16>,
}

/// The running container backing a compose service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceContainer {
    pub id: String,
    pub network_mode: Option<String>,
    pub ports: Vec<PortMapping>,
}

impl ServiceContainer {
    #[must_use]
    pub fn uses_host_network(&self) -> bool {
        self.network_mode.as_deref() == Some("host")
    }
}

/// Container runtime operations used by the compose runner.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Daemon endpoint, for diagnostics.
    fn daemon_host(&self) -> String;

    async fn ping(&self) -> Result<(), RuntimeError>;

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>, RuntimeError>;

    /// Create an attachable network carrying `labels` and return it.
    async fn create_network(
        &self,
        name: &str,
        labels: &[(&str, &str)],
    ) -> Result<NetworkInfo, RuntimeError>;

    /// Running container of `service` in compose project `project`.
    async fn find_service_container(
        &self,
        project: &str,
        service: &str,
    ) -> Result<Option<ServiceContainer>, RuntimeError>;

    /// Run `command` inside the container and return its exit code.
    async fn exec(&self, container_id: &str, command: Vec<String>) -> Result<i64, RuntimeError>;
}

/// True when this process itself runs inside a container.
#[must_use]
pub fn in_container() -> bool {
    std::path::Path::new("/.dockerenv").exists()
}

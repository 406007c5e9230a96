use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
    Docker,
    container::ListContainersOptions,
    exec::{CreateExecOptions, StartExecResults},
    models::Network,
    network::{CreateNetworkOptions, InspectNetworkOptions, ListNetworksOptions},
};
use futures::StreamExt as _;
use infra_e2e_core::constants::DEFAULT_EXEC_POLL_INTERVAL;
use tokio::time::sleep;
use tracing::debug;

use super::{
    COMPOSE_PROJECT_LABEL, COMPOSE_SERVICE_LABEL, ContainerRuntime, NetworkInfo, PortMapping,
    RuntimeError, ServiceContainer,
};

/// [`ContainerRuntime`] backed by the local docker daemon.
#[derive(Clone, Debug)]
pub struct BollardRuntime {
    docker: Docker,
}

impl BollardRuntime {
    /// Connect using `DOCKER_HOST` or the platform socket.
    pub fn connect() -> Result<Self, RuntimeError> {
        Docker::connect_with_local_defaults()
            .map(|docker| Self { docker })
            .map_err(|source| RuntimeError::api("connect", source))
    }

    #[must_use]
    pub const fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerRuntime for BollardRuntime {
    fn daemon_host(&self) -> String {
        std::env::var("DOCKER_HOST").unwrap_or_else(|_| "unix:///var/run/docker.sock".to_owned())
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|source| RuntimeError::api("ping", source))
    }

    async fn list_networks(&self) -> Result<Vec<NetworkInfo>, RuntimeError> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await
            .map_err(|source| RuntimeError::api("network list", source))?;

        Ok(networks.into_iter().map(network_info).collect())
    }

    async fn create_network(
        &self,
        name: &str,
        labels: &[(&str, &str)],
    ) -> Result<NetworkInfo, RuntimeError> {
        let options = CreateNetworkOptions {
            name,
            attachable: true,
            labels: labels.iter().copied().collect::<HashMap<_, _>>(),
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .map_err(|source| RuntimeError::api("network create", source))?;

        let network = self
            .docker
            .inspect_network(
                name,
                Some(InspectNetworkOptions {
                    verbose: true,
                    scope: "local",
                }),
            )
            .await
            .map_err(|source| RuntimeError::api("network inspect", source))?;

        Ok(network_info(network))
    }

    async fn find_service_container(
        &self,
        project: &str,
        service: &str,
    ) -> Result<Option<ServiceContainer>, RuntimeError> {
        let filters = HashMap::from([(
            "label".to_owned(),
            vec![
                format!("{COMPOSE_PROJECT_LABEL}={project}"),
                format!("{COMPOSE_SERVICE_LABEL}={service}"),
            ],
        )]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|source| RuntimeError::api("container list", source))?;

        Ok(containers.into_iter().next().map(|summary| ServiceContainer {
            id: summary.id.unwrap_or_default(),
            network_mode: summary.host_config.and_then(|config| config.network_mode),
            ports: summary
                .ports
                .unwrap_or_default()
                .into_iter()
                .map(|port| PortMapping {
                    private_port: port.private_port,
                    public_port: port.public_port,
                })
                .collect(),
        }))
    }

    async fn exec(&self, container_id: &str, command: Vec<String>) -> Result<i64, RuntimeError> {
        let created = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(command),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|source| RuntimeError::api("exec create", source))?;

        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&created.id, None)
            .await
            .map_err(|source| RuntimeError::api("exec start", source))?
        {
            while let Some(chunk) = output.next().await {
                if let Ok(chunk) = chunk {
                    debug!(container = container_id, output = %chunk, "exec output");
                }
            }
        }

        loop {
            let inspect = self
                .docker
                .inspect_exec(&created.id)
                .await
                .map_err(|source| RuntimeError::api("exec inspect", source))?;

            if inspect.running != Some(true) {
                return inspect
                    .exit_code
                    .ok_or_else(|| RuntimeError::MissingExitCode {
                        container: container_id.to_owned(),
                    });
            }
            sleep(DEFAULT_EXEC_POLL_INTERVAL).await;
        }
    }
}

fn network_info(network: Network) -> NetworkInfo {
    let gateways = network
        .ipam
        .and_then(|ipam| ipam.config)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|config| config.gateway)
        .collect();

    NetworkInfo {
        name: network.name.unwrap_or_default(),
        gateways,
    }
}

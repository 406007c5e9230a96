use std::time::Duration;

use infra_e2e_core::{ConfigError, DynError, EnvError};

use crate::{
    descriptor::DescriptorError,
    docker::{RuntimeError, commands::ComposeCommandError},
    infrastructure::network::NetworkError,
    lifecycle::readiness::ProbeError,
};

#[derive(Debug, thiserror::Error)]
/// Top-level compose runner errors.
pub enum ComposeRunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("docker does not appear to be available on this host: {source}")]
    DockerUnavailable {
        #[source]
        source: RuntimeError,
    },
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Compose(#[from] ComposeCommandError),
    #[error("failed to resolve host port for {service} container port {container_port}: {source}")]
    PortResolution {
        service: String,
        container_port: u16,
        #[source]
        source: anyhow::Error,
    },
    #[error("readiness probe for {service} container port {container_port} failed: {source}")]
    Probe {
        service: String,
        container_port: u16,
        #[source]
        source: ProbeError,
    },
    #[error("probe task failed: {source}")]
    ProbeTask {
        #[source]
        source: tokio::task::JoinError,
    },
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error("verification steps failed: {source}")]
    Steps {
        #[source]
        source: DynError,
    },
    #[error("{stage} did not complete within {timeout:?}")]
    Timeout {
        stage: &'static str,
        timeout: Duration,
    },
}

//! Top-level entry point: selects the backend named by an
//! [`EnvironmentSpec`], brings the environment up and hands back an owned
//! handle whose [`RunningEnvironment::teardown`] removes it again.

use std::path::Path;

use infra_e2e_core::{BackendKind, ConfigError, EnvironmentSpec, StepRunner};
use infra_e2e_runner_compose::{
    ComposeCommandError, ComposeEnvironment, ComposeOrchestrator, ComposeRunnerError,
};
use infra_e2e_runner_k8s::{ClusterProvisioner, K8sRunnerError, KindEnvironment, ProviderError};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Compose(#[from] ComposeRunnerError),
    #[error(transparent)]
    Cluster(#[from] K8sRunnerError),
    #[error("compose teardown failed: {source}")]
    ComposeTeardown {
        #[source]
        source: ComposeCommandError,
    },
    #[error("cluster teardown failed: {source}")]
    ClusterTeardown {
        #[source]
        source: ProviderError,
    },
}

/// A live environment owned by the caller until teardown.
pub enum RunningEnvironment {
    Compose(ComposeEnvironment),
    /// `None` when no steps were declared and no cluster was created.
    Cluster(Option<KindEnvironment>),
}

impl RunningEnvironment {
    #[must_use]
    pub const fn backend(&self) -> BackendKind {
        match self {
            Self::Compose(_) => BackendKind::Compose,
            Self::Cluster(_) => BackendKind::Kind,
        }
    }

    /// True while cluster tunnels are open.
    #[must_use]
    pub fn should_wait_signal(&self) -> bool {
        match self {
            Self::Compose(_) | Self::Cluster(None) => false,
            Self::Cluster(Some(cluster)) => cluster.should_wait_signal(),
        }
    }

    /// Drain tunnels and remove the environment.
    pub async fn teardown(self) -> Result<(), DriverError> {
        match self {
            Self::Compose(compose) => compose
                .teardown()
                .await
                .map_err(|source| DriverError::ComposeTeardown { source }),
            Self::Cluster(Some(cluster)) => cluster
                .teardown()
                .await
                .map_err(|source| DriverError::ClusterTeardown { source }),
            Self::Cluster(None) => Ok(()),
        }
    }
}

/// Backend selection with optional preconfigured backends.
#[derive(Default)]
pub struct Driver {
    compose: Option<ComposeOrchestrator>,
    cluster: Option<ClusterProvisioner>,
}

impl Driver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `orchestrator` instead of connecting to the local docker daemon.
    #[must_use]
    pub fn with_compose(mut self, orchestrator: ComposeOrchestrator) -> Self {
        self.compose = Some(orchestrator);
        self
    }

    /// Use `provisioner` instead of the `kind` CLI.
    #[must_use]
    pub fn with_cluster(mut self, provisioner: ClusterProvisioner) -> Self {
        self.cluster = Some(provisioner);
        self
    }

    pub async fn setup(
        &self,
        spec: &EnvironmentSpec,
        steps: &dyn StepRunner,
    ) -> Result<RunningEnvironment, DriverError> {
        info!(
            backend = %spec.backend(),
            file = %spec.file().display(),
            timeout_secs = spec.timeout().as_secs(),
            "setting up test environment"
        );

        match spec.backend() {
            BackendKind::Compose => {
                let connected;
                let orchestrator = match &self.compose {
                    Some(orchestrator) => orchestrator,
                    None => {
                        connected = ComposeOrchestrator::connect().await?;
                        &connected
                    }
                };
                let environment = orchestrator.deploy(spec, steps).await?;
                Ok(RunningEnvironment::Compose(environment))
            }
            BackendKind::Kind => {
                let default_provisioner;
                let provisioner = match &self.cluster {
                    Some(provisioner) => provisioner,
                    None => {
                        default_provisioner = ClusterProvisioner::default();
                        &default_provisioner
                    }
                };
                let environment = provisioner.provision(spec, steps).await?;
                Ok(RunningEnvironment::Cluster(environment))
            }
        }
    }

    /// Load the `setup` block from `config` and set it up.
    pub async fn setup_from_file(
        &self,
        config: &Path,
        steps: &dyn StepRunner,
    ) -> Result<RunningEnvironment, DriverError> {
        let spec = EnvironmentSpec::load(config)?;
        self.setup(&spec, steps).await
    }
}

/// Set up `spec` with the default backends.
pub async fn setup(
    spec: &EnvironmentSpec,
    steps: &dyn StepRunner,
) -> Result<RunningEnvironment, DriverError> {
    Driver::new().setup(spec, steps).await
}

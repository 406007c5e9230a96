use infra_e2e_core::{ConfigError, DynError, EnvError};

use crate::{
    forwarding::PortForwardError,
    infrastructure::{kind::ProviderError, manifest::ManifestError},
    wait::ClusterWaitError,
};

#[derive(Debug, thiserror::Error)]
/// Top-level cluster runner errors.
pub enum K8sRunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Provision(#[from] ProviderError),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error("verification step '{step}' failed: {source}")]
    Steps {
        step: String,
        #[source]
        source: DynError,
    },
    #[error(transparent)]
    Wait(#[from] ClusterWaitError),
    #[error(transparent)]
    PortForward(#[from] PortForwardError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

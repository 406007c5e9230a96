//! Contract of the external verification-steps collaborator.

use std::{error::Error, path::PathBuf, time::Duration};

use async_trait::async_trait;

use crate::config::Step;

/// Opaque failure returned by external collaborators.
pub type DynError = Box<dyn Error + Send + Sync + 'static>;

/// Connection to the ephemeral cluster, handed to steps for the cluster
/// backend.
#[derive(Clone)]
pub struct ClusterHandle {
    pub client: kube::Client,
    pub kubeconfig: PathBuf,
}

impl std::fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("kubeconfig", &self.kubeconfig)
            .finish_non_exhaustive()
    }
}

/// Executes the verification steps of a run and waits on their conditions.
///
/// `cluster` is `None` for the compose backend.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run_steps_and_wait(
        &self,
        steps: &[Step],
        timeout: Duration,
        cluster: Option<&ClusterHandle>,
    ) -> Result<(), DynError>;
}

/// Step runner that accepts every step without doing anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopStepRunner;

#[async_trait]
impl StepRunner for NoopStepRunner {
    async fn run_steps_and_wait(
        &self,
        _steps: &[Step],
        _timeout: Duration,
        _cluster: Option<&ClusterHandle>,
    ) -> Result<(), DynError> {
        Ok(())
    }
}

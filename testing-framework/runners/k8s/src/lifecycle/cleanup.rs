use std::{
    env, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use infra_e2e_core::constants::PRESERVE_ENV;
use tracing::{info, warn};

use crate::{
    forwarding::PortForwardContext,
    infrastructure::kind::{ClusterTooling, ProviderError},
};

/// Removes an ephemeral cluster and its kubeconfig.
#[derive(Clone)]
pub struct ClusterCleanup {
    cluster_name: String,
    kubeconfig: PathBuf,
    tooling: Arc<dyn ClusterTooling>,
}

impl ClusterCleanup {
    pub fn new(cluster_name: String, kubeconfig: PathBuf, tooling: Arc<dyn ClusterTooling>) -> Self {
        Self {
            cluster_name,
            kubeconfig,
            tooling,
        }
    }

    #[must_use]
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    #[must_use]
    pub fn kubeconfig(&self) -> &Path {
        &self.kubeconfig
    }

    /// Drain live tunnels, then delete the cluster unless preservation is
    /// requested. Tunnels are drained even when the cluster is preserved.
    pub async fn cleanup(
        &self,
        forwards: Option<&mut PortForwardContext>,
    ) -> Result<(), ProviderError> {
        if let Some(forwards) = forwards.filter(|forwards| forwards.should_wait_signal()) {
            let drained = forwards.shutdown().await;
            info!(cluster = %self.cluster_name, tunnels = drained, "port forwards stopped");
        }

        if env::var_os(PRESERVE_ENV).is_some() {
            info!(
                cluster = %self.cluster_name,
                kubeconfig = %self.kubeconfig.display(),
                "{PRESERVE_ENV} set; keeping kind cluster"
            );
            return Ok(());
        }

        self.tooling
            .delete_cluster(&self.cluster_name, &self.kubeconfig)
            .await
            .inspect_err(|err| {
                warn!(cluster = %self.cluster_name, error = %err, "kind cluster deletion failed");
            })?;
        remove_kubeconfig(&self.kubeconfig);
        Ok(())
    }

    /// Cleanup after a failed setup; the setup error takes precedence.
    pub async fn fail(&self, forwards: Option<&mut PortForwardContext>) {
        let _ = self.cleanup(forwards).await;
    }
}

fn remove_kubeconfig(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove kubeconfig"),
    }
}

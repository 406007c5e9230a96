pub mod orchestrator;

use std::path::Path;

use infra_e2e_core::ClusterHandle;

use crate::{
    forwarding::PortForwardContext, infrastructure::kind::ProviderError,
    lifecycle::cleanup::ClusterCleanup,
};

pub use orchestrator::{ClusterProvisioner, ClusterStage};

/// A provisioned kind cluster with its verified steps and open tunnels.
pub struct KindEnvironment {
    handle: ClusterHandle,
    forwards: Option<PortForwardContext>,
    cleanup: ClusterCleanup,
}

impl KindEnvironment {
    pub(crate) const fn new(
        handle: ClusterHandle,
        forwards: Option<PortForwardContext>,
        cleanup: ClusterCleanup,
    ) -> Self {
        Self {
            handle,
            forwards,
            cleanup,
        }
    }

    #[must_use]
    pub fn cluster_name(&self) -> &str {
        self.cleanup.cluster_name()
    }

    #[must_use]
    pub fn kubeconfig(&self) -> &Path {
        self.cleanup.kubeconfig()
    }

    #[must_use]
    pub const fn handle(&self) -> &ClusterHandle {
        &self.handle
    }

    #[must_use]
    pub const fn forwards(&self) -> Option<&PortForwardContext> {
        self.forwards.as_ref()
    }

    /// True while tunnels are live and teardown has to drain them first.
    #[must_use]
    pub fn should_wait_signal(&self) -> bool {
        self.forwards
            .as_ref()
            .is_some_and(PortForwardContext::should_wait_signal)
    }

    /// Stop and drain every tunnel, then delete the cluster.
    pub async fn teardown(mut self) -> Result<(), ProviderError> {
        self.cleanup.cleanup(self.forwards.as_mut()).await
    }
}

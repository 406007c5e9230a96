pub mod orchestrator;

use std::path::{Path, PathBuf};

use crate::{
    docker::commands::ComposeCommandError,
    infrastructure::{network::ResolvedNetwork, ports::ResolvedService},
    lifecycle::cleanup::StackCleanup,
};

pub use orchestrator::{ComposeOrchestrator, ComposeStage};

/// A running, probed compose stack.
pub struct ComposeEnvironment {
    project_name: String,
    compose_file: PathBuf,
    network: ResolvedNetwork,
    services: Vec<ResolvedService>,
    cleanup: StackCleanup,
}

impl ComposeEnvironment {
    #[must_use]
    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    #[must_use]
    pub fn compose_file(&self) -> &Path {
        &self.compose_file
    }

    #[must_use]
    pub const fn network(&self) -> &ResolvedNetwork {
        &self.network
    }

    #[must_use]
    pub fn services(&self) -> &[ResolvedService] {
        &self.services
    }

    /// Remove the stack.
    pub async fn teardown(self) -> Result<(), ComposeCommandError> {
        self.cleanup.teardown().await
    }
}

//! Ephemeral kind clusters driven through the `kind` CLI.

use std::{
    io,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    time::Duration,
};

use async_trait::async_trait;
use infra_e2e_core::{ClusterHandle, adjust_timeout};
use kube::{
    Client, Config,
    config::{KubeConfigOptions, Kubeconfig, KubeconfigError},
};
use tokio::{process::Command, time::timeout};
use tracing::{debug, info, instrument};
use uuid::Uuid;

const KIND_CREATE_TIMEOUT: Duration = Duration::from_secs(300);
const KIND_LOAD_TIMEOUT: Duration = Duration::from_secs(300);
const KIND_DELETE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("failed to create kind cluster {name}: {stderr}")]
    CreateFailed { name: String, stderr: String },
    #[error("failed to delete kind cluster {name}: {stderr}")]
    DeleteFailed { name: String, stderr: String },
    #[error("failed to load image {image} into kind cluster {cluster}: {stderr}")]
    ImageLoadFailed {
        cluster: String,
        image: String,
        stderr: String,
    },
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("failed to load kubeconfig {path}: {source}")]
    Kubeconfig {
        path: PathBuf,
        #[source]
        source: KubeconfigError,
    },
    #[error("failed to initialise kubernetes client: {source}")]
    ClientInit {
        #[source]
        source: kube::Error,
    },
}

/// External cluster provisioning commands.
#[async_trait]
pub trait ClusterTooling: Send + Sync {
    /// Create cluster `name` from `config`, writing its kubeconfig to
    /// `kubeconfig`.
    async fn create_cluster(
        &self,
        name: &str,
        config: &Path,
        kubeconfig: &Path,
    ) -> Result<(), ProviderError>;

    async fn import_image(&self, cluster: &str, image: &str) -> Result<(), ProviderError>;

    async fn delete_cluster(&self, name: &str, kubeconfig: &Path) -> Result<(), ProviderError>;

    async fn connect(&self, kubeconfig: &Path) -> Result<ClusterHandle, ProviderError> {
        connect_cluster(kubeconfig).await
    }
}

/// [`ClusterTooling`] backed by the `kind` binary.
#[derive(Clone, Copy, Debug, Default)]
pub struct KindCli;

#[async_trait]
impl ClusterTooling for KindCli {
    #[instrument(skip(self), fields(provider = "kind"))]
    async fn create_cluster(
        &self,
        name: &str,
        config: &Path,
        kubeconfig: &Path,
    ) -> Result<(), ProviderError> {
        info!("creating kind cluster");
        let mut cmd = Command::new("kind");
        cmd.args(["create", "cluster", "--name", name])
            .arg("--config")
            .arg(config)
            .arg("--kubeconfig")
            .arg(kubeconfig);

        let output = run_kind(cmd, adjust_timeout(KIND_CREATE_TIMEOUT), "kind create cluster").await?;
        if !output.status.success() {
            return Err(ProviderError::CreateFailed {
                name: name.to_owned(),
                stderr: stderr_of(&output),
            });
        }

        info!("kind cluster created");
        Ok(())
    }

    #[instrument(skip(self), fields(provider = "kind"))]
    async fn import_image(&self, cluster: &str, image: &str) -> Result<(), ProviderError> {
        let mut cmd = Command::new("kind");
        cmd.args(["load", "docker-image", image, "--name", cluster]);

        let output = run_kind(cmd, adjust_timeout(KIND_LOAD_TIMEOUT), "kind load docker-image").await?;
        if !output.status.success() {
            return Err(ProviderError::ImageLoadFailed {
                cluster: cluster.to_owned(),
                image: image.to_owned(),
                stderr: stderr_of(&output),
            });
        }

        debug!("image loaded");
        Ok(())
    }

    #[instrument(skip(self), fields(provider = "kind"))]
    async fn delete_cluster(&self, name: &str, kubeconfig: &Path) -> Result<(), ProviderError> {
        let mut cmd = Command::new("kind");
        cmd.args(["delete", "cluster", "--name", name])
            .arg("--kubeconfig")
            .arg(kubeconfig);

        let output = run_kind(cmd, adjust_timeout(KIND_DELETE_TIMEOUT), "kind delete cluster").await?;
        if !output.status.success() {
            return Err(ProviderError::DeleteFailed {
                name: name.to_owned(),
                stderr: stderr_of(&output),
            });
        }

        info!("kind cluster deleted");
        Ok(())
    }
}

/// Build a client from a kubeconfig file.
pub async fn connect_cluster(kubeconfig: &Path) -> Result<ClusterHandle, ProviderError> {
    let to_error = |source| ProviderError::Kubeconfig {
        path: kubeconfig.to_path_buf(),
        source,
    };
    let raw = Kubeconfig::read_from(kubeconfig).map_err(to_error)?;
    let config = Config::from_custom_kubeconfig(raw, &KubeConfigOptions::default())
        .await
        .map_err(to_error)?;
    let client = Client::try_from(config).map_err(|source| ProviderError::ClientInit { source })?;

    Ok(ClusterHandle {
        client,
        kubeconfig: kubeconfig.to_path_buf(),
    })
}

/// Fresh cluster name and kubeconfig location for one run.
#[must_use]
pub fn cluster_identifiers() -> (String, PathBuf) {
    let id = Uuid::new_v4().simple().to_string();
    let name = format!("e2e-{}", &id[..12]);
    let kubeconfig = std::env::temp_dir().join(format!("infra-e2e-kubeconfig-{id}.yaml"));
    (name, kubeconfig)
}

async fn run_kind(
    mut command: Command,
    timeout_duration: Duration,
    description: &str,
) -> Result<Output, ProviderError> {
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match timeout(timeout_duration, command.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(source)) => Err(ProviderError::Spawn {
            command: description.to_owned(),
            source,
        }),
        Err(_) => Err(ProviderError::Timeout {
            command: description.to_owned(),
            timeout: timeout_duration,
        }),
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_owned()
}

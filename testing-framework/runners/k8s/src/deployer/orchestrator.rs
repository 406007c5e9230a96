use std::{fmt, path::Path, slice, sync::Arc, time::Duration};

use infra_e2e_core::{
    ClusterHandle, EnvironmentSpec, EnvironmentVariableBroker, Step, StepRunner, adjust_timeout,
    constants::KUBECONFIG_ENV, expand_env,
};
use tracing::{info, warn};

use super::KindEnvironment;
use crate::{
    errors::K8sRunnerError,
    forwarding::{KubeTunnels, PortForwardContext, PortForwardSupervisor, TunnelBackend},
    infrastructure::{
        kind::{ClusterTooling, KindCli, cluster_identifiers},
        manifest::{KubectlManifests, ManifestOperator},
    },
    lifecycle::cleanup::ClusterCleanup,
    wait::{ConditionProbe, ConditionWaiter, KubectlWait},
};

/// Stages of a cluster setup, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterStage {
    ExportProfile,
    CreateCluster,
    ImportImages,
    Connect,
    RunSteps,
    ExposePorts,
    Done,
}

impl fmt::Display for ClusterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ExportProfile => "export-profile",
            Self::CreateCluster => "create-cluster",
            Self::ImportImages => "import-images",
            Self::Connect => "connect",
            Self::RunSteps => "run-steps",
            Self::ExposePorts => "expose-ports",
            Self::Done => "done",
        };
        f.write_str(label)
    }
}

/// Drives a kind-backed environment from cluster creation to open tunnels.
pub struct ClusterProvisioner {
    tooling: Arc<dyn ClusterTooling>,
    broker: EnvironmentVariableBroker,
    tunnels: Option<Arc<dyn TunnelBackend>>,
    conditions: Option<Arc<dyn ConditionProbe>>,
    manifests: Arc<dyn ManifestOperator>,
}

impl Default for ClusterProvisioner {
    fn default() -> Self {
        Self::new(Arc::new(KindCli))
    }
}

impl ClusterProvisioner {
    pub fn new(tooling: Arc<dyn ClusterTooling>) -> Self {
        Self {
            tooling,
            broker: EnvironmentVariableBroker::new(),
            tunnels: None,
            conditions: None,
            manifests: Arc::new(KubectlManifests),
        }
    }

    #[must_use]
    pub fn with_broker(mut self, broker: EnvironmentVariableBroker) -> Self {
        self.broker = broker;
        self
    }

    /// Replace the API-server tunnels.
    #[must_use]
    pub fn with_tunnels(mut self, tunnels: Arc<dyn TunnelBackend>) -> Self {
        self.tunnels = Some(tunnels);
        self
    }

    /// Replace `kubectl wait` for step conditions.
    #[must_use]
    pub fn with_condition_probe(mut self, probe: Arc<dyn ConditionProbe>) -> Self {
        self.conditions = Some(probe);
        self
    }

    /// Replace `kubectl create` for steps that point at manifests.
    #[must_use]
    pub fn with_manifests(mut self, manifests: Arc<dyn ManifestOperator>) -> Self {
        self.manifests = manifests;
        self
    }

    /// Provision the cluster, run the steps and open the declared tunnels.
    ///
    /// Returns `Ok(None)` without creating anything when the spec declares no
    /// steps.
    pub async fn provision(
        &self,
        spec: &EnvironmentSpec,
        steps: &dyn StepRunner,
    ) -> Result<Option<KindEnvironment>, K8sRunnerError> {
        let Some(declared) = spec.steps() else {
            info!("no verification steps declared; skipping cluster creation");
            return Ok(None);
        };
        spec.validate_waits()?;
        spec.ensure_definition_exists()?;
        let run_timeout = adjust_timeout(spec.timeout());

        if let Some(profile) = spec.init_system_environment() {
            log_stage(ClusterStage::ExportProfile);
            let exported = self.broker.export_profile(profile)?;
            info!(profile = %profile.display(), variables = exported, "exported environment profile");
        }

        log_stage(ClusterStage::CreateCluster);
        let (cluster_name, kubeconfig) = cluster_identifiers();
        info!(
            cluster = %cluster_name,
            config = %spec.file().display(),
            kubeconfig = %kubeconfig.display(),
            timeout_secs = run_timeout.as_secs(),
            "cluster deployment starting"
        );
        let cleanup = ClusterCleanup::new(
            cluster_name.clone(),
            kubeconfig.clone(),
            Arc::clone(&self.tooling),
        );
        // A create that failed or timed out may still leave a partial cluster.
        if let Err(err) = self
            .tooling
            .create_cluster(&cluster_name, spec.file(), &kubeconfig)
            .await
        {
            warn!(cluster = %cluster_name, error = %err, "cluster creation failed");
            cleanup.fail(None).await;
            return Err(err.into());
        }

        let (handle, forwards) = match self
            .prepare(spec, declared, &cluster_name, &kubeconfig, run_timeout, steps)
            .await
        {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(cluster = %cluster_name, error = %err, "cluster setup failed");
                cleanup.fail(None).await;
                return Err(err);
            }
        };

        log_stage(ClusterStage::Done);
        Ok(Some(KindEnvironment::new(handle, forwards, cleanup)))
    }

    async fn prepare(
        &self,
        spec: &EnvironmentSpec,
        declared: &[Step],
        cluster_name: &str,
        kubeconfig: &Path,
        run_timeout: Duration,
        steps: &dyn StepRunner,
    ) -> Result<(ClusterHandle, Option<PortForwardContext>), K8sRunnerError> {
        self.broker
            .publish(KUBECONFIG_ENV, &kubeconfig.to_string_lossy())?;

        let images = &spec.cluster().import_images;
        if !images.is_empty() {
            log_stage(ClusterStage::ImportImages);
            for image in images {
                let image = expand_env(image);
                info!(cluster = %cluster_name, image = %image, "importing image");
                self.tooling.import_image(cluster_name, &image).await?;
            }
        }

        log_stage(ClusterStage::Connect);
        let handle = self.tooling.connect(kubeconfig).await?;

        log_stage(ClusterStage::RunSteps);
        self.run_steps(declared, run_timeout, &handle, steps).await?;

        let exposures = &spec.cluster().expose_ports;
        if exposures.is_empty() {
            return Ok((handle, None));
        }

        log_stage(ClusterStage::ExposePorts);
        let tunnels: Arc<dyn TunnelBackend> = match &self.tunnels {
            Some(tunnels) => Arc::clone(tunnels),
            None => Arc::new(KubeTunnels::new(handle.client.clone())),
        };
        let supervisor = PortForwardSupervisor::new(tunnels, self.broker.clone());
        let forwards = supervisor.expose(exposures, run_timeout).await?;
        info!(tunnels = forwards.resource_count(), "port forwards active");

        Ok((handle, Some(forwards)))
    }

    /// Create a step's manifests when it names a path, otherwise hand it to
    /// the collaborator. Its conditions are waited on either way.
    async fn run_steps(
        &self,
        declared: &[Step],
        run_timeout: Duration,
        handle: &ClusterHandle,
        steps: &dyn StepRunner,
    ) -> Result<(), K8sRunnerError> {
        let probe: Arc<dyn ConditionProbe> = match &self.conditions {
            Some(probe) => Arc::clone(probe),
            None => Arc::new(KubectlWait::for_cluster(handle)),
        };
        let waiter = ConditionWaiter::shared(probe);

        for step in declared {
            match step.path.as_deref().filter(|location| !location.is_empty()) {
                Some(location) => {
                    info!(step = %step.name, manifest = location, "creating step manifests");
                    self.manifests.create(handle, location).await?;
                }
                None => {
                    info!(step = %step.name, "running verification step");
                    steps
                        .run_steps_and_wait(slice::from_ref(step), run_timeout, Some(handle))
                        .await
                        .map_err(|source| K8sRunnerError::Steps {
                            step: step.name.clone(),
                            source,
                        })?;
                }
            }
            waiter.wait_all(&step.wait, run_timeout).await?;
        }
        Ok(())
    }
}

fn log_stage(stage: ClusterStage) {
    info!(%stage, "cluster stage");
}

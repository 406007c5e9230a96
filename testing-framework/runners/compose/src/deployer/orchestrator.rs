use std::{fmt, sync::Arc, time::Duration};

use infra_e2e_core::{
    EnvironmentSpec, EnvironmentVariableBroker, StepRunner, adjust_timeout, host_key, port_key,
};
use tokio::{task::JoinSet, time::timeout};
use tracing::{info, warn};
use uuid::Uuid;

use super::ComposeEnvironment;
use crate::{
    descriptor::ComposeDefinition,
    docker::{
        BollardRuntime, ContainerRuntime,
        commands::{DockerComposeCli, StackLauncher},
        in_container,
    },
    errors::ComposeRunnerError,
    infrastructure::{
        network::NetworkResolver,
        ports::{PortBindingPlanner, ResolvedService},
    },
    lifecycle::{
        cleanup::StackCleanup,
        readiness::{ContainerShell, HealthProbe, ProbeSettings, Reachability, TcpReachability},
    },
};

/// Stages of a compose setup, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComposeStage {
    PlanBindings,
    ResolveNetwork,
    StartStack,
    ResolveBindings,
    ProbeAll,
    PublishEnv,
    RunSteps,
    Done,
}

impl fmt::Display for ComposeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::PlanBindings => "plan-bindings",
            Self::ResolveNetwork => "resolve-network",
            Self::StartStack => "start-stack",
            Self::ResolveBindings => "resolve-bindings",
            Self::ProbeAll => "probe-all",
            Self::PublishEnv => "publish-env",
            Self::RunSteps => "run-steps",
            Self::Done => "done",
        };
        f.write_str(label)
    }
}

/// Drives a compose-backed environment from definition to verified stack.
pub struct ComposeOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    launcher: Arc<dyn StackLauncher>,
    reachability: Arc<dyn Reachability>,
    broker: EnvironmentVariableBroker,
    dial_backoff: Option<Duration>,
}

impl ComposeOrchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, launcher: Arc<dyn StackLauncher>) -> Self {
        Self {
            runtime,
            launcher,
            reachability: Arc::new(TcpReachability),
            broker: EnvironmentVariableBroker::new(),
            dial_backoff: None,
        }
    }

    /// Orchestrator using the local docker daemon and `docker compose`.
    pub async fn connect() -> Result<Self, ComposeRunnerError> {
        let runtime = BollardRuntime::connect()
            .map_err(|source| ComposeRunnerError::DockerUnavailable { source })?;
        runtime
            .ping()
            .await
            .map_err(|source| ComposeRunnerError::DockerUnavailable { source })?;

        Ok(Self::new(Arc::new(runtime), Arc::new(DockerComposeCli)))
    }

    #[must_use]
    pub fn with_reachability(mut self, reachability: Arc<dyn Reachability>) -> Self {
        self.reachability = reachability;
        self
    }

    #[must_use]
    pub fn with_broker(mut self, broker: EnvironmentVariableBroker) -> Self {
        self.broker = broker;
        self
    }

    #[must_use]
    pub const fn with_dial_backoff(mut self, backoff: Duration) -> Self {
        self.dial_backoff = Some(backoff);
        self
    }

    pub async fn deploy(
        &self,
        spec: &EnvironmentSpec,
        steps: &dyn StepRunner,
    ) -> Result<ComposeEnvironment, ComposeRunnerError> {
        let run_timeout = adjust_timeout(spec.timeout());

        log_stage(ComposeStage::PlanBindings);
        spec.ensure_definition_exists()?;
        let definition = ComposeDefinition::load(spec.file())?;
        let planner = PortBindingPlanner::plan(&definition)?;

        log_stage(ComposeStage::ResolveNetwork);
        info!(
            daemon_host = %self.runtime.daemon_host(),
            in_container = in_container(),
            "docker environment"
        );
        let network = NetworkResolver::resolve(self.runtime.as_ref()).await?;
        info!(network = %network.name, gateway = %network.gateway, "docker network selected");

        log_stage(ComposeStage::StartStack);
        let project_name = format!("e2e-{}", Uuid::new_v4().simple());
        info!(
            project = %project_name,
            file = %spec.file().display(),
            timeout_secs = run_timeout.as_secs(),
            "compose deployment starting"
        );
        let cleanup = StackCleanup::new(Arc::clone(&self.launcher), spec.file(), &project_name);
        if let Err(err) = self.launcher.up(spec.file(), &project_name).await {
            cleanup.after_failure().await;
            return Err(err.into());
        }

        let services = match self
            .verify_stack(&planner, &project_name, &network.gateway, run_timeout)
            .await
        {
            Ok(services) => services,
            Err(err) => {
                warn!(project = %project_name, error = %err, "compose setup failed");
                cleanup.after_failure().await;
                return Err(err);
            }
        };

        log_stage(ComposeStage::RunSteps);
        if let Err(source) = steps
            .run_steps_and_wait(spec.steps().unwrap_or_default(), run_timeout, None)
            .await
        {
            warn!(project = %project_name, error = %source, "execute steps error");
            cleanup.after_failure().await;
            return Err(ComposeRunnerError::Steps { source });
        }

        log_stage(ComposeStage::Done);
        info!(
            project = %project_name,
            services = services.len(),
            "compose deployment ready"
        );

        Ok(ComposeEnvironment {
            project_name,
            compose_file: spec.file().to_path_buf(),
            network,
            services,
            cleanup,
        })
    }

    async fn verify_stack(
        &self,
        planner: &PortBindingPlanner,
        project_name: &str,
        gateway: &str,
        run_timeout: Duration,
    ) -> Result<Vec<ResolvedService>, ComposeRunnerError> {
        log_stage(ComposeStage::ResolveBindings);
        let services = planner
            .resolve_all(self.runtime.as_ref(), project_name, gateway)
            .await?;

        log_stage(ComposeStage::ProbeAll);
        timeout(run_timeout, self.probe_all(&services, run_timeout))
            .await
            .map_err(|_| ComposeRunnerError::Timeout {
                stage: "compose readiness probing",
                timeout: run_timeout,
            })??;

        log_stage(ComposeStage::PublishEnv);
        self.publish(&services)?;
        Ok(services)
    }

    async fn probe_all(
        &self,
        services: &[ResolvedService],
        run_timeout: Duration,
    ) -> Result<(), ComposeRunnerError> {
        let mut settings = ProbeSettings::with_deadline(run_timeout);
        if let Some(backoff) = self.dial_backoff {
            settings.dial_backoff = backoff;
        }
        let probe = HealthProbe::new(Arc::clone(&self.reachability), settings);

        let mut probes = JoinSet::new();
        for service in services {
            let shell = ContainerShell::new(Arc::clone(&self.runtime), &service.container.id);
            for binding in &service.bindings {
                let Some(endpoint) = binding.endpoint().cloned() else {
                    continue;
                };
                let probe = probe.clone();
                let shell = shell.clone();
                let name = service.service.clone();
                let container_port = binding.container_port();

                probes.spawn(async move {
                    probe
                        .probe(
                            &endpoint.host_ip,
                            endpoint.published_port,
                            container_port,
                            &shell,
                        )
                        .await
                        .map_err(|source| ComposeRunnerError::Probe {
                            service: name,
                            container_port,
                            source,
                        })
                });
            }
        }

        while let Some(joined) = probes.join_next().await {
            let outcome = joined
                .map_err(|source| ComposeRunnerError::ProbeTask { source })
                .and_then(|result| result);
            if let Err(err) = outcome {
                probes.abort_all();
                return Err(err);
            }
        }

        Ok(())
    }

    fn publish(&self, services: &[ResolvedService]) -> Result<(), ComposeRunnerError> {
        for service in services {
            let Some(first) = service.bindings.first().and_then(|b| b.endpoint()) else {
                continue;
            };
            self.broker
                .publish(&host_key(&service.service), &first.host_ip)?;

            for binding in &service.bindings {
                if let Some(endpoint) = binding.endpoint() {
                    self.broker.publish(
                        &port_key(&service.service, binding.container_port()),
                        &endpoint.published_port.to_string(),
                    )?;
                }
            }
        }
        Ok(())
    }
}

fn log_stage(stage: ComposeStage) {
    info!(%stage, "compose stage");
}

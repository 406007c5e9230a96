pub mod deployer;
pub mod errors;
pub mod forwarding;
pub mod infrastructure;
pub mod lifecycle;
pub mod wait;

pub use deployer::{ClusterProvisioner, ClusterStage, KindEnvironment};
pub use errors::K8sRunnerError;
pub use forwarding::{
    ForwardState, ForwardTarget, ForwardedPort, KubeTunnels, PortForwardContext,
    PortForwardError, PortForwardSupervisor, PortToken, ReadySender, ResolveTarget, StopSignal,
    TunnelBackend, WorkerHandle, build_forward_target,
};
pub use infrastructure::{
    kind::{ClusterTooling, KindCli, ProviderError, cluster_identifiers, connect_cluster},
    manifest::{
        KubectlManifests, ManifestError, ManifestOperator, ManifestVerb, create_by_manifest,
        manifest_files, operate_manifest,
    },
};
pub use lifecycle::cleanup::ClusterCleanup;
pub use wait::{ClusterWaitError, ConditionProbe, ConditionWaiter, KubectlWait, wait_args};

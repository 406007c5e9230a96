pub mod deployer;
pub mod descriptor;
pub mod docker;
pub mod errors;
pub mod infrastructure;
pub mod lifecycle;

pub use deployer::{ComposeEnvironment, ComposeOrchestrator, ComposeStage};
pub use descriptor::{ComposeDefinition, DescriptorError, PortEntry};
pub use docker::{
    BollardRuntime, ContainerRuntime, NetworkInfo, PortMapping, RuntimeError, ServiceContainer,
    commands::{
        ComposeAction, ComposeCommandError, ComposeInvocation, DockerComposeCli, StackLauncher,
    },
};
pub use errors::ComposeRunnerError;
pub use infrastructure::{
    network::{NetworkError, NetworkResolver, ResolvedNetwork},
    ports::{PortBindingPlanner, ResolvedEndpoint, ResolvedService, ServicePortBinding},
};
pub use lifecycle::{
    cleanup::StackCleanup,
    readiness::{
        ContainerExec, ContainerShell, HealthCheckOutcome, HealthProbe, ProbeError, ProbeSettings,
        Reachability, TcpReachability,
    },
};

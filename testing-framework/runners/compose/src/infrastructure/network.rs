use tracing::{debug, info};

use crate::docker::{ContainerRuntime, NetworkInfo, RuntimeError};

/// Name of the runtime's default bridge network.
pub const BRIDGE_NETWORK: &str = "bridge";
/// Network created when no bridge network exists.
pub const FALLBACK_NETWORK: &str = "infra_e2e_default";
/// Label marking networks created by this runner.
pub const MANAGED_LABEL: (&str, &str) = ("org.infra-e2e.managed", "true");

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("failed to list runtime networks: {source}")]
    List {
        #[source]
        source: RuntimeError,
    },
    #[error("failed to create fallback network {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: RuntimeError,
    },
    #[error("failed to get gateway IP from network settings of {network}")]
    MissingGateway { network: String },
}

/// Network the stack's published ports are reached through.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedNetwork {
    pub name: String,
    pub gateway: String,
}

/// Picks the bridge network, or a labelled fallback when there is none.
pub struct NetworkResolver;

impl NetworkResolver {
    pub async fn resolve(runtime: &dyn ContainerRuntime) -> Result<ResolvedNetwork, NetworkError> {
        let networks = runtime
            .list_networks()
            .await
            .map_err(|source| NetworkError::List { source })?;

        if let Some(bridge) = networks.iter().find(|net| net.name == BRIDGE_NETWORK) {
            return gateway_of(bridge);
        }

        if let Some(existing) = networks.iter().find(|net| net.name == FALLBACK_NETWORK) {
            debug!(network = FALLBACK_NETWORK, "reusing fallback network");
            return gateway_of(existing);
        }

        info!(network = FALLBACK_NETWORK, "no bridge network found; creating fallback");
        let created = runtime
            .create_network(FALLBACK_NETWORK, &[MANAGED_LABEL])
            .await
            .map_err(|source| NetworkError::Create {
                name: FALLBACK_NETWORK.to_owned(),
                source,
            })?;
        gateway_of(&created)
    }
}

fn gateway_of(network: &NetworkInfo) -> Result<ResolvedNetwork, NetworkError> {
    network
        .gateways
        .iter()
        .find(|gateway| !gateway.is_empty())
        .map(|gateway| ResolvedNetwork {
            name: network.name.clone(),
            gateway: gateway.clone(),
        })
        .ok_or_else(|| NetworkError::MissingGateway {
            network: network.name.clone(),
        })
}

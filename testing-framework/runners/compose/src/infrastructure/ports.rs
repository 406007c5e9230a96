use std::collections::BTreeMap;

use anyhow::anyhow;
use tracing::{debug, info};

use crate::{
    descriptor::{ComposeDefinition, DescriptorError},
    docker::{ContainerRuntime, ServiceContainer},
    errors::ComposeRunnerError,
};

/// Host address and published port of a resolved binding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub host_ip: String,
    pub published_port: u16,
}

/// A declared container port and, once resolved, where it is reachable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicePortBinding {
    service: String,
    container_port: u16,
    resolved: Option<ResolvedEndpoint>,
}

impl ServicePortBinding {
    pub fn planned(service: impl Into<String>, container_port: u16) -> Self {
        Self {
            service: service.into(),
            container_port,
            resolved: None,
        }
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub const fn container_port(&self) -> u16 {
        self.container_port
    }

    #[must_use]
    pub const fn endpoint(&self) -> Option<&ResolvedEndpoint> {
        self.resolved.as_ref()
    }

    /// Resolve against the live container. A binding that is already
    /// resolved keeps its first result.
    pub fn resolve(
        &mut self,
        host_ip: &str,
        container: &ServiceContainer,
    ) -> Result<ResolvedEndpoint, ComposeRunnerError> {
        if let Some(existing) = &self.resolved {
            return Ok(existing.clone());
        }

        let published_port =
            published_port(container, self.container_port).ok_or_else(|| {
                ComposeRunnerError::PortResolution {
                    service: self.service.clone(),
                    container_port: self.container_port,
                    source: anyhow!(
                        "container {} publishes no mapping for port {}",
                        container.id,
                        self.container_port
                    ),
                }
            })?;

        let endpoint = ResolvedEndpoint {
            host_ip: host_ip.to_owned(),
            published_port,
        };
        self.resolved = Some(endpoint.clone());
        Ok(endpoint)
    }
}

/// Look up the host port a container port is published on. Containers in
/// host network mode publish every port unchanged.
#[must_use]
pub fn published_port(container: &ServiceContainer, container_port: u16) -> Option<u16> {
    if container.uses_host_network() {
        return Some(container_port);
    }

    container
        .ports
        .iter()
        .filter(|mapping| mapping.private_port == container_port)
        .find_map(|mapping| mapping.public_port)
}

/// A service's live container and its resolved bindings.
#[derive(Clone, Debug)]
pub struct ResolvedService {
    pub service: String,
    pub container: ServiceContainer,
    pub bindings: Vec<ServicePortBinding>,
}

/// Derives which container ports must become reachable, then resolves them.
#[derive(Clone, Debug, Default)]
pub struct PortBindingPlanner {
    expected: BTreeMap<String, Vec<u16>>,
}

impl PortBindingPlanner {
    pub fn plan(definition: &ComposeDefinition) -> Result<Self, DescriptorError> {
        let expected = definition.declared_ports()?;
        for (service, ports) in &expected {
            debug!(service, ?ports, "planned container ports");
        }
        Ok(Self { expected })
    }

    pub fn expected(&self) -> impl Iterator<Item = (&str, &[u16])> {
        self.expected
            .iter()
            .map(|(service, ports)| (service.as_str(), ports.as_slice()))
    }

    /// Resolve every planned binding against the running `project`.
    pub async fn resolve_all(
        &self,
        runtime: &dyn ContainerRuntime,
        project: &str,
        host_ip: &str,
    ) -> Result<Vec<ResolvedService>, ComposeRunnerError> {
        let mut resolved = Vec::with_capacity(self.expected.len());

        for (service, ports) in self.expected() {
            let container = runtime
                .find_service_container(project, service)
                .await
                .map_err(|source| ComposeRunnerError::PortResolution {
                    service: service.to_owned(),
                    container_port: ports.first().copied().unwrap_or_default(),
                    source: source.into(),
                })?
                .ok_or_else(|| ComposeRunnerError::PortResolution {
                    service: service.to_owned(),
                    container_port: ports.first().copied().unwrap_or_default(),
                    source: anyhow!("could not find a running container for service {service}"),
                })?;

            let mut bindings = Vec::with_capacity(ports.len());
            for port in ports {
                let mut binding = ServicePortBinding::planned(service, *port);
                let endpoint = binding.resolve(host_ip, &container)?;
                info!(
                    service,
                    container_port = port,
                    host = %endpoint.host_ip,
                    published_port = endpoint.published_port,
                    network_mode = container.network_mode.as_deref().unwrap_or("default"),
                    "resolved service port"
                );
                bindings.push(binding);
            }

            resolved.push(ResolvedService {
                service: service.to_owned(),
                container,
                bindings,
            });
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::PortMapping;

    fn container(network_mode: Option<&str>, ports: &[(u16, Option<u16>)]) -> ServiceContainer {
        ServiceContainer {
            id: "c1".to_owned(),
            network_mode: network_mode.map(str::to_owned),
            ports: ports
                .iter()
                .map(|(private_port, public_port)| PortMapping {
                    private_port: *private_port,
                    public_port: *public_port,
                })
                .collect(),
        }
    }

    #[test]
    fn resolution_matches_by_container_port() {
        let live = container(Some("bridge"), &[(9300, Some(32002)), (9200, Some(32001))]);
        let mut binding = ServicePortBinding::planned("es", 9200);

        let first = binding.resolve("172.17.0.1", &live).expect("resolves");
        let second = binding.resolve("172.17.0.1", &live).expect("resolves");

        assert_eq!(first.published_port, 32001);
        assert_eq!(first, second);
        assert_eq!(binding.endpoint(), Some(&first));
    }

    #[test]
    fn host_network_returns_container_port() {
        let live = container(Some("host"), &[]);

        assert_eq!(published_port(&live, 8080), Some(8080));
    }

    #[test]
    fn absent_port_fails_naming_service_and_port() {
        let live = container(None, &[(80, Some(8080)), (9200, None)]);
        let mut binding = ServicePortBinding::planned("es", 9200);

        let err = binding.resolve("172.17.0.1", &live).expect_err("no mapping");

        assert!(matches!(
            err,
            ComposeRunnerError::PortResolution { ref service, container_port: 9200, .. }
                if service == "es"
        ));
        assert!(binding.endpoint().is_none());
    }

    #[test]
    fn plan_keeps_container_side_ports() {
        let definition = ComposeDefinition::from_yaml_str(
            "services:\n  es:\n    ports: [\"19200:9200\"]\n  db:\n    image: postgres\n",
        )
        .expect("parses");

        let planner = PortBindingPlanner::plan(&definition).expect("plans");
        let expected: Vec<_> = planner.expected().collect();

        assert_eq!(expected, vec![("es", &[9200_u16][..])]);
    }
}

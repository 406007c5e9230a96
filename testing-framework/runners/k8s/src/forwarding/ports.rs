//! Resolution of user port tokens against live pods and services.

use k8s_openapi::{
    api::core::v1::{Pod, Service},
    apimachinery::pkg::util::intstr::IntOrString,
};

use super::PortForwardError;

/// A token as written by the user: `8080`, `http`, `8080:9090` or `:http`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortToken<'a> {
    pub raw: &'a str,
    pub local: Option<&'a str>,
    pub remote: &'a str,
}

impl<'a> PortToken<'a> {
    #[must_use]
    pub fn parse(raw: &'a str) -> Self {
        let raw = raw.trim();
        match raw.split_once(':') {
            Some((local, remote)) => Self {
                raw,
                local: Some(local),
                remote,
            },
            None => Self {
                raw,
                local: None,
                remote: raw,
            },
        }
    }

    /// The tunnel form before resolution: the token itself when it names a
    /// local port, `:remote` otherwise.
    #[must_use]
    pub fn expose(&self) -> String {
        match self.local {
            Some(_) => self.raw.to_owned(),
            None => format!(":{}", self.remote),
        }
    }
}

/// The live object a port exposure points at.
#[derive(Clone, Debug)]
pub enum ResolveTarget {
    /// A service and the running pod backing it.
    Service { service: Box<Service>, pod: Box<Pod> },
    Pod(Box<Pod>),
}

impl ResolveTarget {
    #[must_use]
    pub fn pod(&self) -> &Pod {
        match self {
            Self::Service { pod, .. } | Self::Pod(pod) => pod.as_ref(),
        }
    }

    #[must_use]
    pub fn pod_name(&self) -> &str {
        self.pod().metadata.name.as_deref().unwrap_or_default()
    }
}

/// One resolved tunnel request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardTarget {
    /// Remote part of the token as the user wrote it.
    pub input_port: String,
    /// Container port the tunnel connects to.
    pub container_port: u16,
    /// Requested local port; `None` picks a free one.
    pub local_port: Option<u16>,
    /// `local:remote` display form of the tunnel.
    pub expose: String,
}

/// Resolve a port token for `target`.
pub fn build_forward_target(
    resource: &str,
    token: &str,
    target: &ResolveTarget,
) -> Result<ForwardTarget, PortForwardError> {
    let token = PortToken::parse(token);
    let malformed = || PortForwardError::MalformedToken {
        resource: resource.to_owned(),
        token: token.raw.to_owned(),
    };
    if token.remote.is_empty() {
        return Err(malformed());
    }

    let local_port = match token.local.map(str::trim).filter(|local| !local.is_empty()) {
        Some(local) => Some(local.parse::<u16>().map_err(|_| malformed())?),
        None => None,
    };

    let container_port = match target {
        ResolveTarget::Pod(pod) => match token.remote.parse::<u16>() {
            Ok(port) => port,
            Err(_) => container_port_by_name(pod, token.remote)
                .ok_or_else(|| port_not_found(resource, token.remote))?,
        },
        ResolveTarget::Service { service, pod } => {
            let service_port = match token.remote.parse::<i32>() {
                Ok(port) => port,
                Err(_) => service_port_by_name(service, token.remote)
                    .ok_or_else(|| port_not_found(resource, token.remote))?,
            };
            container_port_by_service_port(service, pod, service_port)
                .ok_or_else(|| port_not_found(resource, token.remote))?
        }
    };

    let expose = if container_port.to_string() == token.remote {
        token.expose()
    } else {
        format!("{}:{container_port}", token.local.unwrap_or_default())
    };

    Ok(ForwardTarget {
        input_port: token.remote.to_owned(),
        container_port,
        local_port,
        expose,
    })
}

fn port_not_found(resource: &str, port: &str) -> PortForwardError {
    PortForwardError::PortNotFound {
        resource: resource.to_owned(),
        port: port.to_owned(),
    }
}

/// Container port declared under `name` by any container of the pod.
#[must_use]
pub fn container_port_by_name(pod: &Pod, name: &str) -> Option<u16> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .flat_map(|container| container.ports.iter().flatten())
        .find(|port| port.name.as_deref() == Some(name))
        .and_then(|port| u16::try_from(port.container_port).ok())
}

/// Service port declared under `name`.
#[must_use]
pub fn service_port_by_name(service: &Service, name: &str) -> Option<i32> {
    service
        .spec
        .as_ref()?
        .ports
        .iter()
        .flatten()
        .find(|port| port.name.as_deref() == Some(name))
        .map(|port| port.port)
}

/// Container port that service port `port` targets in `pod`.
#[must_use]
pub fn container_port_by_service_port(service: &Service, pod: &Pod, port: i32) -> Option<u16> {
    let spec = service.spec.as_ref()?;
    let service_port = spec.ports.iter().flatten().find(|candidate| candidate.port == port)?;
    // Headless services forward straight to the declared port.
    if spec.cluster_ip.as_deref() == Some("None") {
        return u16::try_from(port).ok();
    }

    match &service_port.target_port {
        None | Some(IntOrString::Int(0)) => u16::try_from(port).ok(),
        Some(IntOrString::Int(target)) => u16::try_from(*target).ok(),
        Some(IntOrString::String(name)) => container_port_by_name(pod, name),
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, ServicePort, ServiceSpec};
    use kube::api::ObjectMeta;

    use super::*;

    fn pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("app-7d9f".to_owned()),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_owned(),
                    ports: Some(vec![
                        ContainerPort {
                            name: Some("http".to_owned()),
                            container_port: 8080,
                            ..ContainerPort::default()
                        },
                        ContainerPort {
                            name: Some("metrics".to_owned()),
                            container_port: 9090,
                            ..ContainerPort::default()
                        },
                    ]),
                    ..Container::default()
                }],
                ..PodSpec::default()
            }),
            ..Pod::default()
        }
    }

    fn service() -> Service {
        Service {
            spec: Some(ServiceSpec {
                ports: Some(vec![
                    ServicePort {
                        name: Some("web".to_owned()),
                        port: 80,
                        target_port: Some(IntOrString::String("http".to_owned())),
                        ..ServicePort::default()
                    },
                    ServicePort {
                        name: Some("metrics".to_owned()),
                        port: 9090,
                        target_port: Some(IntOrString::Int(9090)),
                        ..ServicePort::default()
                    },
                    ServicePort {
                        name: Some("plain".to_owned()),
                        port: 7000,
                        ..ServicePort::default()
                    },
                ]),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    fn service_target() -> ResolveTarget {
        ResolveTarget::Service {
            service: Box::new(service()),
            pod: Box::new(pod()),
        }
    }

    #[test]
    fn token_parsing() {
        assert_eq!(PortToken::parse("8080").expose(), ":8080");
        assert_eq!(PortToken::parse(" 1234:http ").expose(), "1234:http");

        let token = PortToken::parse(":80");
        assert_eq!(token.local, Some(""));
        assert_eq!(token.remote, "80");
    }

    #[test]
    fn pod_numeric_and_named_ports() {
        let target = ResolveTarget::Pod(Box::new(pod()));

        let numeric = build_forward_target("pod/app", "8080", &target).expect("numeric");
        assert_eq!(numeric.container_port, 8080);
        assert_eq!(numeric.expose, ":8080");

        let named = build_forward_target("pod/app", "metrics", &target).expect("named");
        assert_eq!(named.container_port, 9090);
        assert_eq!(named.input_port, "metrics");
        assert_eq!(named.expose, ":9090");
    }

    #[test]
    fn service_port_is_rewritten_to_container_port() {
        let target = service_target();

        let by_number = build_forward_target("service/app", "80", &target).expect("number");
        assert_eq!(by_number.container_port, 8080);
        assert_eq!(by_number.expose, ":8080");
        assert_eq!(by_number.input_port, "80");

        let by_name = build_forward_target("service/app", "18080:web", &target).expect("name");
        assert_eq!(by_name.container_port, 8080);
        assert_eq!(by_name.local_port, Some(18080));
        assert_eq!(by_name.expose, "18080:8080");

        let unchanged = build_forward_target("service/app", "9090", &target).expect("same");
        assert_eq!(unchanged.expose, ":9090");

        let untargeted = build_forward_target("service/app", "7000", &target).expect("default");
        assert_eq!(untargeted.container_port, 7000);
    }

    #[test]
    fn unknown_ports_are_errors() {
        let target = service_target();

        assert!(matches!(
            build_forward_target("service/app", "grpc", &target),
            Err(PortForwardError::PortNotFound { ref port, .. }) if port == "grpc"
        ));
        assert!(matches!(
            build_forward_target("service/app", "81", &target),
            Err(PortForwardError::PortNotFound { .. })
        ));
        assert!(matches!(
            build_forward_target("service/app", "abc:80", &target),
            Err(PortForwardError::MalformedToken { .. })
        ));
    }

    #[test]
    fn headless_service_keeps_only_declared_ports() {
        let mut headless = service();
        if let Some(spec) = headless.spec.as_mut() {
            spec.cluster_ip = Some("None".to_owned());
        }

        assert_eq!(container_port_by_service_port(&headless, &pod(), 80), Some(80));
        assert_eq!(container_port_by_service_port(&headless, &pod(), 5555), None);

        let target = ResolveTarget::Service {
            service: Box::new(headless),
            pod: Box::new(pod()),
        };
        assert!(matches!(
            build_forward_target("service/app", "5555", &target),
            Err(PortForwardError::PortNotFound { ref port, .. }) if port == "5555"
        ));
    }
}

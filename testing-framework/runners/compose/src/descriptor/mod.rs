//! Strongly typed view of the parts of a compose file the runner needs.
//!
//! Only `services.<name>.ports` is read; every other key is left to
//! `docker compose` itself.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

/// Errors loading or interpreting a compose definition.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("failed to read compose file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse compose file: {source}")]
    Parse {
        #[source]
        source: serde_yaml::Error,
    },
    #[error("service '{service}' declares malformed port '{token}'")]
    MalformedPort { service: String, token: String },
}

/// Parsed compose file.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ComposeDefinition {
    #[serde(default)]
    services: BTreeMap<String, ComposeService>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ComposeService {
    #[serde(default)]
    ports: Option<Vec<PortEntry>>,
}

/// One entry of a service `ports` list.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PortEntry {
    Number(u64),
    Text(String),
    Long { target: u64 },
}

impl ComposeDefinition {
    pub fn load(path: &Path) -> Result<Self, DescriptorError> {
        let raw = fs::read_to_string(path).map_err(|source| DescriptorError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, DescriptorError> {
        serde_yaml::from_str(raw).map_err(|source| DescriptorError::Parse { source })
    }

    /// Container ports of every service that has a `ports` key. Services
    /// without one are not watched; an empty list is kept as declared.
    pub fn declared_ports(&self) -> Result<BTreeMap<String, Vec<u16>>, DescriptorError> {
        self.services
            .iter()
            .filter(|(_, service)| service.ports.is_some())
            .map(|(name, service)| {
                service
                    .container_ports(name)
                    .map(|ports| (name.clone(), ports))
            })
            .collect()
    }
}

impl ComposeService {
    /// Container-side ports of this service, in declaration order.
    pub fn container_ports(&self, name: &str) -> Result<Vec<u16>, DescriptorError> {
        self.ports
            .iter()
            .flatten()
            .map(|entry| entry.container_port(name))
            .collect()
    }
}

impl PortEntry {
    /// The container-side port: the last `:` segment, protocol suffix
    /// removed. Port ranges are not supported.
    pub fn container_port(&self, service: &str) -> Result<u16, DescriptorError> {
        let malformed = |token: String| DescriptorError::MalformedPort {
            service: service.to_owned(),
            token,
        };

        match self {
            Self::Number(port) | Self::Long { target: port } => {
                u16::try_from(*port).map_err(|_| malformed(port.to_string()))
            }
            Self::Text(token) => {
                let container = token.rsplit(':').next().unwrap_or(token);
                let container = container.split('/').next().unwrap_or(container).trim();
                container
                    .parse::<u16>()
                    .map_err(|_| malformed(token.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STACK: &str = r#"
services:
  es:
    image: elasticsearch:8
    ports:
      - 9200
      - "19300:9300"
  oap:
    image: oap
    ports:
      - "127.0.0.1:11800:11800/tcp"
      - target: 12800
        published: 32800
  sidecar:
    image: busybox
    network_mode: host
  empty:
    image: busybox
    ports: []
"#;

    #[test]
    fn container_side_port_is_canonical() {
        let declared = ComposeDefinition::from_yaml_str(STACK)
            .expect("parses")
            .declared_ports()
            .expect("declared");

        assert_eq!(declared["es"], vec![9200, 9300]);
        assert_eq!(declared["oap"], vec![11800, 12800]);
    }

    #[test]
    fn declared_ports_skips_services_without_ports_key() {
        let definition = ComposeDefinition::from_yaml_str(STACK).expect("parses");
        let declared = definition.declared_ports().expect("declared");

        assert!(declared.contains_key("es"));
        assert!(!declared.contains_key("sidecar"));
        assert_eq!(declared.get("empty"), Some(&Vec::new()));
    }

    #[test]
    fn malformed_token_names_service_and_token() {
        let definition = ComposeDefinition::from_yaml_str(
            "services:\n  web:\n    ports:\n      - \"8080:http\"\n      - \"9000-9001\"\n",
        )
        .expect("parses");

        let err = definition.declared_ports().expect_err("malformed");
        assert!(matches!(
            err,
            DescriptorError::MalformedPort { ref service, ref token }
                if service == "web" && token == "8080:http"
        ));
    }
}

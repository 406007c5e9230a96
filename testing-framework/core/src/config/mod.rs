//! Typed view of the `setup` block of an e2e configuration file.
//!
//! The loader resolves relative paths against the configuration file and
//! validates every declared wait condition up front, so that configuration
//! mistakes surface before any container or cluster is touched.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::constants::DEFAULT_WAIT_TIMEOUT;

mod wait;

pub use wait::{WaitCondition, WaitSelector};

/// Configuration failures detected before provisioning starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {source}")]
    Parse {
        #[source]
        source: serde_yaml::Error,
    },
    #[error("no {backend} definition file was provided")]
    MissingDefinitionFile { backend: BackendKind },
    #[error("definition file {path} does not exist")]
    DefinitionNotFound { path: PathBuf },
    #[error("resource must be provided in wait block")]
    MissingWaitResource,
    #[error("wait on {resource} declares no condition")]
    MissingWaitCondition { resource: String },
    #[error(
        "wait on {resource} names a single resource, so label selector '{selector}' can not be set at the same time"
    )]
    ConflictingWaitSelector { resource: String, selector: String },
}

/// Which environment backend a run provisions.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Compose,
    #[serde(alias = "cluster")]
    Kind,
}

impl BackendKind {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Compose => "compose",
            Self::Kind => "kind",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One verification step. Execution belongs to the steps collaborator; the
/// engine only validates the wait conditions it carries.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Step {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub wait: Vec<WaitCondition>,
}

impl Step {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_wait(mut self, condition: WaitCondition) -> Self {
        self.wait.push(condition);
        self
    }
}

/// A port exposure request against a live cluster resource.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ExposePort {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub resource: String,
    /// Comma-separated port tokens: `8080`, `http`, `8080:9090`.
    pub port: String,
}

impl ExposePort {
    pub fn new(
        namespace: impl Into<String>,
        resource: impl Into<String>,
        port: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            resource: resource.into(),
            port: port.into(),
        }
    }

    /// Individual port tokens, trimmed, empty entries dropped.
    pub fn port_tokens(&self) -> impl Iterator<Item = &str> {
        self.port
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }
}

/// Cluster-only settings.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterSpec {
    #[serde(default)]
    pub import_images: Vec<String>,
    #[serde(default)]
    pub expose_ports: Vec<ExposePort>,
}

#[derive(Deserialize)]
struct RawConfig {
    setup: RawSetup,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawSetup {
    env: BackendKind,
    #[serde(default)]
    file: Option<PathBuf>,
    #[serde(default)]
    timeout: Option<i64>,
    #[serde(default)]
    init_system_environment: Option<PathBuf>,
    #[serde(default)]
    steps: Option<Vec<Step>>,
    #[serde(default)]
    kind: Option<ClusterSpec>,
}

/// Immutable description of one test environment.
#[derive(Clone, Debug)]
pub struct EnvironmentSpec {
    backend: BackendKind,
    file: PathBuf,
    timeout: Duration,
    init_system_environment: Option<PathBuf>,
    steps: Option<Vec<Step>>,
    cluster: ClusterSpec,
}

impl EnvironmentSpec {
    /// Start a compose-backed spec for the given compose file.
    pub fn compose(file: impl Into<PathBuf>) -> Self {
        Self::new(BackendKind::Compose, file.into())
    }

    /// Start a kind-backed spec for the given kind cluster config.
    pub fn kind(file: impl Into<PathBuf>) -> Self {
        Self::new(BackendKind::Kind, file.into())
    }

    const fn new(backend: BackendKind, file: PathBuf) -> Self {
        Self {
            backend,
            file,
            timeout: DEFAULT_WAIT_TIMEOUT,
            init_system_environment: None,
            steps: None,
            cluster: ClusterSpec {
                import_images: Vec::new(),
                expose_ports: Vec::new(),
            },
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = Some(steps);
        self
    }

    #[must_use]
    pub fn with_init_system_environment(mut self, path: impl Into<PathBuf>) -> Self {
        self.init_system_environment = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.cluster.import_images.push(image.into());
        self
    }

    #[must_use]
    pub fn with_exposure(mut self, exposure: ExposePort) -> Self {
        self.cluster.expose_ports.push(exposure);
        self
    }

    /// Load and validate the `setup` block of a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let anchored = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        Self::from_yaml_str(&raw, anchored.parent())
    }

    /// Parse a configuration document, resolving relative paths against
    /// `base_dir` when given.
    pub fn from_yaml_str(raw: &str, base_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let RawConfig { setup } =
            serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse { source })?;

        let file = setup
            .file
            .filter(|file| !file.as_os_str().is_empty())
            .ok_or(ConfigError::MissingDefinitionFile {
                backend: setup.env,
            })?;

        let timeout = match setup.timeout {
            Some(secs) if secs > 0 => Duration::from_secs(secs.unsigned_abs()),
            _ => DEFAULT_WAIT_TIMEOUT,
        };

        let spec = Self {
            backend: setup.env,
            file: resolve(base_dir, file),
            timeout,
            init_system_environment: setup
                .init_system_environment
                .filter(|path| !path.as_os_str().is_empty())
                .map(|path| resolve(base_dir, path)),
            steps: setup.steps,
            cluster: setup.kind.unwrap_or_default(),
        };
        spec.validate_waits()?;
        Ok(spec)
    }

    /// Check every wait condition carried by the steps.
    pub fn validate_waits(&self) -> Result<(), ConfigError> {
        self.steps
            .iter()
            .flatten()
            .flat_map(|step| step.wait.iter())
            .try_for_each(|condition| condition.selector().map(|_| ()))
    }

    /// Fail fast when the definition file is missing on disk.
    pub fn ensure_definition_exists(&self) -> Result<(), ConfigError> {
        if self.file.exists() {
            Ok(())
        } else {
            Err(ConfigError::DefinitionNotFound {
                path: self.file.clone(),
            })
        }
    }

    #[must_use]
    pub const fn backend(&self) -> BackendKind {
        self.backend
    }

    #[must_use]
    pub fn file(&self) -> &Path {
        &self.file
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn init_system_environment(&self) -> Option<&Path> {
        self.init_system_environment.as_deref()
    }

    /// `None` means no steps were declared at all, which differs from an
    /// empty list.
    #[must_use]
    pub fn steps(&self) -> Option<&[Step]> {
        self.steps.as_deref()
    }

    #[must_use]
    pub const fn cluster(&self) -> &ClusterSpec {
        &self.cluster
    }
}

fn resolve(base_dir: Option<&Path>, path: PathBuf) -> PathBuf {
    match base_dir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path,
    }
}

pub(crate) fn default_namespace() -> String {
    crate::constants::DEFAULT_NAMESPACE.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPOSE_CONFIG: &str = r#"
setup:
  env: compose
  file: docker-compose.yml
  timeout: 120
  steps:
    - name: seed
      command: ./seed.sh
"#;

    const KIND_CONFIG: &str = r#"
setup:
  env: kind
  file: kind.yaml
  init-system-environment: env.profile
  steps:
    - name: deploy
      path: manifests/app.yaml
      wait:
        - namespace: apps
          resource: pod
          label-selector: app=demo
          for: condition=Ready
  kind:
    import-images:
      - demo:${TAG}
    expose-ports:
      - namespace: apps
        resource: service/demo
        port: "8080, http"
"#;

    #[test]
    fn compose_config_resolves_relative_paths() {
        let spec = EnvironmentSpec::from_yaml_str(COMPOSE_CONFIG, Some(Path::new("/work/e2e")))
            .expect("compose config parses");

        assert_eq!(spec.backend(), BackendKind::Compose);
        assert_eq!(spec.file(), Path::new("/work/e2e/docker-compose.yml"));
        assert_eq!(spec.timeout(), Duration::from_secs(120));
        assert_eq!(spec.steps().map(<[Step]>::len), Some(1));
        assert!(spec.cluster().expose_ports.is_empty());
    }

    #[test]
    fn kind_config_carries_cluster_section() {
        let spec = EnvironmentSpec::from_yaml_str(KIND_CONFIG, None).expect("kind config parses");

        assert_eq!(spec.backend(), BackendKind::Kind);
        assert_eq!(spec.timeout(), DEFAULT_WAIT_TIMEOUT);
        assert_eq!(spec.init_system_environment(), Some(Path::new("env.profile")));
        assert_eq!(spec.cluster().import_images, vec!["demo:${TAG}".to_owned()]);

        let exposure = &spec.cluster().expose_ports[0];
        assert_eq!(exposure.namespace, "apps");
        assert_eq!(exposure.port_tokens().collect::<Vec<_>>(), vec!["8080", "http"]);

        let wait = &spec.steps().expect("steps")[0].wait[0];
        assert_eq!(wait.label_selector.as_deref(), Some("app=demo"));
        assert_eq!(wait.for_condition, "condition=Ready");
    }

    #[test]
    fn missing_steps_differs_from_empty_steps() {
        let absent = "setup:\n  env: kind\n  file: kind.yaml\n";
        let empty = "setup:\n  env: kind\n  file: kind.yaml\n  steps: []\n";

        let absent = EnvironmentSpec::from_yaml_str(absent, None).expect("parses");
        let empty = EnvironmentSpec::from_yaml_str(empty, None).expect("parses");

        assert!(absent.steps().is_none());
        assert_eq!(empty.steps().map(<[Step]>::len), Some(0));
    }

    #[test]
    fn missing_definition_file_is_rejected() {
        let err = EnvironmentSpec::from_yaml_str("setup:\n  env: compose\n", None)
            .expect_err("file is required");

        assert!(matches!(
            err,
            ConfigError::MissingDefinitionFile {
                backend: BackendKind::Compose
            }
        ));
    }

    #[test]
    fn non_positive_timeout_falls_back_to_default() {
        let raw = "setup:\n  env: compose\n  file: c.yml\n  timeout: -1\n";
        let spec = EnvironmentSpec::from_yaml_str(raw, None).expect("parses");

        assert_eq!(spec.timeout(), DEFAULT_WAIT_TIMEOUT);
    }

    #[test]
    fn conflicting_wait_selector_fails_at_load() {
        let raw = r#"
setup:
  env: kind
  file: kind.yaml
  steps:
    - name: broken
      wait:
        - resource: deployment/app
          label-selector: app=demo
          for: condition=Available
"#;
        let err = EnvironmentSpec::from_yaml_str(raw, None).expect_err("selector conflict");

        assert!(matches!(err, ConfigError::ConflictingWaitSelector { .. }));
    }

    #[test]
    fn cluster_alias_selects_kind_backend() {
        let raw = "setup:\n  env: cluster\n  file: kind.yaml\n";
        let spec = EnvironmentSpec::from_yaml_str(raw, None).expect("parses");

        assert_eq!(spec.backend(), BackendKind::Kind);
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("e2e.yaml");
        fs::write(&path, COMPOSE_CONFIG).expect("write config");

        let spec = EnvironmentSpec::load(&path).expect("loads");

        assert_eq!(spec.file(), dir.path().join("docker-compose.yml"));
        assert!(matches!(
            spec.ensure_definition_exists(),
            Err(ConfigError::DefinitionNotFound { .. })
        ));
    }

    #[test]
    fn relative_config_path_yields_absolute_definition_file() {
        let dir = tempfile::tempdir_in(".").expect("tempdir");
        let nested = dir.path().join("e2e");
        fs::create_dir(&nested).expect("create nested dir");
        let path = nested.join("config.yaml");
        fs::write(&path, COMPOSE_CONFIG).expect("write config");
        assert!(path.is_relative());

        let spec = EnvironmentSpec::load(&path).expect("loads");

        assert!(spec.file().is_absolute());
        assert!(spec.file().ends_with("e2e/docker-compose.yml"));
        assert_eq!(
            spec.file(),
            std::path::absolute(nested.join("docker-compose.yml")).expect("absolute")
        );
    }
}

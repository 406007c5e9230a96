use std::time::Duration;

use serde::{Deserialize, Deserializer};

use super::{ConfigError, default_namespace};

/// A readiness condition awaited on cluster resources after a step.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct WaitCondition {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Either a kind (`pod`) or a single object (`deployment/app`).
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub label_selector: Option<String>,
    /// Passed to `kubectl wait --for`, e.g. `condition=Ready`.
    #[serde(rename = "for", default)]
    pub for_condition: String,
    /// Per-condition deadline in seconds; absent means the run timeout.
    #[serde(default, deserialize_with = "optional_seconds")]
    pub timeout: Option<Duration>,
}

/// How a wait condition addresses the resources it waits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitSelector<'a> {
    /// `kind/name`.
    Named(&'a str),
    /// A kind narrowed by a label selector.
    Labelled { kind: &'a str, selector: &'a str },
    /// Every object of a kind in the namespace.
    All(&'a str),
}

impl WaitCondition {
    pub fn new(
        namespace: impl Into<String>,
        resource: impl Into<String>,
        for_condition: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            resource: resource.into(),
            label_selector: None,
            for_condition: for_condition.into(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validate the condition and describe how it selects resources.
    pub fn selector(&self) -> Result<WaitSelector<'_>, ConfigError> {
        let resource = self.resource.trim();
        if resource.is_empty() {
            return Err(ConfigError::MissingWaitResource);
        }
        if self.for_condition.trim().is_empty() {
            return Err(ConfigError::MissingWaitCondition {
                resource: resource.to_owned(),
            });
        }

        let selector = self
            .label_selector
            .as_deref()
            .map(str::trim)
            .filter(|selector| !selector.is_empty());

        match (resource.contains('/'), selector) {
            (true, Some(selector)) => Err(ConfigError::ConflictingWaitSelector {
                resource: resource.to_owned(),
                selector: selector.to_owned(),
            }),
            (true, None) => Ok(WaitSelector::Named(resource)),
            (false, Some(selector)) => Ok(WaitSelector::Labelled {
                kind: resource,
                selector,
            }),
            (false, None) => Ok(WaitSelector::All(resource)),
        }
    }

    /// Effective deadline given the run-level default.
    #[must_use]
    pub fn timeout_or(&self, fallback: Duration) -> Duration {
        self.timeout.unwrap_or(fallback)
    }
}

fn optional_seconds<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = Option::<i64>::deserialize(deserializer)?;
    Ok(secs
        .filter(|secs| *secs > 0)
        .map(|secs| Duration::from_secs(secs.unsigned_abs())))
}

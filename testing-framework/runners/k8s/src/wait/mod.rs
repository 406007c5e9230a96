//! Concurrent waits on cluster resource conditions.

use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use infra_e2e_core::{ClusterHandle, ConfigError, WaitCondition, WaitSelector};
use thiserror::Error;
use tokio::{process::Command, sync::mpsc, task::JoinSet, time::timeout};
use tracing::{debug, info};

/// Slack granted to `kubectl wait` beyond its own `--timeout`.
const KUBECTL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
/// Failures while waiting on cluster conditions.
pub enum ClusterWaitError {
    #[error("invalid wait condition: {source}")]
    InvalidCondition {
        #[source]
        source: ConfigError,
    },
    #[error("{resource} in namespace {namespace} did not reach {condition} within {timeout:?}")]
    ConditionTimeout {
        resource: String,
        namespace: String,
        condition: String,
        timeout: Duration,
    },
    #[error("waiting for {condition} on {resource} in namespace {namespace} failed: {stderr}")]
    ConditionFailed {
        resource: String,
        namespace: String,
        condition: String,
        stderr: String,
    },
    #[error("failed to spawn kubectl wait: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },
    #[error("wait task failed: {source}")]
    Task {
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Blocks until one condition holds or its timeout passes.
#[async_trait]
pub trait ConditionProbe: Send + Sync + 'static {
    async fn wait(&self, condition: &WaitCondition, timeout: Duration)
    -> Result<(), ClusterWaitError>;
}

/// [`ConditionProbe`] running `kubectl wait`.
#[derive(Clone, Debug)]
pub struct KubectlWait {
    kubeconfig: PathBuf,
}

impl KubectlWait {
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
        }
    }

    #[must_use]
    pub fn for_cluster(handle: &ClusterHandle) -> Self {
        Self::new(handle.kubeconfig.clone())
    }
}

/// `kubectl wait` arguments after the global flags.
pub fn wait_args(condition: &WaitCondition, timeout: Duration) -> Result<Vec<String>, ConfigError> {
    let mut args = vec![
        "wait".to_owned(),
        "--namespace".to_owned(),
        condition.namespace.clone(),
        format!("--for={}", condition.for_condition.trim()),
        format!("--timeout={}s", timeout.as_secs().max(1)),
    ];

    match condition.selector()? {
        WaitSelector::Named(resource) => args.push(resource.to_owned()),
        WaitSelector::Labelled { kind, selector } => {
            args.push(kind.to_owned());
            args.push(format!("--selector={selector}"));
        }
        WaitSelector::All(kind) => {
            args.push(kind.to_owned());
            args.push("--all".to_owned());
        }
    }
    Ok(args)
}

#[async_trait]
impl ConditionProbe for KubectlWait {
    async fn wait(
        &self,
        condition: &WaitCondition,
        limit: Duration,
    ) -> Result<(), ClusterWaitError> {
        let args =
            wait_args(condition, limit).map_err(|source| ClusterWaitError::InvalidCondition { source })?;
        let timed_out = || ClusterWaitError::ConditionTimeout {
            resource: condition.resource.clone(),
            namespace: condition.namespace.clone(),
            condition: condition.for_condition.clone(),
            timeout: limit,
        };

        let mut cmd = Command::new("kubectl");
        cmd.arg("--kubeconfig")
            .arg(&self.kubeconfig)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(?args, "running kubectl wait");
        let output = timeout(limit + KUBECTL_GRACE, cmd.output())
            .await
            .map_err(|_| timed_out())?
            .map_err(|source| ClusterWaitError::Spawn { source })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        if stderr.contains("timed out") {
            return Err(timed_out());
        }
        Err(ClusterWaitError::ConditionFailed {
            resource: condition.resource.clone(),
            namespace: condition.namespace.clone(),
            condition: condition.for_condition.clone(),
            stderr,
        })
    }
}

/// Runs every wait condition concurrently and reports the first failure.
pub struct ConditionWaiter<P: ?Sized> {
    probe: Arc<P>,
}

impl<P: ConditionProbe> ConditionWaiter<P> {
    pub fn new(probe: P) -> Self {
        Self {
            probe: Arc::new(probe),
        }
    }
}

impl<P: ConditionProbe + ?Sized> ConditionWaiter<P> {
    /// Waiter over an already shared probe.
    pub const fn shared(probe: Arc<P>) -> Self {
        Self { probe }
    }

    /// Validate all conditions, then wait on them concurrently. Conditions
    /// without their own timeout use `default_timeout`.
    pub async fn wait_all(
        &self,
        conditions: &[WaitCondition],
        default_timeout: Duration,
    ) -> Result<(), ClusterWaitError> {
        for condition in conditions {
            condition
                .selector()
                .map_err(|source| ClusterWaitError::InvalidCondition { source })?;
        }
        if conditions.is_empty() {
            return Ok(());
        }

        let (errors_tx, mut errors_rx) = mpsc::channel(conditions.len());
        let mut waits = JoinSet::new();

        for condition in conditions.iter().cloned() {
            let probe = Arc::clone(&self.probe);
            let errors = errors_tx.clone();
            let limit = condition.timeout_or(default_timeout);

            waits.spawn(async move {
                info!(
                    resource = %condition.resource,
                    namespace = %condition.namespace,
                    condition = %condition.for_condition,
                    timeout_secs = limit.as_secs(),
                    "waiting for resource condition"
                );
                if let Err(err) = probe.wait(&condition, limit).await {
                    let _ = errors.send(err).await;
                }
            });
        }
        drop(errors_tx);

        let mut task_failure = None;
        while let Some(joined) = waits.join_next().await {
            if let Err(source) = joined {
                task_failure.get_or_insert(ClusterWaitError::Task { source });
            }
        }

        match errors_rx.try_recv() {
            Ok(err) => Err(err),
            Err(_) => task_failure.map_or(Ok(()), Err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[derive(Default)]
    struct RecordingProbe {
        calls: AtomicUsize,
        timeouts: Mutex<Vec<Duration>>,
        failing: Vec<String>,
    }

    #[async_trait]
    impl ConditionProbe for RecordingProbe {
        async fn wait(
            &self,
            condition: &WaitCondition,
            limit: Duration,
        ) -> Result<(), ClusterWaitError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.timeouts.lock().expect("lock").push(limit);
            if self.failing.contains(&condition.resource) {
                return Err(ClusterWaitError::ConditionFailed {
                    resource: condition.resource.clone(),
                    namespace: condition.namespace.clone(),
                    condition: condition.for_condition.clone(),
                    stderr: "boom".to_owned(),
                });
            }
            Ok(())
        }
    }

    fn ready(resource: &str) -> WaitCondition {
        WaitCondition::new("default", resource, "condition=Ready")
    }

    #[tokio::test]
    async fn conflicting_selector_rejected_before_any_wait() {
        let waiter = ConditionWaiter::new(RecordingProbe::default());
        let conditions = vec![
            ready("pod"),
            ready("pod/a").with_label_selector("app=x"),
        ];

        let err = waiter
            .wait_all(&conditions, Duration::from_secs(5))
            .await
            .expect_err("rejected");

        assert!(matches!(
            err,
            ClusterWaitError::InvalidCondition {
                source: ConfigError::ConflictingWaitSelector { .. }
            }
        ));
        assert_eq!(waiter.probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_conditions_run_and_first_failure_is_reported() {
        let waiter = ConditionWaiter::new(RecordingProbe {
            failing: vec!["deployment/bad".to_owned()],
            ..RecordingProbe::default()
        });
        let conditions = vec![
            ready("pod"),
            ready("deployment/bad"),
            ready("deployment/good").with_timeout(Duration::from_secs(3)),
        ];

        let err = waiter
            .wait_all(&conditions, Duration::from_secs(30))
            .await
            .expect_err("one failure");

        assert!(matches!(
            err,
            ClusterWaitError::ConditionFailed { ref resource, .. } if resource == "deployment/bad"
        ));
        assert_eq!(waiter.probe.calls.load(Ordering::SeqCst), 3);

        let mut timeouts = waiter.probe.timeouts.lock().expect("lock").clone();
        timeouts.sort();
        assert_eq!(
            timeouts,
            vec![
                Duration::from_secs(3),
                Duration::from_secs(30),
                Duration::from_secs(30)
            ]
        );
    }

    #[tokio::test]
    async fn no_conditions_is_success() {
        let waiter = ConditionWaiter::new(RecordingProbe::default());

        waiter
            .wait_all(&[], Duration::from_secs(1))
            .await
            .expect("nothing to wait on");
    }

    #[test]
    fn kubectl_args_follow_selector_kind() {
        let limit = Duration::from_secs(60);

        let named = wait_args(&ready("deployment/app"), limit).expect("args");
        assert_eq!(named.last().map(String::as_str), Some("deployment/app"));
        assert!(named.contains(&"--timeout=60s".to_owned()));

        let labelled =
            wait_args(&ready("pod").with_label_selector("app=demo"), limit).expect("args");
        assert_eq!(&labelled[5..], ["pod", "--selector=app=demo"]);

        let all = wait_args(&ready("pods"), limit).expect("args");
        assert_eq!(&all[5..], ["pods", "--all"]);
    }
}

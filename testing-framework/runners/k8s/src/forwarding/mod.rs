//! Port tunnels into cluster resources and their shared lifecycle.
//!
//! Every tunnel worker is spawned through a [`PortForwardContext`]. The
//! context counts workers and collects one completion acknowledgement from
//! each, so [`PortForwardContext::shutdown`] returns only once every worker
//! has unwound.

pub mod ports;
pub mod tunnel;

use std::{future::Future, io, sync::Arc, time::Duration};

use async_trait::async_trait;
use infra_e2e_core::{
    EnvError, EnvironmentVariableBroker, ExposePort, constants::FORWARD_HOST, host_key, port_key,
    sanitize_resource_name,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use ports::{ForwardTarget, PortToken, ResolveTarget, build_forward_target};
pub use tunnel::KubeTunnels;

#[derive(Debug, thiserror::Error)]
pub enum PortForwardError {
    #[error("resource '{resource}' can not be port-forwarded; use pod/, service/ or deployment/")]
    UnsupportedResource { resource: String },
    #[error("failed to look up {resource}: {source}")]
    Lookup {
        resource: String,
        #[source]
        source: kube::Error,
    },
    #[error("{resource} declares no pod selector")]
    MissingSelector { resource: String },
    #[error("no running pod found for {resource} with labels {selector}")]
    NoRunningPod { resource: String, selector: String },
    #[error("{resource} did not reach phase Running within {timeout:?}")]
    PodNotRunning { resource: String, timeout: Duration },
    #[error("port '{port}' not found on {resource}")]
    PortNotFound { resource: String, port: String },
    #[error("malformed port token '{token}' for {resource}")]
    MalformedToken { resource: String, token: String },
    #[error("failed to bind local port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to open port forward to pod {pod}: {source}")]
    Dial {
        pod: String,
        #[source]
        source: kube::Error,
    },
    #[error("port forward to pod {pod} returned no stream for port {port}")]
    StreamUnavailable { pod: String, port: u16 },
    #[error("port forward for {resource} was not ready within {timeout:?}")]
    ReadyTimeout { resource: String, timeout: Duration },
    #[error("port forward worker for {resource} exited before becoming ready")]
    WorkerExited { resource: String },
    #[error("port forward worker for {resource} panicked")]
    WorkerPanicked { resource: String },
    #[error(transparent)]
    Env(#[from] EnvError),
}

/// Lifecycle of the shared forwarding context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardState {
    Idle,
    Exposing,
    Active,
    Draining,
    Stopped,
}

/// A local port tunnelled to a remote container port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForwardedPort {
    pub local: u16,
    pub remote: u16,
}

/// Handed to a worker to announce its bound ports.
pub struct ReadySender(oneshot::Sender<Vec<ForwardedPort>>);

impl ReadySender {
    pub fn send(self, ports: Vec<ForwardedPort>) {
        let _ = self.0.send(ports);
    }
}

/// Resolves when the context broadcasts stop or is cancelled.
pub struct StopSignal {
    stop: broadcast::Receiver<()>,
    cancel: CancellationToken,
}

impl StopSignal {
    pub async fn stopped(&mut self) {
        tokio::select! {
            _ = self.stop.recv() => {}
            () = self.cancel.cancelled() => {}
        }
    }
}

/// Readiness of one spawned worker.
pub struct WorkerHandle {
    label: String,
    ready_rx: oneshot::Receiver<Vec<ForwardedPort>>,
    error_rx: oneshot::Receiver<PortForwardError>,
}

impl WorkerHandle {
    /// Bound ports once the worker is ready, or the error it failed with.
    pub async fn wait_ready(self) -> Result<Vec<ForwardedPort>, PortForwardError> {
        match self.ready_rx.await {
            Ok(ports) => Ok(ports),
            Err(_) => match self.error_rx.await {
                Ok(err) => Err(err),
                Err(_) => Err(PortForwardError::WorkerExited {
                    resource: self.label,
                }),
            },
        }
    }
}

/// Shared stop, cancellation and drain state of every tunnel in a run.
pub struct PortForwardContext {
    cancel: CancellationToken,
    stop: broadcast::Sender<()>,
    resource_count: usize,
    finished_tx: mpsc::Sender<()>,
    finished_rx: mpsc::Receiver<()>,
    state: ForwardState,
}

impl PortForwardContext {
    /// Context sized for `capacity` workers.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (stop, _) = broadcast::channel(1);
        let (finished_tx, finished_rx) = mpsc::channel(capacity.max(1));
        Self {
            cancel: CancellationToken::new(),
            stop,
            resource_count: 0,
            finished_tx,
            finished_rx,
            state: ForwardState::Idle,
        }
    }

    #[must_use]
    pub const fn state(&self) -> ForwardState {
        self.state
    }

    #[must_use]
    pub const fn resource_count(&self) -> usize {
        self.resource_count
    }

    /// True while tunnels are live and teardown must drain them.
    #[must_use]
    pub fn should_wait_signal(&self) -> bool {
        self.resource_count > 0 && self.state == ForwardState::Active
    }

    /// Spawn a worker. It acknowledges completion exactly once on every
    /// exit path, panics included.
    pub fn spawn_worker<F, Fut>(&mut self, label: impl Into<String>, worker: F) -> WorkerHandle
    where
        F: FnOnce(ReadySender, StopSignal) -> Fut,
        Fut: Future<Output = Result<(), PortForwardError>> + Send + 'static,
    {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (error_tx, error_rx) = oneshot::channel();
        let signal = StopSignal {
            stop: self.stop.subscribe(),
            cancel: self.cancel.clone(),
        };
        let cancel = self.cancel.clone();
        let finished = self.finished_tx.clone();
        let label = label.into();
        let task_label = label.clone();
        let fut = worker(ReadySender(ready_tx), signal);

        self.resource_count += 1;
        tokio::spawn(async move {
            let mut inner = tokio::spawn(fut);
            let outcome = tokio::select! {
                joined = &mut inner => joined.unwrap_or_else(|_| {
                    Err(PortForwardError::WorkerPanicked {
                        resource: task_label.clone(),
                    })
                }),
                () = cancel.cancelled() => {
                    inner.abort();
                    let _ = inner.await;
                    Ok(())
                }
            };
            if let Err(err) = outcome {
                warn!(resource = %task_label, error = %err, "port forward worker failed");
                let _ = error_tx.send(err);
            }
            let _ = finished.send(()).await;
        });

        WorkerHandle {
            label,
            ready_rx,
            error_rx,
        }
    }

    /// Broadcast stop, then wait for every worker's acknowledgement.
    /// Returns the number of acknowledgements received.
    pub async fn shutdown(&mut self) -> usize {
        if self.state == ForwardState::Stopped {
            return 0;
        }
        self.state = ForwardState::Draining;
        let _ = self.stop.send(());

        let mut acknowledged = 0;
        while acknowledged < self.resource_count {
            if self.finished_rx.recv().await.is_none() {
                break;
            }
            acknowledged += 1;
        }

        self.state = ForwardState::Stopped;
        info!(workers = acknowledged, "port forwards drained");
        acknowledged
    }

    /// Cancel every worker outright, then drain.
    pub async fn abort(&mut self) -> usize {
        self.cancel.cancel();
        self.shutdown().await
    }
}

/// Locates forwardable pods and runs tunnel workers.
#[async_trait]
pub trait TunnelBackend: Send + Sync + 'static {
    /// Find the live object behind `resource` in `namespace`.
    async fn locate(
        &self,
        namespace: &str,
        resource: &str,
        timeout: Duration,
    ) -> Result<ResolveTarget, PortForwardError>;

    /// Tunnel `targets` into `pod` until stopped. Calls `ready` once every
    /// local port is bound.
    async fn forward(
        &self,
        namespace: String,
        pod: String,
        targets: Vec<ForwardTarget>,
        ready: ReadySender,
        stop: StopSignal,
    ) -> Result<(), PortForwardError>;
}

/// Opens the declared exposures and publishes their local endpoints.
pub struct PortForwardSupervisor {
    backend: Arc<dyn TunnelBackend>,
    broker: EnvironmentVariableBroker,
}

impl PortForwardSupervisor {
    pub fn new(backend: Arc<dyn TunnelBackend>, broker: EnvironmentVariableBroker) -> Self {
        Self { backend, broker }
    }

    /// Open every exposure. On the first failure all tunnels already opened
    /// are cancelled and drained before the error is returned.
    pub async fn expose(
        &self,
        exposures: &[ExposePort],
        timeout: Duration,
    ) -> Result<PortForwardContext, PortForwardError> {
        let mut context = PortForwardContext::new(exposures.len());
        context.state = ForwardState::Exposing;

        for exposure in exposures {
            if let Err(err) = self.expose_one(&mut context, exposure, timeout).await {
                warn!(resource = %exposure.resource, error = %err, "port exposure failed");
                context.abort().await;
                return Err(err);
            }
        }

        context.state = ForwardState::Active;
        Ok(context)
    }

    async fn expose_one(
        &self,
        context: &mut PortForwardContext,
        exposure: &ExposePort,
        timeout: Duration,
    ) -> Result<(), PortForwardError> {
        let target = self
            .backend
            .locate(&exposure.namespace, &exposure.resource, timeout)
            .await?;

        let forwards = exposure
            .port_tokens()
            .map(|token| build_forward_target(&exposure.resource, token, &target))
            .collect::<Result<Vec<_>, _>>()?;
        if forwards.is_empty() {
            return Err(PortForwardError::MalformedToken {
                resource: exposure.resource.clone(),
                token: exposure.port.clone(),
            });
        }

        info!(
            resource = %exposure.resource,
            namespace = %exposure.namespace,
            pod = target.pod_name(),
            ports = ?forwards.iter().map(|f| f.expose.as_str()).collect::<Vec<_>>(),
            "opening port forward"
        );

        let backend = Arc::clone(&self.backend);
        let namespace = exposure.namespace.clone();
        let pod = target.pod_name().to_owned();
        let targets = forwards.clone();
        let handle = context.spawn_worker(exposure.resource.clone(), move |ready, stop| async move {
            backend.forward(namespace, pod, targets, ready, stop).await
        });

        let forwarded = tokio::time::timeout(timeout, handle.wait_ready())
            .await
            .map_err(|_| PortForwardError::ReadyTimeout {
                resource: exposure.resource.clone(),
                timeout,
            })??;

        self.publish(exposure, &forwards, &forwarded)
    }

    fn publish(
        &self,
        exposure: &ExposePort,
        forwards: &[ForwardTarget],
        forwarded: &[ForwardedPort],
    ) -> Result<(), PortForwardError> {
        let prefix = sanitize_resource_name(&exposure.resource);
        self.broker.publish(&host_key(&prefix), FORWARD_HOST)?;

        for port in forwarded {
            for forward in forwards.iter().filter(|f| f.container_port == port.remote) {
                debug!(resource = %exposure.resource, local = port.local, remote = port.remote, "tunnel ready");
                self.broker
                    .publish(&port_key(&prefix, &forward.input_port), &port.local.to_string())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn drain_waits_for_every_worker_even_when_one_fails() {
        let mut context = PortForwardContext::new(3);
        let finished = Arc::new(AtomicUsize::new(0));

        for index in 0..3 {
            let finished = Arc::clone(&finished);
            let handle = context.spawn_worker(format!("worker-{index}"), move |ready, mut stop| {
                async move {
                    if index == 1 {
                        finished.fetch_add(1, Ordering::SeqCst);
                        return Err(PortForwardError::StreamUnavailable {
                            pod: "p".to_owned(),
                            port: 80,
                        });
                    }
                    ready.send(vec![ForwardedPort {
                        local: 40_000 + index,
                        remote: 80,
                    }]);
                    stop.stopped().await;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });

            let outcome = handle.wait_ready().await;
            assert_eq!(outcome.is_err(), index == 1);
        }

        assert_eq!(context.resource_count(), 3);
        let acknowledged = context.shutdown().await;

        assert_eq!(acknowledged, 3);
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert_eq!(context.state(), ForwardState::Stopped);
        assert_eq!(context.shutdown().await, 0);
    }

    #[tokio::test]
    async fn abort_cancels_workers_that_ignore_stop() {
        let mut context = PortForwardContext::new(1);
        let _handle = context.spawn_worker("stuck", |_ready, _stop| async move {
            std::future::pending::<()>().await;
            Ok(())
        });

        let acknowledged = tokio::time::timeout(Duration::from_secs(5), context.abort())
            .await
            .expect("abort completes");

        assert_eq!(acknowledged, 1);
    }

    #[tokio::test]
    async fn worker_exiting_without_ready_is_reported() {
        let mut context = PortForwardContext::new(1);
        let handle = context.spawn_worker("quiet", |_ready, _stop| async move { Ok(()) });

        assert!(matches!(
            handle.wait_ready().await,
            Err(PortForwardError::WorkerExited { ref resource }) if resource == "quiet"
        ));
        assert_eq!(context.shutdown().await, 1);
    }

    #[tokio::test]
    async fn panicking_worker_is_still_acknowledged() {
        let mut context = PortForwardContext::new(2);
        let steady = context.spawn_worker("steady", |ready, mut stop| async move {
            ready.send(vec![ForwardedPort {
                local: 40_100,
                remote: 80,
            }]);
            stop.stopped().await;
            Ok(())
        });
        let broken = context.spawn_worker("broken", |_ready, _stop| async move {
            let stream: Option<u16> = None;
            stream.expect("tunnel worker blew up");
            Ok(())
        });

        assert!(steady.wait_ready().await.is_ok());
        assert!(matches!(
            broken.wait_ready().await,
            Err(PortForwardError::WorkerPanicked { ref resource }) if resource == "broken"
        ));

        let acknowledged = tokio::time::timeout(Duration::from_secs(5), context.shutdown())
            .await
            .expect("drain completes after a panic");
        assert_eq!(acknowledged, 2);
    }

    #[test]
    fn idle_context_needs_no_signal() {
        let context = PortForwardContext::new(0);

        assert!(!context.should_wait_signal());
        assert_eq!(context.state(), ForwardState::Idle);
    }
}

//! [`TunnelBackend`] over the Kubernetes port-forward API.

use std::{
    collections::BTreeMap,
    future::Future,
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use async_trait::async_trait;
use infra_e2e_core::constants::DEFAULT_POD_POLL_INTERVAL;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Pod, Service},
};
use kube::{
    Client,
    api::{Api, ListParams},
};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
    time::Instant,
};
use tracing::{debug, warn};

use super::{
    ForwardTarget, ForwardedPort, PortForwardError, ReadySender, ResolveTarget, StopSignal,
    TunnelBackend,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ResourceKind {
    Pod,
    Service,
    Deployment,
}

/// Split `kind/name`; a bare name is a pod.
fn parse_resource(resource: &str) -> Result<(ResourceKind, &str), PortForwardError> {
    let unsupported = || PortForwardError::UnsupportedResource {
        resource: resource.to_owned(),
    };
    let (kind, name) = resource.split_once('/').unwrap_or(("pod", resource));
    if name.is_empty() {
        return Err(unsupported());
    }
    let kind = match kind.to_ascii_lowercase().as_str() {
        "po" | "pod" | "pods" => ResourceKind::Pod,
        "svc" | "service" | "services" => ResourceKind::Service,
        "deploy" | "deployment" | "deployments" => ResourceKind::Deployment,
        _ => return Err(unsupported()),
    };
    Ok((kind, name))
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running")
}

/// Calls `fetch` every `interval` until it returns a running pod. `None`
/// once `timeout` has passed without one.
async fn poll_running_pod<F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut fetch: F,
) -> Result<Option<Pod>, PortForwardError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<Pod>, PortForwardError>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(pod) = fetch().await?.into_iter().find(is_running) {
            return Ok(Some(pod));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Delay before the next `accept` after consecutive failures.
#[derive(Debug)]
struct AcceptBackoff {
    current: Duration,
}

impl AcceptBackoff {
    const INITIAL: Duration = Duration::from_millis(50);
    const MAX: Duration = Duration::from_secs(1);

    const fn new() -> Self {
        Self {
            current: Self::INITIAL,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(Self::MAX);
        delay
    }

    fn reset(&mut self) {
        self.current = Self::INITIAL;
    }
}

/// Tunnels opened through the API server.
#[derive(Clone)]
pub struct KubeTunnels {
    client: Client,
}

impl KubeTunnels {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    async fn running_pod(
        &self,
        namespace: &str,
        resource: &str,
        labels: Option<&BTreeMap<String, String>>,
        timeout: Duration,
    ) -> Result<Pod, PortForwardError> {
        let labels = labels
            .filter(|labels| !labels.is_empty())
            .ok_or_else(|| PortForwardError::MissingSelector {
                resource: resource.to_owned(),
            })?;
        let selector = label_selector(labels);
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&selector);
        let shown = selector.as_str();

        let found = poll_running_pod(timeout, DEFAULT_POD_POLL_INTERVAL, || {
            let pods = pods.clone();
            let params = params.clone();
            async move {
                debug!(resource, selector = shown, "looking for a running pod");
                pods.list(&params)
                    .await
                    .map(|list| list.items)
                    .map_err(|source| PortForwardError::Lookup {
                        resource: resource.to_owned(),
                        source,
                    })
            }
        })
        .await?;

        found.ok_or_else(|| PortForwardError::NoRunningPod {
            resource: resource.to_owned(),
            selector,
        })
    }

    async fn running_named_pod(
        &self,
        namespace: &str,
        resource: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<Pod, PortForwardError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        let found = poll_running_pod(timeout, DEFAULT_POD_POLL_INTERVAL, || {
            let pods = pods.clone();
            async move {
                pods.get(name)
                    .await
                    .map(|pod| vec![pod])
                    .map_err(|source| PortForwardError::Lookup {
                        resource: resource.to_owned(),
                        source,
                    })
            }
        })
        .await?;

        found.ok_or_else(|| PortForwardError::PodNotRunning {
            resource: resource.to_owned(),
            timeout,
        })
    }
}

#[async_trait]
impl TunnelBackend for KubeTunnels {
    async fn locate(
        &self,
        namespace: &str,
        resource: &str,
        timeout: Duration,
    ) -> Result<ResolveTarget, PortForwardError> {
        let lookup = |source| PortForwardError::Lookup {
            resource: resource.to_owned(),
            source,
        };
        let (kind, name) = parse_resource(resource)?;

        match kind {
            ResourceKind::Pod => {
                let pod = self
                    .running_named_pod(namespace, resource, name, timeout)
                    .await?;
                Ok(ResolveTarget::Pod(Box::new(pod)))
            }
            ResourceKind::Service => {
                let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
                let service = services.get(name).await.map_err(lookup)?;
                let labels = service.spec.as_ref().and_then(|spec| spec.selector.as_ref());
                let pod = self.running_pod(namespace, resource, labels, timeout).await?;
                Ok(ResolveTarget::Service {
                    service: Box::new(service),
                    pod: Box::new(pod),
                })
            }
            ResourceKind::Deployment => {
                let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                let deployment = deployments.get(name).await.map_err(lookup)?;
                let labels = deployment
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.selector.match_labels.as_ref());
                let pod = self.running_pod(namespace, resource, labels, timeout).await?;
                Ok(ResolveTarget::Pod(Box::new(pod)))
            }
        }
    }

    async fn forward(
        &self,
        namespace: String,
        pod: String,
        targets: Vec<ForwardTarget>,
        ready: ReadySender,
        mut stop: StopSignal,
    ) -> Result<(), PortForwardError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let remote_ports: Vec<u16> = targets.iter().map(|t| t.container_port).collect();

        // Dial once so an unreachable pod fails before ready is announced.
        let mut dial = pods
            .portforward(&pod, &remote_ports)
            .await
            .map_err(|source| PortForwardError::Dial {
                pod: pod.clone(),
                source,
            })?;
        for port in &remote_ports {
            if dial.take_stream(*port).is_none() {
                return Err(PortForwardError::StreamUnavailable {
                    pod: pod.clone(),
                    port: *port,
                });
            }
        }
        dial.abort();

        let mut listeners = Vec::with_capacity(targets.len());
        let mut forwarded = Vec::with_capacity(targets.len());
        for target in &targets {
            let requested = target.local_port.unwrap_or(0);
            let bind_error = |source| PortForwardError::Bind {
                port: requested,
                source,
            };
            let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, requested)))
                .await
                .map_err(bind_error)?;
            let local = listener.local_addr().map_err(bind_error)?.port();
            debug!(pod = %pod, expose = %target.expose, local, "tunnel listening");
            forwarded.push(ForwardedPort {
                local,
                remote: target.container_port,
            });
            listeners.push((listener, target.container_port));
        }
        ready.send(forwarded);

        let mut acceptors = JoinSet::new();
        for (listener, remote) in listeners {
            acceptors.spawn(accept_loop(listener, pods.clone(), pod.clone(), remote));
        }

        stop.stopped().await;
        acceptors.abort_all();
        while acceptors.join_next().await.is_some() {}
        debug!(pod = %pod, "tunnel stopped");
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, pods: Api<Pod>, pod: String, remote: u16) {
    // Dropping the set on abort tears down every live connection.
    let mut connections = JoinSet::new();
    let mut backoff = AcceptBackoff::new();
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                backoff.reset();
                connections.spawn(relay(stream, pods.clone(), pod.clone(), remote));
            }
            Err(err) => {
                let delay = backoff.next_delay();
                warn!(error = %err, retry_in = ?delay, "failed to accept tunnel connection");
                tokio::time::sleep(delay).await;
            }
        }
        while connections.try_join_next().is_some() {}
    }
}

async fn relay(mut local: TcpStream, pods: Api<Pod>, pod: String, remote: u16) {
    let mut forwarder = match pods.portforward(&pod, &[remote]).await {
        Ok(forwarder) => forwarder,
        Err(err) => {
            warn!(pod = %pod, port = remote, error = %err, "failed to open tunnel stream");
            return;
        }
    };
    let Some(mut upstream) = forwarder.take_stream(remote) else {
        warn!(pod = %pod, port = remote, "tunnel stream unavailable");
        return;
    };
    if let Err(err) = tokio::io::copy_bidirectional(&mut local, &mut upstream).await {
        debug!(pod = %pod, port = remote, error = %err, "tunnel connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_kinds_and_aliases() {
        assert_eq!(parse_resource("my-pod").unwrap(), (ResourceKind::Pod, "my-pod"));
        assert_eq!(parse_resource("svc/app").unwrap(), (ResourceKind::Service, "app"));
        assert_eq!(parse_resource("service/app").unwrap(), (ResourceKind::Service, "app"));
        assert_eq!(
            parse_resource("deploy/web").unwrap(),
            (ResourceKind::Deployment, "web")
        );
    }

    #[test]
    fn unsupported_kinds_are_rejected() {
        assert!(matches!(
            parse_resource("statefulset/db"),
            Err(PortForwardError::UnsupportedResource { .. })
        ));
        assert!(matches!(
            parse_resource("pod/"),
            Err(PortForwardError::UnsupportedResource { .. })
        ));
    }

    fn pod_in_phase(phase: &str) -> Pod {
        Pod {
            metadata: kube::api::ObjectMeta {
                name: Some("web-0".to_owned()),
                ..Default::default()
            },
            status: Some(k8s_openapi::api::core::v1::PodStatus {
                phase: Some(phase.to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn pending_pod_is_polled_until_running() {
        let mut calls = 0;
        let found = poll_running_pod(Duration::from_secs(5), Duration::from_millis(1), || {
            calls += 1;
            let phase = if calls < 3 { "Pending" } else { "Running" };
            std::future::ready(Ok(vec![pod_in_phase(phase)]))
        })
        .await
        .expect("poll succeeds");

        assert!(found.as_ref().is_some_and(is_running));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn pod_that_never_runs_times_out() {
        let found = poll_running_pod(Duration::from_millis(20), Duration::from_millis(5), || {
            std::future::ready(Ok(vec![pod_in_phase("Pending")]))
        })
        .await
        .expect("poll succeeds");

        assert!(found.is_none());
    }

    #[test]
    fn accept_backoff_grows_to_a_ceiling_and_resets() {
        let mut backoff = AcceptBackoff::new();

        let first = backoff.next_delay();
        let second = backoff.next_delay();
        assert!(first > Duration::ZERO);
        assert!(second > first);

        for _ in 0..16 {
            assert!(backoff.next_delay() <= AcceptBackoff::MAX);
        }
        backoff.reset();
        assert_eq!(backoff.next_delay(), first);
    }

    #[test]
    fn selector_string_is_sorted_and_joined() {
        let labels = BTreeMap::from([
            ("tier".to_owned(), "web".to_owned()),
            ("app".to_owned(), "demo".to_owned()),
        ]);

        assert_eq!(label_selector(&labels), "app=demo,tier=web");
    }
}

use std::time::Duration;

/// Run timeout used when the configuration omits one or sets it to <= 0.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Fixed backoff between external TCP dial attempts.
pub const DEFAULT_DIAL_BACKOFF: Duration = Duration::from_secs(2);

/// Interval at which a running exec session is polled for completion.
pub const DEFAULT_EXEC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Interval between lookups of a forwardable pod.
pub const DEFAULT_POD_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Namespace used when a wait or exposure omits one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Host value published for port-forwarded resources.
pub const FORWARD_HOST: &str = "localhost";

/// Environment variable holding the generated kubeconfig path.
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

/// When set, teardown leaves the environment running for inspection.
pub const PRESERVE_ENV: &str = "INFRA_E2E_PRESERVE";

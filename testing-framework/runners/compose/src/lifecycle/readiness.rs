//! Dual-path readiness probing for one published port.
//!
//! The external gate dials the published port from this process; the
//! internal gate runs a shell check inside the container to confirm the
//! service itself listens. Both must pass, external first.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use infra_e2e_core::constants::DEFAULT_DIAL_BACKOFF;
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};
use tracing::{debug, info};

use crate::docker::{ContainerRuntime, RuntimeError};

/// Exit code a shell reports when the command can not be executed.
pub const SHELL_NOT_EXECUTABLE: i64 = 126;

/// Result of one internal probe attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthCheckOutcome {
    Ready,
    Retry,
    Fatal,
}

impl HealthCheckOutcome {
    #[must_use]
    pub const fn from_exit_code(code: i64) -> Self {
        match code {
            0 => Self::Ready,
            SHELL_NOT_EXECUTABLE => Self::Fatal,
            _ => Self::Retry,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("/bin/sh command not executable in container {container}")]
    ShellNotExecutable { container: String },
    #[error("host port waiting failed in container {container}: {source}")]
    Exec {
        container: String,
        #[source]
        source: RuntimeError,
    },
    #[error("{address} did not become ready within {timeout:?}")]
    Timeout { address: String, timeout: Duration },
}

/// Timing of a probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeSettings {
    /// Pause between failed external dials.
    pub dial_backoff: Duration,
    /// Bound on both gates together.
    pub deadline: Duration,
}

impl ProbeSettings {
    #[must_use]
    pub const fn with_deadline(deadline: Duration) -> Self {
        Self {
            dial_backoff: DEFAULT_DIAL_BACKOFF,
            deadline,
        }
    }
}

/// Opens a TCP connection to decide whether an address is reachable.
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> std::io::Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TcpReachability;

#[async_trait]
impl Reachability for TcpReachability {
    async fn dial(&self, host: &str, port: u16) -> std::io::Result<()> {
        TcpStream::connect((host, port)).await.map(drop)
    }
}

/// Runs a command inside one container.
#[async_trait]
pub trait ContainerExec: Send + Sync {
    fn target(&self) -> &str;

    async fn exec(&self, command: Vec<String>) -> Result<i64, RuntimeError>;
}

/// [`ContainerExec`] for a container of the runtime.
#[derive(Clone)]
pub struct ContainerShell {
    runtime: Arc<dyn ContainerRuntime>,
    container_id: String,
}

impl ContainerShell {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, container_id: impl Into<String>) -> Self {
        Self {
            runtime,
            container_id: container_id.into(),
        }
    }
}

#[async_trait]
impl ContainerExec for ContainerShell {
    fn target(&self) -> &str {
        &self.container_id
    }

    async fn exec(&self, command: Vec<String>) -> Result<i64, RuntimeError> {
        self.runtime.exec(&self.container_id, command).await
    }
}

/// Shell snippet succeeding when something listens on `port` inside the
/// container. Any of the three checks is enough.
#[must_use]
pub fn internal_check_command(port: u16) -> String {
    format!(
        "true && (\n cat /proc/net/tcp* | awk '{{print $2}}' | grep -i :{port:04x} ||\n nc -vz -w 1 localhost {port} ||\n /bin/sh -c '</dev/tcp/localhost/{port}'\n)"
    )
}

#[derive(Clone)]
pub struct HealthProbe {
    reachability: Arc<dyn Reachability>,
    settings: ProbeSettings,
}

impl HealthProbe {
    pub fn new(reachability: Arc<dyn Reachability>, settings: ProbeSettings) -> Self {
        Self {
            reachability,
            settings,
        }
    }

    /// Wait until `host:published_port` accepts connections and the
    /// container reports `container_port` listening.
    pub async fn probe(
        &self,
        host: &str,
        published_port: u16,
        container_port: u16,
        exec: &dyn ContainerExec,
    ) -> Result<(), ProbeError> {
        let address = display_address(host, published_port);
        let gates = async {
            self.external_gate(host, published_port).await;
            self.internal_gate(container_port, exec).await
        };

        timeout(self.settings.deadline, gates)
            .await
            .map_err(|_| ProbeError::Timeout {
                address,
                timeout: self.settings.deadline,
            })?
    }

    async fn external_gate(&self, host: &str, port: u16) {
        loop {
            debug!(host, port, "trying to connect");
            match self.reachability.dial(host, port).await {
                Ok(()) => {
                    info!(host, port, "external port reachable");
                    return;
                }
                Err(err) => {
                    debug!(host, port, error = %err, "connect failed; retrying");
                    sleep(self.settings.dial_backoff).await;
                }
            }
        }
    }

    async fn internal_gate(
        &self,
        container_port: u16,
        exec: &dyn ContainerExec,
    ) -> Result<(), ProbeError> {
        let command = vec![
            "/bin/sh".to_owned(),
            "-c".to_owned(),
            internal_check_command(container_port),
        ];

        loop {
            let code = exec
                .exec(command.clone())
                .await
                .map_err(|source| ProbeError::Exec {
                    container: exec.target().to_owned(),
                    source,
                })?;

            match HealthCheckOutcome::from_exit_code(code) {
                HealthCheckOutcome::Ready => {
                    info!(container = exec.target(), container_port, "internal port listening");
                    return Ok(());
                }
                HealthCheckOutcome::Fatal => {
                    return Err(ProbeError::ShellNotExecutable {
                        container: exec.target().to_owned(),
                    });
                }
                HealthCheckOutcome::Retry => {
                    debug!(container = exec.target(), container_port, code, "internal check not ready");
                    tokio::task::yield_now().await;
                }
            }
        }
    }
}

/// `host:port`, with IPv6 hosts bracketed.
fn display_address(host: &str, port: u16) -> String {
    host.parse::<IpAddr>().map_or_else(
        |_| format!("{host}:{port}"),
        |ip| SocketAddr::new(ip, port).to_string(),
    )
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        io,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use super::*;

    struct FlakyReachability {
        failures_left: AtomicUsize,
        attempts: AtomicUsize,
    }

    impl FlakyReachability {
        fn failing(times: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(times),
                attempts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Reachability for FlakyReachability {
        async fn dial(&self, _host: &str, _port: u16) -> io::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left == 0 {
                return Ok(());
            }
            self.failures_left.store(left - 1, Ordering::SeqCst);
            Err(io::Error::from(io::ErrorKind::ConnectionRefused))
        }
    }

    struct ScriptedExec {
        codes: Mutex<VecDeque<i64>>,
        calls: AtomicUsize,
    }

    impl ScriptedExec {
        fn new(codes: &[i64]) -> Self {
            Self {
                codes: Mutex::new(codes.iter().copied().collect()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ContainerExec for ScriptedExec {
        fn target(&self) -> &str {
            "scripted"
        }

        async fn exec(&self, _command: Vec<String>) -> Result<i64, RuntimeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.codes.lock().expect("lock").pop_front().unwrap_or(0))
        }
    }

    fn probe(reachability: Arc<dyn Reachability>) -> HealthProbe {
        HealthProbe::new(
            reachability,
            ProbeSettings {
                dial_backoff: Duration::from_millis(5),
                deadline: Duration::from_secs(5),
            },
        )
    }

    #[test]
    fn exit_codes_map_to_outcomes() {
        assert_eq!(HealthCheckOutcome::from_exit_code(0), HealthCheckOutcome::Ready);
        assert_eq!(HealthCheckOutcome::from_exit_code(126), HealthCheckOutcome::Fatal);
        assert_eq!(HealthCheckOutcome::from_exit_code(1), HealthCheckOutcome::Retry);
        assert_eq!(HealthCheckOutcome::from_exit_code(127), HealthCheckOutcome::Retry);
    }

    #[test]
    fn check_command_uses_hex_port() {
        let command = internal_check_command(9200);

        assert!(command.contains("grep -i :23f0"));
        assert!(command.contains("nc -vz -w 1 localhost 9200"));
        assert!(command.contains("/dev/tcp/localhost/9200"));
    }

    #[tokio::test]
    async fn shell_not_executable_fails_on_first_attempt() {
        let exec = ScriptedExec::new(&[126, 0]);

        let err = probe(Arc::new(FlakyReachability::failing(0)))
            .probe("127.0.0.1", 32001, 9200, &exec)
            .await
            .expect_err("fatal");

        assert!(matches!(err, ProbeError::ShellNotExecutable { .. }));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_both_gates_until_ready() {
        let reachability = Arc::new(FlakyReachability::failing(2));
        let exec = ScriptedExec::new(&[1, 1, 0]);

        probe(reachability.clone())
            .probe("127.0.0.1", 32001, 9200, &exec)
            .await
            .expect("ready");

        assert_eq!(reachability.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unreachable_port_times_out() {
        let probe = HealthProbe::new(
            Arc::new(FlakyReachability::failing(usize::MAX)),
            ProbeSettings {
                dial_backoff: Duration::from_millis(5),
                deadline: Duration::from_millis(50),
            },
        );
        let exec = ScriptedExec::new(&[]);

        let err = probe
            .probe("127.0.0.1", 1, 1, &exec)
            .await
            .expect_err("times out");

        assert!(matches!(err, ProbeError::Timeout { ref address, .. } if address == "127.0.0.1:1"));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn ipv6_gateway_address_is_bracketed() {
        assert_eq!(display_address("fd00::1", 32001), "[fd00::1]:32001");
        assert_eq!(display_address("172.17.0.1", 32001), "172.17.0.1:32001");
        assert_eq!(display_address("localhost", 80), "localhost:80");
    }

    #[tokio::test]
    async fn ipv6_timeout_reports_bracketed_address() {
        let probe = HealthProbe::new(
            Arc::new(FlakyReachability::failing(usize::MAX)),
            ProbeSettings {
                dial_backoff: Duration::from_millis(5),
                deadline: Duration::from_millis(30),
            },
        );

        let err = probe
            .probe("::1", 9, 9, &ScriptedExec::new(&[]))
            .await
            .expect_err("times out");

        assert!(matches!(err, ProbeError::Timeout { ref address, .. } if address == "[::1]:9"));
    }

    #[tokio::test]
    async fn real_listener_passes_external_gate() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let exec = ScriptedExec::new(&[0]);

        probe(Arc::new(TcpReachability))
            .probe("127.0.0.1", port, 80, &exec)
            .await
            .expect("ready");
    }
}

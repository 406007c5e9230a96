use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    time::Duration,
};

use async_trait::async_trait;
use infra_e2e_core::adjust_timeout;
use tokio::{process::Command, time::timeout};
use tracing::{debug, info, warn};

const COMPOSE_UP_TIMEOUT: Duration = Duration::from_secs(120);
const COMPOSE_DOWN_TIMEOUT: Duration = Duration::from_secs(120);
const COMPOSE_LOGS_TIMEOUT: Duration = Duration::from_secs(30);

/// Trailing stderr kept in a failure report.
const STDERR_TAIL: usize = 2048;

/// Subcommands run against a compose project.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComposeAction {
    Up,
    Down,
    Logs,
}

impl ComposeAction {
    fn args(self) -> &'static [&'static str] {
        match self {
            Self::Up => &["up", "-d"],
            Self::Down => &["down", "--volumes"],
            Self::Logs => &["logs", "--no-color"],
        }
    }

    fn limit(self) -> Duration {
        let base = match self {
            Self::Up => COMPOSE_UP_TIMEOUT,
            Self::Down => COMPOSE_DOWN_TIMEOUT,
            Self::Logs => COMPOSE_LOGS_TIMEOUT,
        };
        adjust_timeout(base)
    }
}

impl std::fmt::Display for ComposeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "docker compose {}", self.args()[0])
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ComposeCommandError {
    #[error("{action} for project {project} exited with code {code:?}: {stderr}")]
    Failed {
        action: ComposeAction,
        project: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("failed to spawn {action}: {source}")]
    Spawn {
        action: ComposeAction,
        #[source]
        source: io::Error,
    },
    #[error("{action} for project {project} was killed after {timeout:?}")]
    Timeout {
        action: ComposeAction,
        project: String,
        timeout: Duration,
    },
}

/// Starts and stops a compose project.
#[async_trait]
pub trait StackLauncher: Send + Sync {
    async fn up(&self, compose_file: &Path, project: &str) -> Result<(), ComposeCommandError>;

    async fn down(&self, compose_file: &Path, project: &str) -> Result<(), ComposeCommandError>;

    /// Best effort log collection after a failed setup.
    async fn dump_logs(&self, compose_file: &Path, project: &str);
}

/// [`StackLauncher`] shelling out to `docker compose`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DockerComposeCli;

#[async_trait]
impl StackLauncher for DockerComposeCli {
    async fn up(&self, compose_file: &Path, project: &str) -> Result<(), ComposeCommandError> {
        info!(project, file = %compose_file.display(), "starting compose stack");
        ComposeInvocation::new(compose_file, project, ComposeAction::Up)
            .run()
            .await
            .map(drop)
    }

    async fn down(&self, compose_file: &Path, project: &str) -> Result<(), ComposeCommandError> {
        ComposeInvocation::new(compose_file, project, ComposeAction::Down)
            .run()
            .await
            .map(drop)
    }

    async fn dump_logs(&self, compose_file: &Path, project: &str) {
        match ComposeInvocation::new(compose_file, project, ComposeAction::Logs)
            .run()
            .await
        {
            Ok(output) => {
                if !output.stdout.is_empty() {
                    warn!(project, "docker compose logs:\n{}", String::from_utf8_lossy(&output.stdout));
                }
            }
            Err(err) => warn!(project, error = %err, "failed to collect docker compose logs"),
        }
    }
}

/// One `docker compose` call, run from the directory holding the compose
/// file so relative build contexts and env files resolve as docker expects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComposeInvocation {
    action: ComposeAction,
    project: String,
    file_arg: OsString,
    working_dir: PathBuf,
}

impl ComposeInvocation {
    #[must_use]
    pub fn new(compose_file: &Path, project: &str, action: ComposeAction) -> Self {
        let (working_dir, file_arg) = split_compose_path(compose_file);
        Self {
            action,
            project: project.to_owned(),
            file_arg,
            working_dir,
        }
    }

    #[must_use]
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "compose".into(),
            "-f".into(),
            self.file_arg.clone(),
            "-p".into(),
            self.project.clone().into(),
        ];
        args.extend(self.action.args().iter().map(OsString::from));
        args
    }

    #[must_use]
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("docker");
        cmd.args(self.args())
            .current_dir(&self.working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self) -> Result<Output, ComposeCommandError> {
        self.run_command(self.command(), self.action.limit()).await
    }

    async fn run_command(
        &self,
        mut command: Command,
        limit: Duration,
    ) -> Result<Output, ComposeCommandError> {
        debug!(project = %self.project, action = %self.action, "running compose command");
        let output = timeout(limit, command.output())
            .await
            .map_err(|_| ComposeCommandError::Timeout {
                action: self.action,
                project: self.project.clone(),
                timeout: limit,
            })?
            .map_err(|source| ComposeCommandError::Spawn {
                action: self.action,
                source,
            })?;

        if output.status.success() {
            Ok(output)
        } else {
            Err(ComposeCommandError::Failed {
                action: self.action,
                project: self.project.clone(),
                code: output.status.code(),
                stderr: stderr_tail(&output.stderr),
            })
        }
    }
}

/// Working directory and the `-f` argument relative to it.
fn split_compose_path(compose_file: &Path) -> (PathBuf, OsString) {
    match (compose_file.parent(), compose_file.file_name()) {
        (Some(dir), Some(name)) if !dir.as_os_str().is_empty() => {
            (dir.to_path_buf(), name.to_os_string())
        }
        _ => (PathBuf::from("."), compose_file.as_os_str().to_os_string()),
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let start = text
        .char_indices()
        .map(|(index, _)| index)
        .find(|index| text.len() - index <= STDERR_TAIL)
        .unwrap_or(text.len());
    text[start..].to_owned()
}

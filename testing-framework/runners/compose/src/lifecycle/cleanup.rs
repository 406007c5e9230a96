use std::{
    env,
    path::{Path, PathBuf},
    sync::Arc,
};

use infra_e2e_core::constants::PRESERVE_ENV;
use tracing::{info, warn};

use crate::docker::commands::{ComposeCommandError, StackLauncher};

/// Removes the compose project a deploy started.
#[derive(Clone)]
pub struct StackCleanup {
    project: String,
    compose_file: PathBuf,
    launcher: Arc<dyn StackLauncher>,
}

impl StackCleanup {
    pub fn new(launcher: Arc<dyn StackLauncher>, compose_file: &Path, project: &str) -> Self {
        Self {
            project: project.to_owned(),
            compose_file: compose_file.to_path_buf(),
            launcher,
        }
    }

    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    /// `docker compose down --volumes`, skipped when `INFRA_E2E_PRESERVE`
    /// is set.
    pub async fn teardown(&self) -> Result<(), ComposeCommandError> {
        if env::var_os(PRESERVE_ENV).is_some() {
            info!(project = %self.project, "{PRESERVE_ENV} set; leaving compose stack running");
            return Ok(());
        }

        let result = self.launcher.down(&self.compose_file, &self.project).await;
        if let Err(err) = &result {
            warn!(project = %self.project, error = %err, "compose teardown failed");
        }
        result
    }

    /// Collect the stack's logs before tearing it down. The setup error the
    /// caller holds wins over a teardown error.
    pub async fn after_failure(&self) {
        self.launcher
            .dump_logs(&self.compose_file, &self.project)
            .await;
        let _ = self.teardown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serial_test::serial;

    use super::*;

    #[derive(Default)]
    struct Journal(Mutex<Vec<String>>);

    impl Journal {
        fn entries(&self) -> Vec<String> {
            self.0.lock().expect("journal lock").clone()
        }
    }

    #[async_trait]
    impl StackLauncher for Journal {
        async fn up(&self, _file: &Path, project: &str) -> Result<(), ComposeCommandError> {
            self.0.lock().expect("journal lock").push(format!("up {project}"));
            Ok(())
        }

        async fn down(&self, file: &Path, project: &str) -> Result<(), ComposeCommandError> {
            self.0
                .lock()
                .expect("journal lock")
                .push(format!("down {project} {}", file.display()));
            Ok(())
        }

        async fn dump_logs(&self, _file: &Path, project: &str) {
            self.0.lock().expect("journal lock").push(format!("logs {project}"));
        }
    }

    fn cleanup(journal: &Arc<Journal>) -> StackCleanup {
        let launcher: Arc<dyn StackLauncher> = journal.clone();
        StackCleanup::new(launcher, Path::new("/stacks/web/compose.yml"), "e2e-abc")
    }

    #[tokio::test]
    #[serial]
    async fn failure_collects_logs_before_teardown() {
        let journal = Arc::new(Journal::default());

        cleanup(&journal).after_failure().await;

        assert_eq!(
            journal.entries(),
            vec!["logs e2e-abc", "down e2e-abc /stacks/web/compose.yml"]
        );
    }

    #[tokio::test]
    #[serial]
    async fn preserve_flag_keeps_the_stack() {
        let journal = Arc::new(Journal::default());
        // SAFETY: serialised with every other test that touches the environment.
        unsafe { env::set_var(PRESERVE_ENV, "1") };

        let outcome = cleanup(&journal).teardown().await;
        unsafe { env::remove_var(PRESERVE_ENV) };

        assert!(outcome.is_ok());
        assert!(journal.entries().is_empty());
    }
}

//! Raw manifest operations through `kubectl`.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use infra_e2e_core::{ClusterHandle, adjust_timeout};
use tokio::{process::Command, time::timeout};
use tracing::info;

const KUBECTL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManifestVerb {
    Create,
    Apply,
    Delete,
}

impl ManifestVerb {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Apply => "apply",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ManifestVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read manifest location {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("manifest location {path} contains no yaml files")]
    Empty { path: String },
    #[error("failed to spawn kubectl {verb}: {source}")]
    Spawn {
        verb: ManifestVerb,
        #[source]
        source: io::Error,
    },
    #[error("kubectl {verb} -f {path} failed: {stderr}")]
    Failed {
        verb: ManifestVerb,
        path: PathBuf,
        stderr: String,
    },
    #[error("kubectl {verb} -f {path} timed out after {timeout:?}")]
    Timeout {
        verb: ManifestVerb,
        path: PathBuf,
        timeout: Duration,
    },
}

/// Run `kubectl <verb> -f <file>` against the cluster.
pub async fn operate_manifest(
    handle: &ClusterHandle,
    file: &Path,
    verb: ManifestVerb,
) -> Result<(), ManifestError> {
    let mut cmd = Command::new("kubectl");
    cmd.arg("--kubeconfig")
        .arg(&handle.kubeconfig)
        .arg(verb.as_str())
        .arg("-f")
        .arg(file)
        .kill_on_drop(true);

    let limit = adjust_timeout(KUBECTL_TIMEOUT);
    let output = timeout(limit, cmd.output())
        .await
        .map_err(|_| ManifestError::Timeout {
            verb,
            path: file.to_path_buf(),
            timeout: limit,
        })?
        .map_err(|source| ManifestError::Spawn { verb, source })?;

    if !output.status.success() {
        return Err(ManifestError::Failed {
            verb,
            path: file.to_path_buf(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    info!(%verb, file = %file.display(), "manifest operation applied");
    Ok(())
}

/// Create every manifest named by `location`: a file, a directory of yaml
/// files, or a comma-separated list of either.
pub async fn create_by_manifest(
    handle: &ClusterHandle,
    location: &str,
) -> Result<(), ManifestError> {
    for file in manifest_files(location)? {
        operate_manifest(handle, &file, ManifestVerb::Create).await?;
    }
    Ok(())
}

/// Creates the manifests a step points at.
#[async_trait]
pub trait ManifestOperator: Send + Sync {
    async fn create(&self, handle: &ClusterHandle, location: &str) -> Result<(), ManifestError>;
}

/// [`ManifestOperator`] shelling out to `kubectl`.
#[derive(Clone, Copy, Debug, Default)]
pub struct KubectlManifests;

#[async_trait]
impl ManifestOperator for KubectlManifests {
    async fn create(&self, handle: &ClusterHandle, location: &str) -> Result<(), ManifestError> {
        create_by_manifest(handle, location).await
    }
}

/// Expand a manifest location into the files it names, in order.
pub fn manifest_files(location: &str) -> Result<Vec<PathBuf>, ManifestError> {
    let mut files = Vec::new();

    for entry in location.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let path = PathBuf::from(entry);
        let metadata = fs::metadata(&path).map_err(|source| ManifestError::Read {
            path: path.clone(),
            source,
        })?;

        if !metadata.is_dir() {
            files.push(path);
            continue;
        }

        let mut found = fs::read_dir(&path)
            .map_err(|source| ManifestError::Read {
                path: path.clone(),
                source,
            })?
            .filter_map(Result::ok)
            .map(|dir_entry| dir_entry.path())
            .filter(|candidate| {
                candidate
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext == "yaml" || ext == "yml")
            })
            .collect::<Vec<_>>();
        found.sort();
        files.extend(found);
    }

    if files.is_empty() {
        return Err(ManifestError::Empty {
            path: location.to_owned(),
        });
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_directories_and_lists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manifests = dir.path().join("manifests");
        fs::create_dir(&manifests).expect("mkdir");
        fs::write(manifests.join("b.yaml"), "kind: B").expect("write");
        fs::write(manifests.join("a.yml"), "kind: A").expect("write");
        fs::write(manifests.join("notes.txt"), "ignored").expect("write");
        let single = dir.path().join("single.yaml");
        fs::write(&single, "kind: S").expect("write");

        let location = format!("{}, {}", manifests.display(), single.display());
        let files = manifest_files(&location).expect("expands");

        assert_eq!(
            files,
            vec![manifests.join("a.yml"), manifests.join("b.yaml"), single]
        );
    }

    #[test]
    fn missing_location_is_a_read_error() {
        assert!(matches!(
            manifest_files("/nonexistent/manifest.yaml"),
            Err(ManifestError::Read { .. })
        ));
    }

    #[test]
    fn empty_directory_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let location = dir.path().display().to_string();

        assert!(matches!(
            manifest_files(&location),
            Err(ManifestError::Empty { .. })
        ));
    }
}

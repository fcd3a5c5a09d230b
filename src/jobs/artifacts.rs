//! Artifact persistence.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::jobs::types::{JobKind, RunId};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("invalid artifact name: {0:?}")]
    InvalidName(String),

    #[error("failed to write artifact {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Relative location of an artifact: `<kind>/<runId>/<name>`.
pub fn artifact_path(kind: JobKind, run_id: RunId, name: &str) -> Result<String, ArtifactError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.contains('\0');
    if invalid {
        return Err(ArtifactError::InvalidName(name.to_string()));
    }
    Ok(format!("{}/{}/{}", kind.as_str(), run_id, name))
}

/// Where job artifacts are written. Returns the stored location.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn write(&self, kind: JobKind, run_id: RunId, name: &str, content: &[u8]) -> Result<String, ArtifactError>;
}

/// Writes artifacts below a root directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn write(&self, kind: JobKind, run_id: RunId, name: &str, content: &[u8]) -> Result<String, ArtifactError> {
        let relative = artifact_path(kind, run_id, name)?;
        let path = self.root.join(&relative);
        let io = |source| ArtifactError::Io {
            path: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }
        tokio::fs::write(&path, content).await.map_err(io)?;
        tracing::debug!(path = %path.display(), bytes = content.len(), "Artifact written");
        Ok(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_under_kind_and_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let run = RunId::new();

        let location = store.write(JobKind::Audit, run, "report.json", b"{}").await.unwrap();
        assert_eq!(location, format!("audit/{run}/report.json"));

        let written = std::fs::read(dir.path().join(&location)).unwrap();
        assert_eq!(written, b"{}");
    }

    #[tokio::test]
    async fn rejects_escaping_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        for name in ["../x", "a/b", "..", ""] {
            assert!(matches!(
                store.write(JobKind::Release, RunId::new(), name, b"").await,
                Err(ArtifactError::InvalidName(_))
            ));
        }
    }
}

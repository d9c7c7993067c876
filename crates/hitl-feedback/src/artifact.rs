//! Artifact store: opaque files attached to trials.
//!
//! Bytes live in an [`ArtifactBackend`]; the trial only records metadata
//! under an `artifacts:<id>` system attribute.

use chrono::{DateTime, Utc};
use hitl_optimizer::{Study, Trial};
use hitl_types::{ArtifactError, HitlResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

pub const ARTIFACT_ATTR_PREFIX: &str = "artifacts:";

/// Metadata recorded on the owning trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub artifact_id: String,
    pub filename: String,
    pub mimetype: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

/// Byte storage keyed by artifact id.
pub trait ArtifactBackend: Send + Sync {
    fn write(&self, artifact_id: &str, content: &[u8]) -> HitlResult<()>;

    fn read(&self, artifact_id: &str) -> HitlResult<Vec<u8>>;

    fn remove(&self, artifact_id: &str) -> HitlResult<()>;
}

/// One file per artifact inside a base directory.
#[derive(Debug, Clone)]
pub struct FileSystemBackend {
    base_path: PathBuf,
}

impl FileSystemBackend {
    /// Creates `base_path` if it does not exist.
    pub fn new<P: AsRef<Path>>(base_path: P) -> HitlResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn path_for(&self, artifact_id: &str) -> HitlResult<PathBuf> {
        let valid = !artifact_id.is_empty()
            && artifact_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ArtifactError::InvalidId {
                artifact_id: artifact_id.to_string(),
            }
            .into());
        }
        Ok(self.base_path.join(artifact_id))
    }
}

fn not_found(artifact_id: &str) -> ArtifactError {
    ArtifactError::NotFound {
        artifact_id: artifact_id.to_string(),
    }
}

impl ArtifactBackend for FileSystemBackend {
    fn write(&self, artifact_id: &str, content: &[u8]) -> HitlResult<()> {
        let path = self.path_for(artifact_id)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn read(&self, artifact_id: &str) -> HitlResult<Vec<u8>> {
        let path = self.path_for(artifact_id)?;
        match std::fs::read(path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found(artifact_id).into()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, artifact_id: &str) -> HitlResult<()> {
        let path = self.path_for(artifact_id)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found(artifact_id).into()),
            Err(e) => Err(e.into()),
        }
    }
}

fn guess_mimetype(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

/// Copy the local file at `file_path` into the store and attach it to trial
/// `trial_number`. Returns the new artifact id.
pub fn upload_artifact(
    backend: &dyn ArtifactBackend,
    study: &Study,
    trial_number: usize,
    file_path: &Path,
) -> HitlResult<String> {
    let content = std::fs::read(file_path).map_err(|e| ArtifactError::Unreadable {
        path: file_path.display().to_string(),
        message: e.to_string(),
    })?;
    // Fail before writing bytes when the trial is unknown.
    study.get_trial(trial_number)?;

    let artifact_id = Uuid::new_v4().to_string();
    backend.write(&artifact_id, &content)?;

    let meta = ArtifactMeta {
        artifact_id: artifact_id.clone(),
        filename: file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| artifact_id.clone()),
        mimetype: guess_mimetype(file_path).to_string(),
        size: content.len() as u64,
        uploaded_at: Utc::now(),
    };
    study.set_trial_attr(
        trial_number,
        &format!("{ARTIFACT_ATTR_PREFIX}{artifact_id}"),
        serde_json::to_value(&meta)?,
    )?;

    info!(
        trial = trial_number,
        artifact_id = %artifact_id,
        size = meta.size,
        "artifact uploaded"
    );
    Ok(artifact_id)
}

/// URL path at which the feedback service serves an artifact. Stable for the
/// lifetime of the artifact.
pub fn get_artifact_path(trial: &Trial, artifact_id: &str) -> String {
    format!("/artifacts/{}/{}/{}", trial.study_id, trial.id, artifact_id)
}

/// Artifacts attached to `trial`, oldest first.
pub fn list_artifacts(trial: &Trial) -> Vec<ArtifactMeta> {
    let mut artifacts: Vec<ArtifactMeta> = trial
        .attrs
        .iter()
        .filter(|(key, _)| key.starts_with(ARTIFACT_ATTR_PREFIX))
        .filter_map(|(key, value)| match serde_json::from_value(value.clone()) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(trial = trial.number, key = %key, error = %e, "skipping malformed artifact metadata");
                None
            }
        })
        .collect();
    artifacts.sort_by(|a, b| {
        a.uploaded_at
            .cmp(&b.uploaded_at)
            .then_with(|| a.artifact_id.cmp(&b.artifact_id))
    });
    artifacts
}

pub fn find_artifact(trial: &Trial, artifact_id: &str) -> Option<ArtifactMeta> {
    trial
        .attr(&format!("{ARTIFACT_ATTR_PREFIX}{artifact_id}"))
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hitl_optimizer::{InMemoryStorage, SearchSpace, StudyConfig, StudyStorage};
    use hitl_types::HitlError;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn study_with_trial() -> Study {
        let storage: Arc<dyn StudyStorage> = Arc::new(InMemoryStorage::new());
        let mut study = Study::create(&StudyConfig::default(), storage).unwrap();
        study.ask(&SearchSpace::rgb()).unwrap();
        study
    }

    #[test]
    fn upload_records_metadata_and_bytes() {
        let dir = TempDir::new().unwrap();
        let backend = FileSystemBackend::new(dir.path().join("artifact")).unwrap();
        let study = study_with_trial();

        let local = dir.path().join("trial-0.png");
        std::fs::write(&local, b"\x89PNG fake").unwrap();

        let id = upload_artifact(&backend, &study, 0, &local).unwrap();
        assert_eq!(backend.read(&id).unwrap(), b"\x89PNG fake");

        let trial = study.get_trial(0).unwrap();
        let listed = list_artifacts(&trial);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].artifact_id, id);
        assert_eq!(listed[0].filename, "trial-0.png");
        assert_eq!(listed[0].mimetype, "image/png");
        assert_eq!(listed[0].size, 9);
        assert_eq!(find_artifact(&trial, &id), Some(listed[0].clone()));
    }

    #[test]
    fn artifact_path_is_stable() {
        let study = study_with_trial();
        let trial = study.get_trial(0).unwrap();
        let path = get_artifact_path(&trial, "abc");
        assert_eq!(path, format!("/artifacts/{}/{}/abc", study.id(), trial.id));
        assert_eq!(path, get_artifact_path(&study.get_trial(0).unwrap(), "abc"));
    }

    #[test]
    fn unreadable_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let backend = FileSystemBackend::new(dir.path()).unwrap();
        let study = study_with_trial();

        let err = upload_artifact(&backend, &study, 0, &dir.path().join("missing.png")).unwrap_err();
        assert!(matches!(err, HitlError::Artifact(ArtifactError::Unreadable { .. })));
        assert!(list_artifacts(&study.get_trial(0).unwrap()).is_empty());
    }

    #[test]
    fn backend_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let backend = FileSystemBackend::new(dir.path()).unwrap();
        for id in ["", "../db.sqlite3", "a/b"] {
            let err = backend.read(id).unwrap_err();
            assert!(matches!(err, HitlError::Artifact(ArtifactError::InvalidId { .. })));
        }
    }

    #[test]
    fn missing_artifact_is_not_found() {
        let dir = TempDir::new().unwrap();
        let backend = FileSystemBackend::new(dir.path()).unwrap();
        backend.write("x1", b"data").unwrap();
        backend.remove("x1").unwrap();
        assert!(matches!(
            backend.read("x1").unwrap_err(),
            HitlError::Artifact(ArtifactError::NotFound { .. })
        ));
        assert!(backend.remove("x1").is_err());
    }
}

//! Persistence of migration job documents.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::{JobId, MigrationJob, StateError};

/// Durable storage for job documents, one per [`JobId`].
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the job, or the never-started defaults when nothing is stored.
    async fn load(&self, id: &JobId) -> Result<MigrationJob, StateError>;

    /// Replace the stored job. Readers never observe a partial write.
    async fn save(&self, job: &MigrationJob) -> Result<(), StateError>;

    /// Delete the stored job.
    async fn clear(&self, id: &JobId) -> Result<(), StateError>;
}

/// Decode a stored document, applying defaults and clamping.
pub fn decode_job(id: &JobId, raw: &str) -> Result<MigrationJob, StateError> {
    let job: MigrationJob = serde_json::from_str(raw)?;
    Ok(job.sanitized(id))
}

/// Encode a job document for storage.
pub fn encode_job(job: &MigrationJob) -> Result<String, StateError> {
    Ok(serde_json::to_string_pretty(job)?)
}

/// Job documents held in memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    jobs: DashMap<JobId, MigrationJob>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, id: &JobId) -> Result<MigrationJob, StateError> {
        Ok(self
            .jobs
            .get(id)
            .map(|job| job.clone())
            .unwrap_or_else(|| MigrationJob::empty(id.clone())))
    }

    async fn save(&self, job: &MigrationJob) -> Result<(), StateError> {
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn clear(&self, id: &JobId) -> Result<(), StateError> {
        self.jobs.remove(id);
        Ok(())
    }
}

/// Job documents stored as `<dir>/<job id>.json`.
///
/// Writes go to a temp file in the same directory which is then renamed over
/// the target, so a crash leaves either the old or the new document.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &JobId) -> PathBuf {
        self.dir.join(format!("{}.json", id.as_str()))
    }

    fn write_atomic(&self, path: &Path, contents: &str) -> Result<(), StateError> {
        std::fs::create_dir_all(&self.dir)?;
        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)?;
        temp.write_all(contents.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| StateError::Io(e.error))?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, id: &JobId) -> Result<MigrationJob, StateError> {
        let path = self.path_for(id);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => decode_job(id, &raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MigrationJob::empty(id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, job: &MigrationJob) -> Result<(), StateError> {
        let path = self.path_for(&job.id);
        let contents = encode_job(job)?;
        let store = self.clone();
        let target = path.clone();
        tokio::task::spawn_blocking(move || store.write_atomic(&target, &contents))
            .await
            .map_err(|e| StateError::Backend(format!("write task failed: {e}")))??;
        debug!(path = %path.display(), "saved job document");
        Ok(())
    }

    async fn clear(&self, id: &JobId) -> Result<(), StateError> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

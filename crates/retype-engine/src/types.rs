//! Job and record types.

use std::fmt;
use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rules::normalize_key;

/// Version written into every persisted job document.
pub const JOB_FORMAT_VERSION: u32 = 1;

/// Smallest accepted batch size.
pub const MIN_BATCH_SIZE: usize = 10;

/// Largest accepted batch size.
pub const MAX_BATCH_SIZE: usize = 2000;

/// Batch size used when none is given.
pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Clamp a requested batch size into `[MIN_BATCH_SIZE, MAX_BATCH_SIZE]`.
pub fn clamp_batch_size(requested: i64) -> usize {
    requested.clamp(MIN_BATCH_SIZE as i64, MAX_BATCH_SIZE as i64) as usize
}

/// Identifier of a record in the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RecordId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Handle for one migration job.
///
/// Normalized with the attribute key rules so it is always safe to use as a
/// file name or table key. An empty id falls back to `default`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(raw: &str) -> Self {
        let key = normalize_key(raw);
        if key.is_empty() {
            Self::default()
        } else {
            Self(key)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// One attribute rename rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeRename {
    pub from: String,
    pub to: String,
}

impl AttributeRename {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl fmt::Display for AttributeRename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}", self.from, self.to)
    }
}

/// How the next batch of identifiers is located.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorStrategy {
    /// Resume strictly after the last identifier seen.
    #[default]
    Keyset,
    /// Skip `processed_count` matching records. Records that leave the
    /// source type shift the window and get skipped, so this is only sound
    /// when nothing is reclassified.
    Offset,
}

/// When the source key is removed after a rename.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceDeletePolicy {
    /// Delete every value under the source key once its values were visited,
    /// even if some copies failed.
    #[default]
    Always,
    /// Keep the source key if any copy for it failed.
    OnFullCopy,
}

/// Lifecycle phase derived from a job document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    /// Nothing persisted under this id.
    NoJob,
    /// Started, no step has run yet.
    Configured,
    /// At least one step ran and the cursor is not exhausted.
    Running,
    /// A step found nothing left to process.
    Completed,
}

impl JobPhase {
    /// Whether `step` does any work in this phase.
    pub fn accepts_step(self) -> bool {
        matches!(self, JobPhase::Configured | JobPhase::Running)
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobPhase::NoJob => "no job",
            JobPhase::Configured => "configured",
            JobPhase::Running => "running",
            JobPhase::Completed => "completed",
        };
        f.write_str(label)
    }
}

/// Running totals across all steps of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobCounters {
    pub reclassified: u64,
    pub reclassify_failures: u64,
    pub values_copied: u64,
    pub values_skipped: u64,
    pub source_keys_deleted: u64,
    pub rename_failures: u64,
}

impl AddAssign for JobCounters {
    fn add_assign(&mut self, other: Self) {
        self.reclassified += other.reclassified;
        self.reclassify_failures += other.reclassify_failures;
        self.values_copied += other.values_copied;
        self.values_skipped += other.values_skipped;
        self.source_keys_deleted += other.source_keys_deleted;
        self.rename_failures += other.rename_failures;
    }
}

/// Configuration and progress of one migration job.
///
/// Missing fields take their defaults on deserialization, so documents
/// written by older versions (or hand-edited ones) still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationJob {
    pub version: u32,
    pub id: JobId,
    pub source_type: String,
    pub destination_type: Option<String>,
    pub attributes_only: bool,
    pub attribute_renames: Vec<AttributeRename>,
    pub delete_source_after_copy: bool,
    pub delete_policy: SourceDeletePolicy,
    pub cursor: CursorStrategy,
    pub batch_size: usize,
    /// Matching records when the job started. Never refreshed.
    pub total_count: u64,
    pub processed_count: u64,
    /// Highest identifier handed out so far (keyset cursor position).
    pub last_seen_id: Option<RecordId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub done: bool,
    pub last_batch_ids: Vec<RecordId>,
    pub counters: JobCounters,
}

impl Default for MigrationJob {
    fn default() -> Self {
        Self {
            version: JOB_FORMAT_VERSION,
            id: JobId::default(),
            source_type: String::new(),
            destination_type: None,
            attributes_only: false,
            attribute_renames: Vec::new(),
            delete_source_after_copy: false,
            delete_policy: SourceDeletePolicy::default(),
            cursor: CursorStrategy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            total_count: 0,
            processed_count: 0,
            last_seen_id: None,
            started_at: None,
            completed_at: None,
            done: false,
            last_batch_ids: Vec::new(),
            counters: JobCounters::default(),
        }
    }
}

impl MigrationJob {
    /// The never-started job for `id`.
    pub fn empty(id: JobId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Whether a job has been started under this id.
    pub fn exists(&self) -> bool {
        !self.source_type.is_empty()
    }

    pub fn phase(&self) -> JobPhase {
        if !self.exists() {
            JobPhase::NoJob
        } else if self.done {
            JobPhase::Completed
        } else if self.processed_count == 0 && self.last_batch_ids.is_empty() {
            JobPhase::Configured
        } else {
            JobPhase::Running
        }
    }

    /// Whether the progress view should keep advancing: started, not done,
    /// and the snapshot count says there is work left.
    pub fn is_running(&self) -> bool {
        self.exists() && !self.done && self.total_count > 0 && self.processed_count < self.total_count
    }

    /// Destination type for reclassification, if this job reclassifies.
    pub fn reclassify_target(&self) -> Option<&str> {
        if self.attributes_only {
            return None;
        }
        self.destination_type
            .as_deref()
            .filter(|dest| !dest.is_empty() && *dest != self.source_type)
    }

    /// Share of the snapshot count processed so far, in percent.
    ///
    /// Can exceed 100 when records were added to the source type after start.
    pub fn percent_complete(&self) -> Option<f64> {
        if self.total_count == 0 {
            return None;
        }
        Some(self.processed_count as f64 * 100.0 / self.total_count as f64)
    }

    /// Clamp fields that a stored document could carry out of range.
    pub(crate) fn sanitized(mut self, id: &JobId) -> Self {
        self.id = id.clone();
        self.batch_size = clamp_batch_size(self.batch_size as i64);
        self
    }
}

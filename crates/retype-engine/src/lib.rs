//! Resumable batch engine for moving records between types.
//!
//! This crate provides:
//! - A permissive parser for attribute rename rules
//! - Durable job documents keyed by job id
//! - Keyset (or legacy offset) batch selection
//! - Idempotent per-record reclassification and attribute merging
//! - A job controller with a single-flight step guard

mod controller;
mod cursor;
mod error;
pub mod rules;
mod state;
mod store;
mod transform;
mod types;

pub use controller::{
    JobController, NoopReason, RunEnd, RunSummary, StartReport, StartRequest, StepOutcome, StepReport,
};
pub use cursor::BatchCursor;
pub use error::{MigrateError, StateError, StoreError, ValidationError};
pub use rules::{normalize_key, parse_rename_rules};
pub use state::{FileStateStore, MemoryStateStore, StateStore, decode_job, encode_job};
pub use store::{MemoryRecord, MemoryRecordStore, RecordStore};
pub use transform::{RecordError, RecordOutcome, RecordStage, RecordTransformer, values_equal};
pub use types::{
    AttributeRename, CursorStrategy, DEFAULT_BATCH_SIZE, JOB_FORMAT_VERSION, JobCounters, JobId, JobPhase,
    MAX_BATCH_SIZE, MIN_BATCH_SIZE, MigrationJob, RecordId, SourceDeletePolicy, clamp_batch_size,
};

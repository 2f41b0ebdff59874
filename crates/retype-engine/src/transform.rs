//! Per-record transformation.

use std::fmt;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    AttributeRename, JobCounters, MigrationJob, RecordId, RecordStore, SourceDeletePolicy, StoreError,
};

/// Which part of a record transformation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordStage {
    Reclassify { to: String },
    ReadAttribute { key: String },
    CopyValue { from: String, to: String },
    DeleteSource { key: String },
}

impl fmt::Display for RecordStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordStage::Reclassify { to } => write!(f, "reclassify to {to}"),
            RecordStage::ReadAttribute { key } => write!(f, "read {key}"),
            RecordStage::CopyValue { from, to } => write!(f, "copy {from} to {to}"),
            RecordStage::DeleteSource { key } => write!(f, "delete {key}"),
        }
    }
}

/// A failure confined to one record. Absorbed into the step report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("record {record}: {stage} failed: {source}")]
pub struct RecordError {
    pub record: RecordId,
    pub stage: RecordStage,
    #[source]
    pub source: StoreError,
}

/// Result of transforming one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordOutcome {
    pub counters: JobCounters,
    pub errors: Vec<RecordError>,
}

/// Whether two stored values mean the same thing.
///
/// Byte-equal values match; otherwise both must parse as JSON to the same
/// value, so `{"a":1,"b":2}` matches `{ "b": 2, "a": 1 }`.
pub fn values_equal(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (serde_json::from_str::<Value>(a), serde_json::from_str::<Value>(b)) {
        (Ok(left), Ok(right)) => left == right,
        _ => false,
    }
}

/// Applies a job's reclassification and renames to single records.
pub struct RecordTransformer<'a> {
    store: &'a dyn RecordStore,
    job: &'a MigrationJob,
}

impl<'a> RecordTransformer<'a> {
    pub fn new(store: &'a dyn RecordStore, job: &'a MigrationJob) -> Self {
        Self { store, job }
    }

    /// Transform one record. Never fails; problems land in the outcome.
    pub async fn transform(&self, id: RecordId) -> RecordOutcome {
        let mut outcome = RecordOutcome::default();

        if let Some(target) = self.job.reclassify_target() {
            match self.store.reclassify(id, target).await {
                Ok(()) => outcome.counters.reclassified += 1,
                Err(source) => {
                    warn!(record = %id, to = target, error = %source, "reclassify failed");
                    outcome.counters.reclassify_failures += 1;
                    outcome.errors.push(RecordError {
                        record: id,
                        stage: RecordStage::Reclassify {
                            to: target.to_string(),
                        },
                        source,
                    });
                }
            }
        }

        for rule in &self.job.attribute_renames {
            self.rename(id, rule, &mut outcome).await;
        }

        outcome
    }

    async fn rename(&self, id: RecordId, rule: &AttributeRename, outcome: &mut RecordOutcome) {
        let values = match self.store.get_attribute_values(id, &rule.from).await {
            Ok(values) => values,
            Err(source) => {
                record_failure(outcome, id, RecordStage::ReadAttribute { key: rule.from.clone() }, source);
                return;
            }
        };
        if values.is_empty() {
            return;
        }

        // Unreadable destination: nothing is copied and the source stays.
        let mut existing = match self.destination_values(id, &rule.to).await {
            Ok(existing) => existing,
            Err(source) => {
                record_failure(outcome, id, RecordStage::ReadAttribute { key: rule.to.clone() }, source);
                return;
            }
        };

        let mut copy_failed = false;
        for value in values {
            if existing.iter().any(|current| values_equal(current, &value)) {
                outcome.counters.values_skipped += 1;
                continue;
            }
            match self.store.add_attribute_value(id, &rule.to, &value).await {
                Ok(()) => {
                    outcome.counters.values_copied += 1;
                    existing.push(value);
                }
                Err(source) => {
                    copy_failed = true;
                    record_failure(
                        outcome,
                        id,
                        RecordStage::CopyValue {
                            from: rule.from.clone(),
                            to: rule.to.clone(),
                        },
                        source,
                    );
                }
            }
        }

        if !self.job.delete_source_after_copy {
            return;
        }
        if copy_failed && self.job.delete_policy == SourceDeletePolicy::OnFullCopy {
            debug!(record = %id, key = %rule.from, "keeping source key after failed copy");
            return;
        }
        match self.store.delete_attribute_values(id, &rule.from).await {
            Ok(()) => outcome.counters.source_keys_deleted += 1,
            Err(source) => {
                record_failure(outcome, id, RecordStage::DeleteSource { key: rule.from.clone() }, source)
            }
        }
    }

    async fn destination_values(&self, id: RecordId, key: &str) -> Result<Vec<String>, StoreError> {
        if self.store.attribute_exists(id, key).await? {
            self.store.get_attribute_values(id, key).await
        } else {
            Ok(Vec::new())
        }
    }
}

fn record_failure(outcome: &mut RecordOutcome, record: RecordId, stage: RecordStage, source: StoreError) {
    warn!(record = %record, %stage, error = %source, "attribute rename step failed");
    outcome.counters.rename_failures += 1;
    outcome.errors.push(RecordError {
        record,
        stage,
        source,
    });
}

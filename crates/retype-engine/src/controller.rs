//! Job lifecycle: start, step, reset.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::rules::{normalize_key, parse_rename_rules};
use crate::{
    BatchCursor, CursorStrategy, DEFAULT_BATCH_SIZE, JobCounters, JobId, JobPhase, MigrateError, MigrationJob,
    RecordError, RecordId, RecordStore, RecordTransformer, SourceDeletePolicy, StateStore,
    ValidationError, clamp_batch_size,
};

/// Parameters for starting a job, as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub source_type: String,
    /// Empty when only renaming attributes.
    pub destination_type: String,
    /// Clamped into the accepted range, never rejected.
    pub batch_size: i64,
    /// Free-text rename rules, one per line.
    pub rename_rules: String,
    pub delete_old: bool,
    pub meta_only: bool,
    pub delete_policy: SourceDeletePolicy,
    pub cursor: CursorStrategy,
}

impl Default for StartRequest {
    fn default() -> Self {
        Self {
            source_type: String::new(),
            destination_type: String::new(),
            batch_size: DEFAULT_BATCH_SIZE as i64,
            rename_rules: String::new(),
            delete_old: false,
            meta_only: false,
            delete_policy: SourceDeletePolicy::default(),
            cursor: CursorStrategy::default(),
        }
    }
}

/// A freshly started job.
#[derive(Debug, Clone, PartialEq)]
pub struct StartReport {
    pub job: MigrationJob,
    /// Informational message for the caller, e.g. nothing to migrate.
    pub notice: Option<String>,
}

/// What one step did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    pub processed: u64,
    pub total: u64,
    pub done: bool,
    pub last_batch_ids: Vec<RecordId>,
    /// Identifiers fetched by this step.
    pub fetched: usize,
    /// Counters for this step only.
    pub counters: JobCounters,
    pub errors: Vec<RecordError>,
    /// Set on the completing step when the serving index refresh succeeded.
    pub index_refreshed: bool,
}

impl StepReport {
    fn from_job(job: &MigrationJob) -> Self {
        Self {
            processed: job.processed_count,
            total: job.total_count,
            done: job.done,
            last_batch_ids: job.last_batch_ids.clone(),
            ..Self::default()
        }
    }
}

/// Why a step did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoopReason {
    NoActiveJob,
    AlreadyDone,
    /// Another step for the same job is running.
    InFlight,
}

/// Result of [`JobController::step_job`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// A batch was processed.
    Progress(StepReport),
    /// The cursor was exhausted and the job marked done.
    Completed(StepReport),
    Noop(NoopReason),
}

/// How [`JobController::run_until_done`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    Completed,
    AlreadyDone,
    NoActiveJob,
    Interrupted,
}

/// Summary of an auto-advancing run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub end: RunEnd,
    /// Steps that processed a batch or completed the job.
    pub steps: u64,
    pub job: MigrationJob,
}

/// Drives migration jobs against a record store, persisting progress.
pub struct JobController {
    records: Arc<dyn RecordStore>,
    state: Arc<dyn StateStore>,
    /// Single-flight guard per job.
    locks: DashMap<JobId, Arc<Mutex<()>>>,
}

impl JobController {
    pub fn new(records: Arc<dyn RecordStore>, state: Arc<dyn StateStore>) -> Self {
        Self {
            records,
            state,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, id: &JobId) -> Arc<Mutex<()>> {
        self.locks.entry(id.clone()).or_default().clone()
    }

    /// Validate a request and replace any job stored under `id`.
    ///
    /// On validation failure nothing is written.
    #[tracing::instrument(skip(self, request), fields(job = %id))]
    pub async fn start_job(&self, id: &JobId, request: StartRequest) -> Result<StartReport, MigrateError> {
        let mut job = validate(id, &request)?;

        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        job.total_count = self.records.count_by_type(&job.source_type).await?;
        job.started_at = Some(Utc::now());
        self.state.save(&job).await?;

        info!(
            from = %job.source_type,
            to = ?job.destination_type,
            total = job.total_count,
            batch_size = job.batch_size,
            renames = job.attribute_renames.len(),
            "started migration job"
        );

        let notice = (job.total_count == 0)
            .then(|| format!("no records found for source type '{}'", job.source_type));
        Ok(StartReport { job, notice })
    }

    /// Process the next batch of a job.
    ///
    /// Fails only when the batch cannot be fetched or progress cannot be
    /// saved; in both cases the cursor is unchanged and retrying is safe.
    #[tracing::instrument(skip(self), fields(job = %id))]
    pub async fn step_job(&self, id: &JobId) -> Result<StepOutcome, MigrateError> {
        let lock = self.lock_for(id);
        let Ok(_guard) = lock.try_lock() else {
            debug!("step already in flight");
            return Ok(StepOutcome::Noop(NoopReason::InFlight));
        };

        let mut job = self.state.load(id).await?;
        match job.phase() {
            JobPhase::NoJob => return Ok(StepOutcome::Noop(NoopReason::NoActiveJob)),
            phase if !phase.accepts_step() => return Ok(StepOutcome::Noop(NoopReason::AlreadyDone)),
            _ => {}
        }

        let ids = match BatchCursor::for_job(&job).next_batch(self.records.as_ref(), &job).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "failed to fetch batch");
                return Err(e.into());
            }
        };

        if ids.is_empty() {
            job.done = true;
            job.completed_at = Some(Utc::now());
            self.state.save(&job).await?;

            let index_refreshed = match self.records.refresh_serving_index().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "serving index refresh failed");
                    false
                }
            };
            info!(
                processed = job.processed_count,
                total = job.total_count,
                reclassified = job.counters.reclassified,
                failures = job.counters.reclassify_failures + job.counters.rename_failures,
                "migration job complete"
            );
            return Ok(StepOutcome::Completed(StepReport {
                index_refreshed,
                ..StepReport::from_job(&job)
            }));
        }

        let mut counters = JobCounters::default();
        let mut errors = Vec::new();
        let transformer = RecordTransformer::new(self.records.as_ref(), &job);
        for record in &ids {
            let outcome = transformer.transform(*record).await;
            counters += outcome.counters;
            errors.extend(outcome.errors);
        }

        let fetched = ids.len();
        job.processed_count += fetched as u64;
        job.last_seen_id = ids.last().copied();
        job.last_batch_ids = ids;
        job.counters += counters;
        self.state.save(&job).await?;

        debug!(
            fetched,
            processed = job.processed_count,
            total = job.total_count,
            errors = errors.len(),
            "processed batch"
        );

        Ok(StepOutcome::Progress(StepReport {
            fetched,
            counters,
            errors,
            ..StepReport::from_job(&job)
        }))
    }

    /// Delete the job stored under `id`.
    #[tracing::instrument(skip(self), fields(job = %id))]
    pub async fn reset_job(&self, id: &JobId) -> Result<(), MigrateError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.state.clear(id).await?;
        info!("reset migration job");
        Ok(())
    }

    /// Current job document, or defaults when none is stored.
    pub async fn status(&self, id: &JobId) -> Result<MigrationJob, MigrateError> {
        Ok(self.state.load(id).await?)
    }

    /// Step repeatedly, pausing `interval` between steps, until the job is
    /// done, there is no job, or `shutdown` flips to true.
    ///
    /// A step error ends the run and is returned; progress up to the failed
    /// step is already persisted.
    #[tracing::instrument(skip(self, shutdown, on_step), fields(job = %id))]
    pub async fn run_until_done<F>(
        &self,
        id: &JobId,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
        mut on_step: F,
    ) -> Result<RunSummary, MigrateError>
    where
        F: FnMut(&StepReport),
    {
        let mut steps = 0;

        let end = loop {
            if *shutdown.borrow() {
                info!("run interrupted");
                break RunEnd::Interrupted;
            }

            match self.step_job(id).await? {
                StepOutcome::Progress(report) => {
                    steps += 1;
                    on_step(&report);
                }
                StepOutcome::Completed(report) => {
                    steps += 1;
                    on_step(&report);
                    break RunEnd::Completed;
                }
                StepOutcome::Noop(NoopReason::AlreadyDone) => break RunEnd::AlreadyDone,
                StepOutcome::Noop(NoopReason::NoActiveJob) => break RunEnd::NoActiveJob,
                StepOutcome::Noop(NoopReason::InFlight) => {}
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = sleep(interval) => {}
            }
        };

        Ok(RunSummary {
            end,
            steps,
            job: self.status(id).await?,
        })
    }
}

/// Build a job from a start request, or say why it cannot run.
fn validate(id: &JobId, request: &StartRequest) -> Result<MigrationJob, ValidationError> {
    let source_type = normalize_key(&request.source_type);
    if source_type.is_empty() {
        return Err(ValidationError::EmptySourceType);
    }

    let attribute_renames = parse_rename_rules(&request.rename_rules);
    let destination_type = if request.meta_only {
        if attribute_renames.is_empty() {
            return Err(ValidationError::NoRenameRules);
        }
        None
    } else {
        let destination = normalize_key(&request.destination_type);
        if destination.is_empty() {
            return Err(ValidationError::MissingDestinationType);
        }
        if destination == source_type {
            return Err(ValidationError::SameSourceAndDestination(destination));
        }
        Some(destination)
    };

    Ok(MigrationJob {
        source_type,
        destination_type,
        attributes_only: request.meta_only,
        attribute_renames,
        delete_source_after_copy: request.delete_old,
        delete_policy: request.delete_policy,
        cursor: request.cursor,
        batch_size: clamp_batch_size(request.batch_size),
        ..MigrationJob::empty(id.clone())
    })
}

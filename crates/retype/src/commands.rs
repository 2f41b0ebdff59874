//! Subcommand handlers.

use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use retype_engine::{
    FileStateStore, JobController, JobId, JobPhase, MigrationJob, NoopReason, RunEnd, StartRequest,
    StateStore, StepOutcome, StepReport,
};
use retype_sqlite::{Database, SqliteRecordStore, SqliteStateStore};
use tokio::sync::watch;
use tracing::info;

use crate::GlobalArgs;

/// Opened stores plus the controller driving them.
pub struct App {
    records: Arc<SqliteRecordStore>,
    controller: JobController,
    job: JobId,
}

impl App {
    pub fn open(args: &GlobalArgs) -> Result<Self> {
        let db = Arc::new(
            Database::open(&args.db)
                .map_err(|e| miette::miette!("failed to open {}: {}", args.db.display(), e))?,
        );
        let records = Arc::new(
            SqliteRecordStore::new(Arc::clone(&db)).require_registered_types(args.require_registered_types),
        );

        let state: Arc<dyn StateStore> = match &args.state_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .map_err(|e| miette::miette!("failed to create {}: {}", dir.display(), e))?;
                Arc::new(FileStateStore::new(dir))
            }
            None => Arc::new(SqliteStateStore::new(db)),
        };

        Ok(Self {
            controller: JobController::new(records.clone(), state),
            records,
            job: args.job_id(),
        })
    }

    pub async fn start(&self, request: StartRequest) -> Result<()> {
        let report = self
            .controller
            .start_job(&self.job, request)
            .await
            .map_err(|e| miette::miette!("{}", e))?;

        let job = &report.job;
        println!("Started job '{}'", job.id);
        println!("  {}", describe_target(job));
        for rule in &job.attribute_renames {
            println!("  rename {}", rule);
        }
        println!(
            "  {} record(s), {} per step, {:?} cursor",
            job.total_count, job.batch_size, job.cursor
        );
        if let Some(notice) = report.notice {
            println!("Note: {}", notice);
        }
        Ok(())
    }

    pub async fn step(&self) -> Result<()> {
        let outcome = self
            .controller
            .step_job(&self.job)
            .await
            .map_err(|e| miette::miette!("{}", e))?;

        match outcome {
            StepOutcome::Progress(report) => print_step(&report),
            StepOutcome::Completed(report) => print_step(&report),
            StepOutcome::Noop(reason) => println!("{}", describe_noop(reason)),
        }
        Ok(())
    }

    pub async fn run(&self, interval_ms: u64) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received Ctrl-C, stopping after the current step");
                let _ = shutdown_tx.send(true);
            }
        });

        let summary = self
            .controller
            .run_until_done(&self.job, Duration::from_millis(interval_ms), shutdown_rx, print_step)
            .await
            .map_err(|e| miette::miette!("{}", e))?;

        match summary.end {
            RunEnd::Completed => println!("Completed after {} step(s)", summary.steps),
            RunEnd::AlreadyDone => println!("{}", describe_noop(NoopReason::AlreadyDone)),
            RunEnd::NoActiveJob => println!("{}", describe_noop(NoopReason::NoActiveJob)),
            RunEnd::Interrupted => println!(
                "Paused after {} step(s); rerun to continue from {}",
                summary.steps,
                summary.job.processed_count
            ),
        }
        Ok(())
    }

    pub async fn reset(&self) -> Result<()> {
        self.controller
            .reset_job(&self.job)
            .await
            .map_err(|e| miette::miette!("{}", e))?;
        println!("Reset job '{}'", self.job);
        Ok(())
    }

    pub async fn status(&self, json: bool) -> Result<()> {
        let job = self
            .controller
            .status(&self.job)
            .await
            .map_err(|e| miette::miette!("{}", e))?;

        if json {
            let body = serde_json::to_string_pretty(&job).map_err(|e| miette::miette!("{}", e))?;
            println!("{}", body);
            return Ok(());
        }
        print_status(&job);
        Ok(())
    }

    pub fn register_type(&self, name: &str) -> Result<()> {
        let key = retype_engine::normalize_key(name);
        if key.is_empty() {
            return Err(miette::miette!("type name '{}' is empty after normalization", name));
        }
        self.records
            .register_type(&key)
            .map_err(|e| miette::miette!("{}", e))?;
        println!("Registered type '{}'", key);
        Ok(())
    }
}

fn describe_target(job: &MigrationJob) -> String {
    match &job.destination_type {
        Some(to) if !job.attributes_only => format!("{} -> {}", job.source_type, to),
        _ => format!("{} (attributes only)", job.source_type),
    }
}

fn describe_noop(reason: NoopReason) -> &'static str {
    match reason {
        NoopReason::NoActiveJob => "No job configured; run `retype start` first",
        NoopReason::AlreadyDone => "Job already complete; reset or start a new one",
        NoopReason::InFlight => "Another step is still running",
    }
}

fn print_step(report: &StepReport) {
    if report.done {
        println!(
            "Done: {}/{} processed{}",
            report.processed,
            report.total,
            if report.index_refreshed {
                ""
            } else {
                " (serving index refresh failed)"
            }
        );
        return;
    }

    println!(
        "{}/{} processed (+{}): {} reclassified, {} copied, {} skipped, {} key(s) deleted",
        report.processed,
        report.total,
        report.fetched,
        report.counters.reclassified,
        report.counters.values_copied,
        report.counters.values_skipped,
        report.counters.source_keys_deleted,
    );
    for err in &report.errors {
        println!("  Warning: {}", err);
    }
}

/// `processed / total` plus whether the job still has work left.
fn progress_line(job: &MigrationJob) -> String {
    let counts = match job.percent_complete() {
        Some(pct) => format!("{}/{} processed ({:.1}%)", job.processed_count, job.total_count, pct),
        None => format!("{}/{} processed", job.processed_count, job.total_count),
    };
    let state = if job.is_running() {
        "running"
    } else if job.done {
        "complete"
    } else {
        "waiting for next step"
    };
    format!("{counts}, {state}")
}

fn print_status(job: &MigrationJob) {
    let phase = job.phase();
    println!("Job '{}': {}", job.id, phase);
    if phase == JobPhase::NoJob {
        return;
    }

    println!("  {}", describe_target(job));
    for rule in &job.attribute_renames {
        println!("  rename {}", rule);
    }
    println!("  {}", progress_line(job));

    let c = &job.counters;
    println!(
        "  {} reclassified ({} failed), {} copied, {} skipped, {} key(s) deleted ({} rename failure(s))",
        c.reclassified,
        c.reclassify_failures,
        c.values_copied,
        c.values_skipped,
        c.source_keys_deleted,
        c.rename_failures,
    );
    if let Some(started) = job.started_at {
        println!("  started   {}", started.to_rfc3339());
    }
    if let Some(completed) = job.completed_at {
        println!("  completed {}", completed.to_rfc3339());
    }
    if !job.last_batch_ids.is_empty() {
        let ids: Vec<String> = job.last_batch_ids.iter().map(ToString::to_string).collect();
        println!("  last batch: {}", ids.join(", "));
    }
}

//! Job documents stored in the record database.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use retype_engine::{JobId, MigrationJob, StateError, StateStore, decode_job, encode_job};
use rusqlite::params;

use crate::Database;
use crate::db::OptionalExt;

/// [`StateStore`] backed by the `migration_jobs` table.
///
/// Each save is a single-row replace, so readers see either the old or the
/// new document.
pub struct SqliteStateStore {
    db: Arc<Database>,
}

impl SqliteStateStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load(&self, id: &JobId) -> Result<MigrationJob, StateError> {
        let body = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT body FROM migration_jobs WHERE job_id = ?1",
                params![id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })?;

        match body {
            Some(raw) => decode_job(id, &raw),
            None => Ok(MigrationJob::empty(id.clone())),
        }
    }

    async fn save(&self, job: &MigrationJob) -> Result<(), StateError> {
        let body = encode_job(job)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO migration_jobs (job_id, body, updated_at) VALUES (?1, ?2, ?3)",
                params![job.id.as_str(), body, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    async fn clear(&self, id: &JobId) -> Result<(), StateError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM migration_jobs WHERE job_id = ?1", params![id.as_str()])?;
            Ok(())
        })?;
        Ok(())
    }
}

//! Batch selection.

use tracing::debug;

use crate::{CursorStrategy, MigrationJob, RecordId, RecordStore, StoreError};

/// Picks the next page of identifiers for a job.
#[derive(Debug, Clone, Copy)]
pub struct BatchCursor {
    strategy: CursorStrategy,
    batch_size: usize,
}

impl BatchCursor {
    pub fn for_job(job: &MigrationJob) -> Self {
        Self {
            strategy: job.cursor,
            batch_size: job.batch_size,
        }
    }

    /// Fetch up to `batch_size` identifiers in ascending order.
    ///
    /// An empty result means the job is complete.
    pub async fn next_batch(
        &self,
        store: &dyn RecordStore,
        job: &MigrationJob,
    ) -> Result<Vec<RecordId>, StoreError> {
        let ids = match self.strategy {
            CursorStrategy::Keyset => {
                store
                    .list_ids_after(&job.source_type, self.batch_size, job.last_seen_id)
                    .await?
            }
            CursorStrategy::Offset => {
                store
                    .list_ids_by_type(&job.source_type, self.batch_size, job.processed_count)
                    .await?
            }
        };

        debug!(
            strategy = ?self.strategy,
            after = ?job.last_seen_id,
            offset = job.processed_count,
            fetched = ids.len(),
            "fetched batch"
        );
        Ok(ids)
    }
}

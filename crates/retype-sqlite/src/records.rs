//! SQLite implementation of the record store.

use std::sync::Arc;

use async_trait::async_trait;
use retype_engine::{RecordId, RecordStore, StoreError};
use rusqlite::{Connection, params};
use tracing::{debug, info};

use crate::db::OptionalExt;
use crate::{Database, DbError};

const SERVING_GENERATION_KEY: &str = "serving_generation";

/// Records, attributes and type registry stored in SQLite.
pub struct SqliteRecordStore {
    db: Arc<Database>,
    /// Reject reclassification to types missing from `record_types`.
    require_registered_types: bool,
}

impl SqliteRecordStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            require_registered_types: false,
        }
    }

    /// Only allow reclassification to registered types.
    pub fn require_registered_types(mut self, require: bool) -> Self {
        self.require_registered_types = require;
        self
    }

    /// Add a type to the registry.
    pub fn register_type(&self, name: &str) -> Result<(), DbError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO record_types (name) VALUES (?1)",
                params![name],
            )?;
            Ok(())
        })
    }

    /// Create a record of `record_type` and return its identifier.
    pub fn insert_record(&self, record_type: &str) -> Result<RecordId, DbError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO records (record_type) VALUES (?1)",
                params![record_type],
            )?;
            Ok(RecordId(conn.last_insert_rowid() as u64))
        })
    }

    /// Type of a record, if it exists.
    pub fn record_type(&self, id: RecordId) -> Result<Option<String>, DbError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT record_type FROM records WHERE id = ?1",
                params![id.0 as i64],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Number of serving index refreshes so far.
    pub fn serving_generation(&self) -> Result<u64, DbError> {
        Ok(self
            .db
            .get_state(SERVING_GENERATION_KEY)?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0))
    }
}

fn ensure_record(conn: &Connection, id: RecordId) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT 1 FROM records WHERE id = ?1",
        params![id.0 as i64],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

fn collect_ids(
    stmt: &mut rusqlite::Statement<'_>,
    params: impl rusqlite::Params,
) -> Result<Vec<RecordId>, rusqlite::Error> {
    stmt.query_map(params, |row| row.get::<_, i64>(0))?
        .map(|id| id.map(|id| RecordId(id as u64)))
        .collect()
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn count_by_type(&self, record_type: &str) -> Result<u64, StoreError> {
        let count = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM records WHERE record_type = ?1",
                params![record_type],
                |row| row.get::<_, i64>(0),
            )
        })?;
        Ok(count as u64)
    }

    async fn list_ids_by_type(
        &self,
        record_type: &str,
        limit: usize,
        offset: u64,
    ) -> Result<Vec<RecordId>, StoreError> {
        Ok(self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM records WHERE record_type = ?1
                 ORDER BY id LIMIT ?2 OFFSET ?3",
            )?;
            collect_ids(&mut stmt, params![record_type, sql_limit(limit), offset as i64])
        })?)
    }

    async fn list_ids_after(
        &self,
        record_type: &str,
        limit: usize,
        after: Option<RecordId>,
    ) -> Result<Vec<RecordId>, StoreError> {
        let after = after.map_or(-1, |id| id.0 as i64);
        Ok(self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM records WHERE record_type = ?1 AND id > ?2
                 ORDER BY id LIMIT ?3",
            )?;
            collect_ids(&mut stmt, params![record_type, after, sql_limit(limit)])
        })?)
    }

    async fn reclassify(&self, id: RecordId, new_type: &str) -> Result<(), StoreError> {
        let require = self.require_registered_types;
        let (registered, updated) = self.db.with_conn(|conn| {
            if require {
                let known = conn
                    .query_row(
                        "SELECT 1 FROM record_types WHERE name = ?1",
                        params![new_type],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                if !known {
                    return Ok((false, 0));
                }
            }
            let updated = conn.execute(
                "UPDATE records SET record_type = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![new_type, id.0 as i64],
            )?;
            Ok((true, updated))
        })?;

        if !registered {
            return Err(StoreError::UnknownType(new_type.to_string()));
        }
        if updated == 0 {
            return Err(StoreError::RecordNotFound(id));
        }
        Ok(())
    }

    async fn get_attribute_values(&self, id: RecordId, key: &str) -> Result<Vec<String>, StoreError> {
        let values = self.db.with_conn(|conn| {
            if !ensure_record(conn, id)? {
                return Ok(None);
            }
            let mut stmt = conn.prepare(
                "SELECT meta_value FROM record_attributes
                 WHERE record_id = ?1 AND meta_key = ?2 ORDER BY meta_id",
            )?;
            let values = stmt
                .query_map(params![id.0 as i64, key], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(Some(values))
        })?;
        values.ok_or(StoreError::RecordNotFound(id))
    }

    async fn add_attribute_value(&self, id: RecordId, key: &str, value: &str) -> Result<(), StoreError> {
        let found = self.db.with_conn(|conn| {
            if !ensure_record(conn, id)? {
                return Ok(false);
            }
            conn.execute(
                "INSERT INTO record_attributes (record_id, meta_key, meta_value) VALUES (?1, ?2, ?3)",
                params![id.0 as i64, key, value],
            )?;
            Ok(true)
        })?;
        if !found {
            return Err(StoreError::RecordNotFound(id));
        }
        Ok(())
    }

    async fn delete_attribute_values(&self, id: RecordId, key: &str) -> Result<(), StoreError> {
        let found = self.db.with_conn(|conn| {
            if !ensure_record(conn, id)? {
                return Ok(false);
            }
            let removed = conn.execute(
                "DELETE FROM record_attributes WHERE record_id = ?1 AND meta_key = ?2",
                params![id.0 as i64, key],
            )?;
            debug!(record = %id, key, removed, "deleted attribute values");
            Ok(true)
        })?;
        if !found {
            return Err(StoreError::RecordNotFound(id));
        }
        Ok(())
    }

    async fn attribute_exists(&self, id: RecordId, key: &str) -> Result<bool, StoreError> {
        let exists = self.db.with_conn(|conn| {
            if !ensure_record(conn, id)? {
                return Ok(None);
            }
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM record_attributes WHERE record_id = ?1 AND meta_key = ?2)",
                params![id.0 as i64, key],
                |row| row.get::<_, bool>(0),
            )
            .map(Some)
        })?;
        exists.ok_or(StoreError::RecordNotFound(id))
    }

    async fn refresh_serving_index(&self) -> Result<(), StoreError> {
        let generation = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let current: u64 = tx
                .query_row(
                    "SELECT value FROM state WHERE key = ?1",
                    params![SERVING_GENERATION_KEY],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let next = current + 1;
            tx.execute(
                "INSERT OR REPLACE INTO state (key, value) VALUES (?1, ?2)",
                params![SERVING_GENERATION_KEY, next.to_string()],
            )?;
            tx.commit()?;
            Ok(next)
        })?;
        info!(generation, "serving index refreshed");
        Ok(())
    }
}

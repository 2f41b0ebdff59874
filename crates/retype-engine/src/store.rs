//! Record store seam and an in-memory implementation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{RecordId, StoreError};

/// The external store holding records, their type and their attributes.
///
/// Identifier lists are always in ascending identifier order.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Number of records currently of `record_type`.
    async fn count_by_type(&self, record_type: &str) -> Result<u64, StoreError>;

    /// Page of identifiers of `record_type`, skipping the first `offset`.
    async fn list_ids_by_type(
        &self,
        record_type: &str,
        limit: usize,
        offset: u64,
    ) -> Result<Vec<RecordId>, StoreError>;

    /// Page of identifiers of `record_type` strictly greater than `after`.
    async fn list_ids_after(
        &self,
        record_type: &str,
        limit: usize,
        after: Option<RecordId>,
    ) -> Result<Vec<RecordId>, StoreError>;

    /// Change the type of a record. Setting the current type is a no-op.
    async fn reclassify(&self, id: RecordId, new_type: &str) -> Result<(), StoreError>;

    /// All values stored under `key`, in insertion order.
    async fn get_attribute_values(&self, id: RecordId, key: &str) -> Result<Vec<String>, StoreError>;

    /// Append one value under `key`.
    async fn add_attribute_value(&self, id: RecordId, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove every value under `key`.
    async fn delete_attribute_values(&self, id: RecordId, key: &str) -> Result<(), StoreError>;

    /// Whether `key` holds at least one value.
    async fn attribute_exists(&self, id: RecordId, key: &str) -> Result<bool, StoreError>;

    /// Make reclassified records visible to the serving layer.
    async fn refresh_serving_index(&self) -> Result<(), StoreError>;
}

/// A record held by [`MemoryRecordStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryRecord {
    pub record_type: String,
    pub attributes: BTreeMap<String, Vec<String>>,
}

/// In-memory record store.
///
/// Supports fault injection so callers can exercise the failure paths of a
/// migration without a real backend.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<BTreeMap<RecordId, MemoryRecord>>,
    /// When non-empty, reclassifying to a type outside this set fails.
    known_types: RwLock<HashSet<String>>,
    failing_reclassify: RwLock<HashSet<RecordId>>,
    failing_attribute_writes: RwLock<HashMap<RecordId, HashSet<String>>>,
    failing_attribute_reads: RwLock<HashMap<RecordId, HashSet<String>>>,
    listing_unavailable: AtomicBool,
    index_refreshes: AtomicU64,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `count` records of `record_type` with ids `first..first + count`.
    pub async fn seed(&self, record_type: &str, first: u64, count: u64) {
        let mut records = self.records.write().await;
        for id in first..first + count {
            records.insert(
                RecordId(id),
                MemoryRecord {
                    record_type: record_type.to_string(),
                    attributes: BTreeMap::new(),
                },
            );
        }
    }

    pub async fn insert(&self, id: RecordId, record: MemoryRecord) {
        self.records.write().await.insert(id, record);
    }

    pub async fn record(&self, id: RecordId) -> Option<MemoryRecord> {
        self.records.read().await.get(&id).cloned()
    }

    /// Restrict reclassification to the given types.
    pub async fn register_types<'a>(&self, types: impl IntoIterator<Item = &'a str>) {
        let mut known = self.known_types.write().await;
        known.extend(types.into_iter().map(str::to_string));
    }

    /// Make reclassification of `id` fail.
    pub async fn fail_reclassify(&self, id: RecordId) {
        self.failing_reclassify.write().await.insert(id);
    }

    /// Make writes to `key` on `id` fail.
    pub async fn fail_attribute_writes(&self, id: RecordId, key: &str) {
        self.failing_attribute_writes
            .write()
            .await
            .entry(id)
            .or_default()
            .insert(key.to_string());
    }

    /// Make reads of `key` on `id` fail.
    pub async fn fail_attribute_reads(&self, id: RecordId, key: &str) {
        self.failing_attribute_reads
            .write()
            .await
            .entry(id)
            .or_default()
            .insert(key.to_string());
    }

    /// Make identifier listing fail until switched back.
    pub fn set_listing_unavailable(&self, unavailable: bool) {
        self.listing_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// How many times the serving index was refreshed.
    pub fn index_refreshes(&self) -> u64 {
        self.index_refreshes.load(Ordering::SeqCst)
    }

    fn check_listing(&self) -> Result<(), StoreError> {
        if self.listing_unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("listing disabled".to_string()));
        }
        Ok(())
    }

    async fn check_read(&self, id: RecordId, key: &str) -> Result<(), StoreError> {
        let failing = self.failing_attribute_reads.read().await;
        if failing.get(&id).is_some_and(|keys| keys.contains(key)) {
            return Err(StoreError::Backend(format!("read of {key} on {id} rejected")));
        }
        Ok(())
    }

    async fn check_write(&self, id: RecordId, key: &str) -> Result<(), StoreError> {
        let failing = self.failing_attribute_writes.read().await;
        if failing.get(&id).is_some_and(|keys| keys.contains(key)) {
            return Err(StoreError::Backend(format!("write to {key} on {id} rejected")));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn count_by_type(&self, record_type: &str) -> Result<u64, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| r.record_type == record_type)
            .count() as u64)
    }

    async fn list_ids_by_type(
        &self,
        record_type: &str,
        limit: usize,
        offset: u64,
    ) -> Result<Vec<RecordId>, StoreError> {
        self.check_listing()?;
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|(_, r)| r.record_type == record_type)
            .skip(offset as usize)
            .take(limit)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn list_ids_after(
        &self,
        record_type: &str,
        limit: usize,
        after: Option<RecordId>,
    ) -> Result<Vec<RecordId>, StoreError> {
        self.check_listing()?;
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|(id, r)| r.record_type == record_type && after.is_none_or(|a| **id > a))
            .take(limit)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn reclassify(&self, id: RecordId, new_type: &str) -> Result<(), StoreError> {
        if self.failing_reclassify.read().await.contains(&id) {
            return Err(StoreError::Backend(format!("reclassify of {id} rejected")));
        }
        {
            let known = self.known_types.read().await;
            if !known.is_empty() && !known.contains(new_type) {
                return Err(StoreError::UnknownType(new_type.to_string()));
            }
        }
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(StoreError::RecordNotFound(id))?;
        record.record_type = new_type.to_string();
        Ok(())
    }

    async fn get_attribute_values(&self, id: RecordId, key: &str) -> Result<Vec<String>, StoreError> {
        self.check_read(id, key).await?;
        let records = self.records.read().await;
        let record = records.get(&id).ok_or(StoreError::RecordNotFound(id))?;
        Ok(record.attributes.get(key).cloned().unwrap_or_default())
    }

    async fn add_attribute_value(&self, id: RecordId, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_write(id, key).await?;
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(StoreError::RecordNotFound(id))?;
        record
            .attributes
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
        Ok(())
    }

    async fn delete_attribute_values(&self, id: RecordId, key: &str) -> Result<(), StoreError> {
        self.check_write(id, key).await?;
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(StoreError::RecordNotFound(id))?;
        record.attributes.remove(key);
        Ok(())
    }

    async fn attribute_exists(&self, id: RecordId, key: &str) -> Result<bool, StoreError> {
        self.check_read(id, key).await?;
        let records = self.records.read().await;
        let record = records.get(&id).ok_or(StoreError::RecordNotFound(id))?;
        Ok(record.attributes.get(key).is_some_and(|values| !values.is_empty()))
    }

    async fn refresh_serving_index(&self) -> Result<(), StoreError> {
        self.index_refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

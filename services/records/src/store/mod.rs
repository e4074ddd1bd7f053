//! Record stores
//!
//! Reads go straight to the store. Every write goes through a replace
//! session: an exclusive window that can read the full set, clear it, insert
//! the new set in batches and then commit. Readers observe either the state
//! before the session or the state after its commit, never a mix. Only one
//! session may be open per store; a second attempt fails with
//! `StoreError::Busy` instead of waiting.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgRecordStore;

use crate::error::StoreError;
use crate::query::{MeasureTotals, RecordFilter};
use crate::record::{FilterField, Record, StoredRecord};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// A record the store refused to persist
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertFailure {
    /// Position of the record in the submitted sequence
    pub index: usize,
    /// Driver error detail
    pub message: String,
}

/// Outcome of a batched insert
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertReport {
    pub inserted: usize,
    pub failures: Vec<InsertFailure>,
}

impl InsertReport {
    fn merge(&mut self, other: InsertReport) {
        self.inserted += other.inserted;
        self.failures.extend(other.failures);
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn count(&self, filter: &RecordFilter) -> Result<u64, StoreError>;

    /// Matching records in insertion order
    async fn find(
        &self,
        filter: &RecordFilter,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    /// Measure sums over every matching record
    async fn totals(&self, filter: &RecordFilter) -> Result<MeasureTotals, StoreError>;

    /// Distinct non-null values of a filter field, sorted
    async fn distinct(&self, field: FilterField) -> Result<Vec<String>, StoreError>;

    /// Open the exclusive write window
    async fn begin_replace(&self) -> Result<Box<dyn ReplaceSession>, StoreError>;
}

/// Exclusive write window on a store.
///
/// Nothing is visible to readers until `commit`; dropping the session
/// discards every change made through it.
#[async_trait]
pub trait ReplaceSession: Send {
    /// Full current contents, as seen inside the session
    async fn load_all(&mut self) -> Result<Vec<Record>, StoreError>;

    /// Remove every record, returning how many were removed
    async fn delete_all(&mut self) -> Result<u64, StoreError>;

    /// Insert one batch. Records the store rejects are reported with their
    /// position offset by `start_index` and do not stop the rest of the batch.
    async fn insert_batch(
        &mut self,
        batch: &[Record],
        start_index: usize,
    ) -> Result<InsertReport, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Insert records in fixed-size batches, logging progress
pub async fn insert_in_batches(
    session: &mut dyn ReplaceSession,
    records: &[Record],
    batch_size: usize,
) -> Result<InsertReport, StoreError> {
    let mut report = InsertReport::default();
    let total = records.len();

    for (batch_idx, batch) in records.chunks(batch_size.max(1)).enumerate() {
        let start_index = batch_idx * batch_size.max(1);
        let batch_report = session.insert_batch(batch, start_index).await?;
        for failure in &batch_report.failures {
            warn!(index = failure.index, error = %failure.message, "record rejected by store");
        }
        report.merge(batch_report);
        info!(
            inserted = report.inserted,
            processed = start_index + batch.len(),
            total,
            "inserted batch"
        );
    }

    Ok(report)
}

/// Replace the whole store contents with `records`
pub async fn replace_all(
    store: &dyn RecordStore,
    records: &[Record],
    batch_size: usize,
) -> Result<(u64, InsertReport), StoreError> {
    let mut session = store.begin_replace().await?;
    let deleted = session.delete_all().await?;
    info!(deleted, "existing data cleared");
    let report = insert_in_batches(session.as_mut(), records, batch_size).await?;
    session.commit().await?;
    Ok((deleted, report))
}

/// Add `records` to the current contents
pub async fn append_all(
    store: &dyn RecordStore,
    records: &[Record],
    batch_size: usize,
) -> Result<InsertReport, StoreError> {
    let mut session = store.begin_replace().await?;
    let report = insert_in_batches(session.as_mut(), records, batch_size).await?;
    session.commit().await?;
    Ok(report)
}

/// Remove every record
pub async fn clear_all(store: &dyn RecordStore) -> Result<u64, StoreError> {
    let mut session = store.begin_replace().await?;
    let deleted = session.delete_all().await?;
    session.commit().await?;
    Ok(deleted)
}

use super::{InsertFailure, InsertReport, RecordStore, ReplaceSession};
use crate::error::StoreError;
use crate::query::{MeasureTotals, RecordFilter};
use crate::record::{FilterField, Record, StoredRecord};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// In-process store with the same read and replace semantics as the
/// Postgres store. Used by tests and by the API when `STORE=memory`.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<RwLock<Vec<StoredRecord>>>,
    writer: Arc<Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store preloaded with `records`, bypassing insert validation
    pub fn with_records(records: impl IntoIterator<Item = Record>) -> Self {
        let stored = records.into_iter().map(StoredRecord::new).collect();
        Self {
            records: Arc::new(RwLock::new(stored)),
            writer: Arc::default(),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&[StoredRecord]) -> T) -> T {
        let guard = self.records.read().unwrap_or_else(PoisonError::into_inner);
        f(guard.as_slice())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn count(&self, filter: &RecordFilter) -> Result<u64, StoreError> {
        Ok(self.read(|all| all.iter().filter(|s| filter.matches(&s.record)).count() as u64))
    }

    async fn find(
        &self,
        filter: &RecordFilter,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let skip = usize::try_from(skip).unwrap_or(usize::MAX);
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(self.read(|all| {
            all.iter()
                .filter(|s| filter.matches(&s.record))
                .skip(skip)
                .take(limit)
                .cloned()
                .collect()
        }))
    }

    async fn totals(&self, filter: &RecordFilter) -> Result<MeasureTotals, StoreError> {
        Ok(self.read(|all| {
            let mut totals = MeasureTotals::default();
            for stored in all.iter().filter(|s| filter.matches(&s.record)) {
                totals.add_record(&stored.record);
            }
            totals
        }))
    }

    async fn distinct(&self, field: FilterField) -> Result<Vec<String>, StoreError> {
        Ok(self.read(|all| {
            all.iter()
                .filter_map(|s| s.record.filter_text(field))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        }))
    }

    async fn begin_replace(&self) -> Result<Box<dyn ReplaceSession>, StoreError> {
        let guard = self
            .writer
            .clone()
            .try_lock_owned()
            .map_err(|_| StoreError::Busy)?;
        let staged = self.read(|all| all.to_vec());
        Ok(Box::new(MemorySession {
            _guard: guard,
            target: Arc::clone(&self.records),
            staged,
        }))
    }
}

/// Staged copy of the store, swapped in on commit
struct MemorySession {
    _guard: OwnedMutexGuard<()>,
    target: Arc<RwLock<Vec<StoredRecord>>>,
    staged: Vec<StoredRecord>,
}

#[async_trait]
impl ReplaceSession for MemorySession {
    async fn load_all(&mut self) -> Result<Vec<Record>, StoreError> {
        Ok(self.staged.iter().map(|s| s.record.clone()).collect())
    }

    async fn delete_all(&mut self) -> Result<u64, StoreError> {
        let deleted = self.staged.len() as u64;
        self.staged.clear();
        Ok(deleted)
    }

    async fn insert_batch(
        &mut self,
        batch: &[Record],
        start_index: usize,
    ) -> Result<InsertReport, StoreError> {
        let mut report = InsertReport::default();
        for (offset, record) in batch.iter().enumerate() {
            match check_storable(record) {
                Ok(()) => {
                    self.staged.push(StoredRecord::new(record.clone()));
                    report.inserted += 1;
                }
                Err(message) => report.failures.push(InsertFailure {
                    index: start_index + offset,
                    message,
                }),
            }
        }
        Ok(report)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemorySession { _guard, target, staged } = *self;
        let mut records = target.write().unwrap_or_else(PoisonError::into_inner);
        *records = staged;
        Ok(())
    }
}

/// Postgres rejects NUL in JSONB text; reject it here too so both stores
/// fail on the same records.
fn check_storable(record: &Record) -> Result<(), String> {
    fn has_nul(value: &Value) -> bool {
        match value {
            Value::String(s) => s.contains('\0'),
            Value::Array(items) => items.iter().any(has_nul),
            Value::Object(map) => map.iter().any(|(k, v)| k.contains('\0') || has_nul(v)),
            Value::Null | Value::Bool(_) | Value::Number(_) => false,
        }
    }

    for (field, value) in record.fields() {
        if field.contains('\0') || has_nul(value) {
            return Err(format!(
                "unsupported Unicode escape sequence: \\u0000 cannot be stored in field '{}'",
                field.replace('\0', "\\u0000")
            ));
        }
    }
    Ok(())
}

//! Consolidation - merges records sharing a composite key
//!
//! Records are grouped by (CategoryShortName, branch, SupplierAlias,
//! ArticleNo). A group with one member is kept as-is; a larger group becomes
//! a copy of its first member with the four measures replaced by the group
//! sums. Lifecycle fields never survive: consolidated records are new
//! entities.
//!
//! The grouping and merging are pure. `Consolidator` applies the result to a
//! store inside a replace session, so the read and the rewrite happen in one
//! exclusive window.

use crate::error::StoreError;
use crate::record::{Measure, MeasureValue, Record, RecordKey};
use crate::store::{insert_in_batches, InsertFailure, RecordStore};
use indexmap::IndexMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

// ============================================================================
// Pure consolidation
// ============================================================================

/// Group records by composite key, keeping first-seen order of both the
/// groups and the members inside each group
pub fn group_by_key(records: Vec<Record>) -> IndexMap<RecordKey, Vec<Record>> {
    let mut groups: IndexMap<RecordKey, Vec<Record>> = IndexMap::new();
    for record in records {
        groups.entry(record.key()).or_default().push(record);
    }
    groups
}

/// Merge one group into a single record. Returns `None` for an empty group.
pub fn merge_group(mut group: Vec<Record>) -> Option<Record> {
    if group.len() <= 1 {
        let mut single = group.pop()?;
        single.strip_lifecycle();
        return Some(single);
    }

    let mut sums = [0.0_f64; 4];
    for record in &group {
        for (slot, measure) in sums.iter_mut().zip(Measure::ALL) {
            *slot += record.measure(measure).as_f64();
        }
    }

    let mut merged = group.swap_remove(0);
    merged.strip_lifecycle();
    for (sum, measure) in sums.into_iter().zip(Measure::ALL) {
        merged.set_measure(measure, sum);
    }
    Some(merged)
}

/// Outcome of consolidating one record set
#[derive(Debug, Clone, PartialEq)]
pub struct Consolidation {
    pub records: Vec<Record>,
    pub original_count: usize,
    pub duplicates_removed: usize,
    /// Measure values in merged groups that were present but not numeric
    pub coerced_to_zero: usize,
}

impl Consolidation {
    pub fn consolidated_count(&self) -> usize {
        self.records.len()
    }

    pub fn has_duplicates(&self) -> bool {
        self.duplicates_removed > 0
    }

    /// Share of the original records removed by merging, in percent
    pub fn space_saved_pct(&self) -> f64 {
        if self.original_count == 0 {
            return 0.0;
        }
        self.duplicates_removed as f64 / self.original_count as f64 * 100.0
    }
}

/// Consolidate a full record set
pub fn consolidate(records: Vec<Record>) -> Consolidation {
    let original_count = records.len();
    let groups = group_by_key(records);

    let mut duplicates_removed = 0;
    let mut coerced_to_zero = 0;
    let mut consolidated = Vec::with_capacity(groups.len());

    for (key, group) in groups {
        if group.len() > 1 {
            duplicates_removed += group.len() - 1;
            let unparseable = group
                .iter()
                .flat_map(|r| Measure::ALL.map(|m| r.measure(m)))
                .filter(|v| matches!(v, MeasureValue::Unparseable))
                .count();
            if unparseable > 0 {
                warn!(%key, unparseable, "non-numeric measure values counted as 0");
            }
            coerced_to_zero += unparseable;
        }
        consolidated.extend(merge_group(group));
    }

    Consolidation {
        records: consolidated,
        original_count,
        duplicates_removed,
        coerced_to_zero,
    }
}

// ============================================================================
// Applying to a store
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationStatus {
    /// Store contents were replaced with the consolidated set
    Applied,
    /// Store was empty, nothing to do
    Empty,
    /// No duplicates found, nothing to do
    AlreadyConsolidated,
    /// Computed but not written
    DryRun,
}

/// Report of one consolidation run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationSummary {
    pub status: ConsolidationStatus,
    pub original_count: usize,
    pub consolidated_count: usize,
    pub duplicates_removed: usize,
    pub inserted_count: usize,
    pub failures: Vec<InsertFailure>,
    pub coerced_to_zero: usize,
    pub space_saved_pct: f64,
}

impl ConsolidationSummary {
    fn from_plan(plan: &Consolidation, status: ConsolidationStatus) -> Self {
        let consolidated_count = match status {
            ConsolidationStatus::Empty | ConsolidationStatus::AlreadyConsolidated => {
                plan.original_count
            }
            ConsolidationStatus::Applied | ConsolidationStatus::DryRun => {
                plan.consolidated_count()
            }
        };
        Self {
            status,
            original_count: plan.original_count,
            consolidated_count,
            duplicates_removed: plan.duplicates_removed,
            inserted_count: 0,
            failures: Vec::new(),
            coerced_to_zero: plan.coerced_to_zero,
            space_saved_pct: plan.space_saved_pct(),
        }
    }
}

/// Runs consolidation against a store, at most one run at a time
pub struct Consolidator {
    store: Arc<dyn RecordStore>,
    batch_size: usize,
    running: Mutex<()>,
}

impl Consolidator {
    pub fn new(store: Arc<dyn RecordStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            running: Mutex::new(()),
        }
    }

    /// Consolidate and rewrite the store
    pub async fn run(&self) -> Result<ConsolidationSummary, StoreError> {
        self.execute(false).await
    }

    /// Compute what a run would do without writing anything
    pub async fn preview(&self) -> Result<ConsolidationSummary, StoreError> {
        self.execute(true).await
    }

    async fn execute(&self, dry_run: bool) -> Result<ConsolidationSummary, StoreError> {
        let _guard = self.running.try_lock().map_err(|_| StoreError::Busy)?;

        let mut session = self.store.begin_replace().await?;

        info!("fetching all records");
        let records = session.load_all().await?;
        info!(count = records.len(), "fetched records");

        if records.is_empty() {
            info!("no data found, nothing to consolidate");
            return Ok(ConsolidationSummary::from_plan(
                &consolidate(records),
                ConsolidationStatus::Empty,
            ));
        }

        let plan = consolidate(records);
        info!(
            original = plan.original_count,
            unique = plan.consolidated_count(),
            duplicates = plan.duplicates_removed,
            "grouped records by category, branch, supplier and article"
        );

        if !plan.has_duplicates() {
            info!("no duplicates found, store is already consolidated");
            return Ok(ConsolidationSummary::from_plan(
                &plan,
                ConsolidationStatus::AlreadyConsolidated,
            ));
        }

        if dry_run {
            return Ok(ConsolidationSummary::from_plan(&plan, ConsolidationStatus::DryRun));
        }

        let deleted = session.delete_all().await?;
        info!(deleted, "cleared existing records");

        let report = insert_in_batches(session.as_mut(), &plan.records, self.batch_size).await?;
        session.commit().await?;

        let mut summary = ConsolidationSummary::from_plan(&plan, ConsolidationStatus::Applied);
        summary.inserted_count = report.inserted;
        summary.failures = report.failures;

        info!(
            original = summary.original_count,
            consolidated = summary.consolidated_count,
            merged = summary.duplicates_removed,
            inserted = summary.inserted_count,
            failed = summary.failures.len(),
            space_saved_pct = summary.space_saved_pct,
            "consolidation complete"
        );
        Ok(summary)
    }
}

// =============================================================================
// TESTS
// =============================================================================

//! Postgres-backed record store
//!
//! Each record is one row: the record body as JSONB plus the canonical text
//! of its three filter fields in plain columns, so filtering and distinct
//! lookups are ordinary indexed SQL and agree with `RecordFilter::matches`.
//!
//! Replace sessions run in a single transaction holding a transaction-scoped
//! advisory lock. The lock is shared by every process using the database, so
//! the CLI tools and the API cannot interleave their rewrites.

use super::{InsertFailure, InsertReport, RecordStore, ReplaceSession};
use crate::error::StoreError;
use crate::query::{MeasureTotals, RecordFilter};
use crate::record::{FilterField, Measure, Record, StoredRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Acquire, PgConnection, PgPool, Postgres, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

/// Advisory lock key guarding replace sessions
const REPLACE_LOCK_KEY: i64 = 0x5a1e_5d0c;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sales_records (
        seq         BIGSERIAL   NOT NULL,
        record_id   UUID        PRIMARY KEY,
        category    TEXT,
        branch      TEXT,
        supplier    TEXT,
        doc         JSONB       NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS sales_records_seq_idx ON sales_records (seq)",
    "CREATE INDEX IF NOT EXISTS sales_records_category_idx ON sales_records (category)",
    "CREATE INDEX IF NOT EXISTS sales_records_branch_idx ON sales_records (branch)",
    "CREATE INDEX IF NOT EXISTS sales_records_supplier_idx ON sales_records (supplier)",
];

/// `$1`..`$3` are the category, branch and supplier allow-lists, NULL when
/// unrestricted
const FILTER_CLAUSE: &str = r#"
    ($1::text[] IS NULL OR category = ANY($1))
    AND ($2::text[] IS NULL OR branch = ANY($2))
    AND ($3::text[] IS NULL OR supplier = ANY($3))
"#;

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    record_id: Uuid,
    doc: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RecordRow> for StoredRecord {
    fn from(row: RecordRow) -> Self {
        StoredRecord {
            id: row.record_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            record: record_from_doc(row.doc),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MeasureRow {
    net_sls_qty: Option<Value>,
    net_amount: Option<Value>,
    net_sls_cost_value: Option<Value>,
    sls_ext_cost_value: Option<Value>,
}

fn record_from_doc(doc: Value) -> Record {
    match doc {
        Value::Object(map) => Record::from(map),
        _ => Record::new(),
    }
}

fn filter_binds(filter: &RecordFilter) -> [Option<Vec<String>>; 3] {
    FilterField::ALL.map(|field| {
        filter
            .allowed(field)
            .map(|values| values.iter().cloned().collect())
    })
}

#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(db_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(db_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create the records table and its indexes if missing
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn count(&self, filter: &RecordFilter) -> Result<u64, StoreError> {
        let [categories, branches, suppliers] = filter_binds(filter);
        let (count,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM sales_records WHERE {FILTER_CLAUSE}"
        ))
        .bind(categories)
        .bind(branches)
        .bind(suppliers)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn find(
        &self,
        filter: &RecordFilter,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let [categories, branches, suppliers] = filter_binds(filter);
        let rows: Vec<RecordRow> = sqlx::query_as(&format!(
            r#"
            SELECT record_id, doc, created_at, updated_at
            FROM sales_records
            WHERE {FILTER_CLAUSE}
            ORDER BY seq
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(categories)
        .bind(branches)
        .bind(suppliers)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(skip).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(StoredRecord::from).collect())
    }

    async fn totals(&self, filter: &RecordFilter) -> Result<MeasureTotals, StoreError> {
        // Summed here rather than in SQL so coercion is identical to the
        // consolidator's.
        let [categories, branches, suppliers] = filter_binds(filter);
        let rows: Vec<MeasureRow> = sqlx::query_as(&format!(
            r#"
            SELECT doc->'NetSlsQty'       AS net_sls_qty,
                   doc->'NetAmount'       AS net_amount,
                   doc->'NetSlsCostValue' AS net_sls_cost_value,
                   doc->'SlsExtCostValue' AS sls_ext_cost_value
            FROM sales_records
            WHERE {FILTER_CLAUSE}
            "#
        ))
        .bind(categories)
        .bind(branches)
        .bind(suppliers)
        .fetch_all(&self.pool)
        .await?;

        let mut totals = MeasureTotals::default();
        for row in &rows {
            totals.add(Measure::NetSlsQty, row.net_sls_qty.as_ref());
            totals.add(Measure::NetAmount, row.net_amount.as_ref());
            totals.add(Measure::NetSlsCostValue, row.net_sls_cost_value.as_ref());
            totals.add(Measure::SlsExtCostValue, row.sls_ext_cost_value.as_ref());
        }
        Ok(totals)
    }

    async fn distinct(&self, field: FilterField) -> Result<Vec<String>, StoreError> {
        let sql = match field {
            FilterField::Category => {
                "SELECT DISTINCT category FROM sales_records WHERE category IS NOT NULL"
            }
            FilterField::Branch => {
                "SELECT DISTINCT branch FROM sales_records WHERE branch IS NOT NULL"
            }
            FilterField::Supplier => {
                "SELECT DISTINCT supplier FROM sales_records WHERE supplier IS NOT NULL"
            }
        };
        let rows: Vec<(String,)> = sqlx::query_as(sql).fetch_all(&self.pool).await?;

        // Byte order, not the database collation
        let mut values: Vec<String> = rows.into_iter().map(|(v,)| v).collect();
        values.sort();
        Ok(values)
    }

    async fn begin_replace(&self) -> Result<Box<dyn ReplaceSession>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_xact_lock($1)")
            .bind(REPLACE_LOCK_KEY)
            .fetch_one(&mut *tx)
            .await?;
        if !locked {
            return Err(StoreError::Busy);
        }
        Ok(Box::new(PgReplaceSession { tx }))
    }
}

struct PgReplaceSession {
    tx: Transaction<'static, Postgres>,
}

/// Columns for one row, in insert order
struct InsertRow {
    record_id: Uuid,
    category: Option<String>,
    branch: Option<String>,
    supplier: Option<String>,
    doc: Value,
}

impl InsertRow {
    fn new(record: &Record) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            category: record.filter_text(FilterField::Category),
            branch: record.filter_text(FilterField::Branch),
            supplier: record.filter_text(FilterField::Supplier),
            doc: Value::Object(record.as_map().clone()),
        }
    }
}

/// One multi-row INSERT for the whole slice
async fn insert_rows(conn: &mut PgConnection, rows: &[InsertRow]) -> Result<u64, sqlx::Error> {
    let ids: Vec<Uuid> = rows.iter().map(|r| r.record_id).collect();
    let categories: Vec<Option<String>> = rows.iter().map(|r| r.category.clone()).collect();
    let branches: Vec<Option<String>> = rows.iter().map(|r| r.branch.clone()).collect();
    let suppliers: Vec<Option<String>> = rows.iter().map(|r| r.supplier.clone()).collect();
    let docs: Vec<Value> = rows.iter().map(|r| r.doc.clone()).collect();

    let result = sqlx::query(
        r#"
        INSERT INTO sales_records (record_id, category, branch, supplier, doc)
        SELECT * FROM UNNEST($1::uuid[], $2::text[], $3::text[], $4::text[], $5::jsonb[])
        "#,
    )
    .bind(ids)
    .bind(categories)
    .bind(branches)
    .bind(suppliers)
    .bind(docs)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

#[async_trait]
impl ReplaceSession for PgReplaceSession {
    async fn load_all(&mut self) -> Result<Vec<Record>, StoreError> {
        let rows: Vec<(Value,)> = sqlx::query_as("SELECT doc FROM sales_records ORDER BY seq")
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows.into_iter().map(|(doc,)| record_from_doc(doc)).collect())
    }

    async fn delete_all(&mut self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM sales_records")
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_batch(
        &mut self,
        batch: &[Record],
        start_index: usize,
    ) -> Result<InsertReport, StoreError> {
        let rows: Vec<InsertRow> = batch.iter().map(InsertRow::new).collect();
        let mut report = InsertReport::default();

        let mut savepoint = (&mut self.tx).begin().await?;
        match insert_rows(&mut savepoint, &rows).await {
            Ok(inserted) => {
                savepoint.commit().await?;
                report.inserted = inserted as usize;
                return Ok(report);
            }
            Err(e) => {
                savepoint.rollback().await?;
                warn!(start_index, size = rows.len(), error = %e, "batch rejected, retrying record by record");
            }
        }

        for (offset, row) in rows.iter().enumerate() {
            let mut savepoint = (&mut self.tx).begin().await?;
            match insert_rows(&mut savepoint, std::slice::from_ref(row)).await {
                Ok(inserted) => {
                    savepoint.commit().await?;
                    report.inserted += inserted as usize;
                }
                Err(e) => {
                    savepoint.rollback().await?;
                    report.failures.push(InsertFailure {
                        index: start_index + offset,
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        info!("replace committed");
        Ok(())
    }
}

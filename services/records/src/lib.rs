//! Sales records: ingestion, consolidation and filtered reads over a
//! pluggable record store.

pub mod config;
pub mod consolidate;
pub mod error;
pub mod import;
pub mod ingest;
pub mod query;
pub mod record;
pub mod store;

pub use config::{init_tracing, StoreBackend, StoreConfig};
pub use consolidate::{consolidate, ConsolidationStatus, ConsolidationSummary, Consolidator};
pub use error::{ConfigError, IngestError, QueryError, StoreError};
pub use import::{import_records, ImportMode, ImportSummary};
pub use ingest::{ingest, IngestedUpload, UploadFormat};
pub use query::{
    FilterOptions, MeasureTotals, PageRequest, Pagination, QueryService, RecordFilter, RecordPage,
};
pub use record::{FilterField, Measure, Record, StoredRecord};
pub use store::{InsertFailure, MemoryStore, PgRecordStore, RecordStore};

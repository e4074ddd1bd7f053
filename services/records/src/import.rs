//! Loading parsed uploads into a store

use crate::error::StoreError;
use crate::ingest::IngestedUpload;
use crate::store::{append_all, replace_all, InsertFailure, RecordStore};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImportMode {
    /// Clear the store, then insert
    #[default]
    Replace,
    /// Insert next to the existing records
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub records_parsed: usize,
    pub inserted: usize,
    /// Records removed before inserting, zero when appending
    pub deleted: u64,
    pub failures: Vec<InsertFailure>,
    pub content_hash: String,
}

pub async fn import_records(
    store: &dyn RecordStore,
    upload: &IngestedUpload,
    mode: ImportMode,
    batch_size: usize,
) -> Result<ImportSummary, StoreError> {
    let (deleted, report) = match mode {
        ImportMode::Replace => replace_all(store, &upload.records, batch_size).await?,
        ImportMode::Append => (0, append_all(store, &upload.records, batch_size).await?),
    };

    info!(
        mode = ?mode,
        parsed = upload.records.len(),
        inserted = report.inserted,
        failed = report.failures.len(),
        deleted,
        "import complete"
    );

    Ok(ImportSummary {
        records_parsed: upload.records.len(),
        inserted: report.inserted,
        deleted,
        failures: report.failures,
        content_hash: upload.content_hash.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{ingest, UploadFormat};
    use crate::query::RecordFilter;
    use crate::store::MemoryStore;

    const CSV: &[u8] = b"CategoryShortName,branch,ArticleNo,NetAmount\nA,B1,1,10\nA,B1,1,5\nA,B2,2,1\n";

    #[tokio::test]
    async fn test_replace_import() {
        let store = MemoryStore::with_records(ingest(UploadFormat::Csv, b"x\n1\n").unwrap().records);
        let upload = ingest(UploadFormat::Csv, CSV).unwrap();

        let summary = import_records(&store, &upload, ImportMode::Replace, 2).await.unwrap();
        assert_eq!(summary.records_parsed, 3);
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.deleted, 1);
        assert!(summary.failures.is_empty());
        assert_eq!(summary.content_hash, upload.content_hash);
        assert_eq!(store.count(&RecordFilter::default()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_append_import() {
        let store = MemoryStore::new();
        let upload = ingest(UploadFormat::Csv, CSV).unwrap();
        import_records(&store, &upload, ImportMode::Append, 1000).await.unwrap();
        let summary = import_records(&store, &upload, ImportMode::Append, 1000).await.unwrap();
        assert_eq!(summary.deleted, 0);
        assert_eq!(store.count(&RecordFilter::default()).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_import_reports_rejected_rows() {
        let store = MemoryStore::new();
        let upload = ingest(UploadFormat::Csv, b"branch,Note\nB1,ok\nB2,bad\x00\n").unwrap();
        let summary = import_records(&store, &upload, ImportMode::Replace, 1000).await.unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].index, 1);
    }
}

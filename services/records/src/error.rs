use thiserror::Error;

/// Failures talking to a record store
#[derive(Debug, Error)]
pub enum StoreError {
    /// A replace session is already open on this store
    #[error("another import or consolidation is already running")]
    Busy,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// Failures turning uploaded bytes into records
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unsupported file type '{0}', expected CSV or an Excel workbook")]
    UnsupportedFormat(String),
    #[error("failed to read CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to open workbook: {0}")]
    Workbook(String),
    #[error("workbook has no sheets")]
    NoSheets,
    #[error("uploaded file contains no records")]
    Empty,
}

/// Invalid query input
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid filter '{param}': expected a JSON array ({source})")]
    InvalidFilter {
        param: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Invalid configuration values
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} env var missing")]
    Missing(&'static str),
    #[error("invalid value '{value}' for {name}")]
    Invalid { name: &'static str, value: String },
}
